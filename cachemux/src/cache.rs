//! The public command surface: get/set/add/replace/delete/incr/decr/touch/
//! gat/cas/gets/version/stat/flush_all, with consistent-hash routing and
//! quarantine-driven failover.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cachemux_core::{HashRing, Pool};
use tracing::warn;

use crate::config::{CacheConfig, ManagerConfig, Server};
use crate::connection::{Connection, ConnectionFactory};
use crate::error::Error;
use crate::health::HealthMonitor;
use crate::multi::MultiOpEngine;
use crate::protocol::{Opcode, RequestFrame, ResponseFrame, Status};

fn storage_extras(flags: u32, expiration: u32) -> Bytes {
    let mut b = BytesMut::with_capacity(8);
    b.extend_from_slice(&flags.to_be_bytes());
    b.extend_from_slice(&expiration.to_be_bytes());
    b.freeze()
}

fn delta_extras(delta: u64, initial: u64, expiration: u32) -> Bytes {
    let mut b = BytesMut::with_capacity(20);
    b.extend_from_slice(&delta.to_be_bytes());
    b.extend_from_slice(&initial.to_be_bytes());
    b.extend_from_slice(&expiration.to_be_bytes());
    b.freeze()
}

fn expiration_extras(expiration: u32) -> Bytes {
    Bytes::copy_from_slice(&expiration.to_be_bytes())
}

/// One logical cache: a hash ring, a pool of connections per server, and a
/// background health monitor.
pub struct Cache {
    ring: Arc<HashRing<Server>>,
    pool: Pool<Server, Connection, ConnectionFactory>,
    health: Arc<HealthMonitor>,
    config: CacheConfig,
    multi: MultiOpEngine,
    health_task: Option<tokio::task::JoinHandle<()>>,
}

impl Cache {
    pub async fn new(config: ManagerConfig) -> Result<Self, Error> {
        let ring = Arc::new(HashRing::new(config.cache.hash_algorithm));
        for server in &config.servers {
            ring.add(server.clone());
        }
        let pool = Pool::new(
            ConnectionFactory::new(config.cache.connect_timeout),
            config.cache.pool.to_core(),
        );
        let health = HealthMonitor::new(ring.clone(), pool.clone());
        let health_task = health.spawn(config.cache.health_check_interval);
        let multi = MultiOpEngine::new(ring.clone(), pool.clone(), health.clone());

        let cache = Cache {
            ring,
            pool,
            health,
            config: config.cache,
            multi,
            health_task,
        };
        for server in &config.servers {
            if let Err(e) = cache.pool.preload_min(server).await {
                warn!(server = %server, error = ?e, "initial preload failed");
            }
        }
        Ok(cache)
    }

    pub fn server_count(&self) -> usize {
        self.ring.server_count()
    }

    pub fn is_quarantined(&self, server: &Server) -> bool {
        self.health.is_quarantined(server)
    }

    fn max_attempts(&self) -> usize {
        self.config
            .max_failover_attempts
            .min(self.ring.server_count().saturating_sub(1))
            + 1
    }

    fn is_retryable(e: &Error) -> bool {
        matches!(
            e,
            Error::Transport(_) | Error::Timeout | Error::PoolExhausted | Error::NoValidObject | Error::PoolClosed
        )
    }

    /// Route `key` to a server, borrow a connection, run one request built
    /// by `build` (given the opaque to stamp it with), and retry on a
    /// different server (via quarantine + re-lookup) on a retryable error.
    async fn execute(
        &self,
        key: &[u8],
        build: impl Fn(u32) -> RequestFrame,
    ) -> Result<ResponseFrame, Error> {
        let max_attempts = self.max_attempts();
        let mut attempts = 0;
        loop {
            let server = self.ring.lookup(key).ok_or(Error::NoServerAvailable)?;
            let timeout_ms = self
                .config
                .response_timeout
                .map(|d| d.as_millis() as i64)
                .unwrap_or(-1);

            let mut pooled = match self.pool.borrow(&server, timeout_ms).await {
                Ok(p) => p,
                Err(e) => {
                    let e = Error::from(e);
                    self.health.quarantine(&server);
                    attempts += 1;
                    if attempts >= max_attempts {
                        return Err(e);
                    }
                    continue;
                }
            };

            let opaque = pooled.get_mut().next_opaque();
            let frame = build(opaque);
            match pooled
                .get_mut()
                .roundtrip(&frame, self.config.write_timeout, self.config.response_timeout)
                .await
            {
                Ok(resp) => {
                    pooled.return_to().await;
                    return Ok(resp);
                }
                Err(e) => {
                    pooled.invalidate().await;
                    if Self::is_retryable(&e) {
                        self.health.quarantine(&server);
                        attempts += 1;
                        if attempts >= max_attempts {
                            return Err(e);
                        }
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        let resp = self
            .execute(key, |opaque| {
                RequestFrame::new(Opcode::Get, opaque).with_key(Bytes::copy_from_slice(key))
            })
            .await?;
        match resp.status()? {
            Status::NoError => Ok(Some(resp.value)),
            Status::KeyNotFound => Ok(None),
            other => Err(Error::ServerStatus(other)),
        }
    }

    /// `get` plus the CAS token needed for a subsequent `cas()`.
    pub async fn gets(&self, key: &[u8]) -> Result<Option<(Bytes, u64)>, Error> {
        let resp = self
            .execute(key, |opaque| {
                RequestFrame::new(Opcode::Get, opaque).with_key(Bytes::copy_from_slice(key))
            })
            .await?;
        match resp.status()? {
            Status::NoError => Ok(Some((resp.value, resp.cas))),
            Status::KeyNotFound => Ok(None),
            other => Err(Error::ServerStatus(other)),
        }
    }

    async fn store(
        &self,
        opcode: Opcode,
        key: &[u8],
        value: Bytes,
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Result<bool, Error> {
        let extras = storage_extras(flags, expiration);
        let resp = self
            .execute(key, |opaque| {
                RequestFrame::new(opcode, opaque)
                    .with_key(Bytes::copy_from_slice(key))
                    .with_extras(extras.clone())
                    .with_value(value.clone())
                    .with_cas(cas)
            })
            .await?;
        match resp.status()? {
            Status::NoError => Ok(true),
            Status::KeyExists | Status::ItemNotStored => Ok(false),
            other => Err(Error::ServerStatus(other)),
        }
    }

    pub async fn set(&self, key: &[u8], value: Bytes, flags: u32, expiration: u32) -> Result<(), Error> {
        self.store(Opcode::Set, key, value, flags, expiration, 0).await?;
        Ok(())
    }

    pub async fn add(&self, key: &[u8], value: Bytes, flags: u32, expiration: u32) -> Result<bool, Error> {
        self.store(Opcode::Add, key, value, flags, expiration, 0).await
    }

    pub async fn replace(&self, key: &[u8], value: Bytes, flags: u32, expiration: u32) -> Result<bool, Error> {
        self.store(Opcode::Replace, key, value, flags, expiration, 0).await
    }

    /// Compare-and-swap: succeeds only if the stored item's CAS token still
    /// matches `cas` (as returned by a prior `gets`). Returns `false` on a
    /// CAS conflict (`KeyExists`) or if the key no longer exists.
    pub async fn cas(
        &self,
        key: &[u8],
        value: Bytes,
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Result<bool, Error> {
        self.store(Opcode::Set, key, value, flags, expiration, cas).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        let resp = self
            .execute(key, |opaque| {
                RequestFrame::new(Opcode::Delete, opaque).with_key(Bytes::copy_from_slice(key))
            })
            .await?;
        match resp.status()? {
            // delete is idempotent: a not-found key is a successful no-op.
            Status::NoError | Status::KeyNotFound => Ok(true),
            other => Err(Error::ServerStatus(other)),
        }
    }

    async fn delta(&self, opcode: Opcode, key: &[u8], delta: u64, initial: u64, expiration: u32) -> Result<u64, Error> {
        let extras = delta_extras(delta, initial, expiration);
        let resp = self
            .execute(key, |opaque| {
                RequestFrame::new(opcode, opaque)
                    .with_key(Bytes::copy_from_slice(key))
                    .with_extras(extras.clone())
            })
            .await?;
        match resp.status()? {
            Status::NoError => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&resp.value[..8]);
                Ok(u64::from_be_bytes(buf))
            }
            other => Err(Error::ServerStatus(other)),
        }
    }

    pub async fn increment(&self, key: &[u8], delta: u64, initial: u64, expiration: u32) -> Result<u64, Error> {
        self.delta(Opcode::Increment, key, delta, initial, expiration).await
    }

    pub async fn decrement(&self, key: &[u8], delta: u64, initial: u64, expiration: u32) -> Result<u64, Error> {
        self.delta(Opcode::Decrement, key, delta, initial, expiration).await
    }

    pub async fn touch(&self, key: &[u8], expiration: u32) -> Result<bool, Error> {
        let extras = expiration_extras(expiration);
        let resp = self
            .execute(key, |opaque| {
                RequestFrame::new(Opcode::Touch, opaque)
                    .with_key(Bytes::copy_from_slice(key))
                    .with_extras(extras.clone())
            })
            .await?;
        match resp.status()? {
            Status::NoError => Ok(true),
            Status::KeyNotFound => Ok(false),
            other => Err(Error::ServerStatus(other)),
        }
    }

    /// Get-and-touch: fetch the value while resetting its expiration.
    pub async fn gat(&self, key: &[u8], expiration: u32) -> Result<Option<Bytes>, Error> {
        let extras = expiration_extras(expiration);
        let resp = self
            .execute(key, |opaque| {
                RequestFrame::new(Opcode::GAT, opaque)
                    .with_key(Bytes::copy_from_slice(key))
                    .with_extras(extras.clone())
            })
            .await?;
        match resp.status()? {
            Status::NoError => Ok(Some(resp.value)),
            Status::KeyNotFound => Ok(None),
            other => Err(Error::ServerStatus(other)),
        }
    }

    pub async fn multi_get(&self, keys: &[Bytes]) -> std::collections::HashMap<Bytes, Bytes> {
        self.multi
            .multi_get(keys, self.config.write_timeout, self.config.response_timeout)
            .await
    }

    /// Unconditionally store every item in `items`, scattered across
    /// servers by key. Returns a per-key outcome map, `false` on a rejected
    /// write or an unreachable server group.
    pub async fn multi_set(&self, items: &[crate::multi::WriteItem]) -> std::collections::HashMap<Bytes, bool> {
        self.multi
            .multi_set(items, self.config.write_timeout, self.config.response_timeout)
            .await
    }

    /// Compare-and-swap every item in `items` against the CAS token it
    /// carries. Returns a per-key outcome map, `false` on a CAS conflict, a
    /// missing key, or an unreachable server group.
    pub async fn multi_cas(&self, items: &[crate::multi::WriteItem]) -> std::collections::HashMap<Bytes, bool> {
        self.multi
            .multi_cas(items, self.config.write_timeout, self.config.response_timeout)
            .await
    }

    /// Delete every key in `keys`. Delete is idempotent, so an
    /// already-absent key still counts as a successful outcome. Returns
    /// `false` only for keys whose server group could not be reached.
    pub async fn multi_delete(&self, keys: &[Bytes]) -> std::collections::HashMap<Bytes, bool> {
        self.multi
            .multi_delete(keys, self.config.write_timeout, self.config.response_timeout)
            .await
    }

    fn live_servers(&self) -> Vec<Server> {
        let mut seen = HashSet::new();
        self.ring
            .snapshot()
            .into_iter()
            .filter_map(|(_, s)| if seen.insert(s.clone()) { Some(s) } else { None })
            .collect()
    }

    /// Per-server `version` probe, tolerant of individual server failures.
    pub async fn version(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for server in self.live_servers() {
            let timeout_ms = self
                .config
                .response_timeout
                .map(|d| d.as_millis() as i64)
                .unwrap_or(-1);
            match self.pool.borrow(&server, timeout_ms).await {
                Ok(mut pooled) => {
                    match pooled
                        .get_mut()
                        .probe_version(self.config.response_timeout.unwrap_or(Duration::from_secs(5)))
                        .await
                    {
                        Ok(v) => {
                            pooled.return_to().await;
                            out.insert(server.to_string(), v);
                        }
                        Err(e) => {
                            warn!(server = %server, error = ?e, "version probe failed");
                            pooled.invalidate().await;
                        }
                    }
                }
                Err(e) => warn!(server = %server, error = ?e, "could not borrow connection for version"),
            }
        }
        out
    }

    /// Per-server `stat` dump, tolerant of individual server failures.
    pub async fn stat(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for server in self.live_servers() {
            match self.stat_one(&server).await {
                Ok(stats) => {
                    out.insert(server.to_string(), stats);
                }
                Err(e) => warn!(server = %server, error = ?e, "stat failed"),
            }
        }
        out
    }

    async fn stat_one(&self, server: &Server) -> Result<BTreeMap<String, String>, Error> {
        let timeout_ms = self
            .config
            .response_timeout
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1);
        let mut pooled = self.pool.borrow(server, timeout_ms).await.map_err(Error::from)?;
        let opaque = pooled.get_mut().next_opaque();
        let req = RequestFrame::new(Opcode::Stat, opaque);

        let mut out = BTreeMap::new();
        let result: Result<(), Error> = async {
            pooled
                .get_mut()
                .roundtrip_no_read(&req, self.config.write_timeout)
                .await?;
            loop {
                let resp = pooled.get_mut().read_response(self.config.response_timeout).await?;
                if resp.key.is_empty() {
                    break;
                }
                out.insert(
                    String::from_utf8_lossy(&resp.key).into_owned(),
                    String::from_utf8_lossy(&resp.value).into_owned(),
                );
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                pooled.return_to().await;
                Ok(out)
            }
            Err(e) => {
                pooled.invalidate().await;
                Err(e)
            }
        }
    }

    /// Flush every server. Best-effort: a server that fails to flush is
    /// logged and skipped rather than failing the whole call.
    pub async fn flush_all(&self, expiration: u32) {
        let extras = expiration_extras(expiration);
        for server in self.live_servers() {
            let timeout_ms = self
                .config
                .response_timeout
                .map(|d| d.as_millis() as i64)
                .unwrap_or(-1);
            match self.pool.borrow(&server, timeout_ms).await {
                Ok(mut pooled) => {
                    let opaque = pooled.get_mut().next_opaque();
                    let req = RequestFrame::new(Opcode::Flush, opaque).with_extras(extras.clone());
                    match pooled
                        .get_mut()
                        .roundtrip(&req, self.config.write_timeout, self.config.response_timeout)
                        .await
                    {
                        Ok(_) => pooled.return_to().await,
                        Err(e) => {
                            warn!(server = %server, error = ?e, "flush_all failed");
                            pooled.invalidate().await;
                        }
                    }
                }
                Err(e) => warn!(server = %server, error = ?e, "could not borrow connection for flush_all"),
            }
        }
    }

    /// Tear down every pool and stop the health monitor. The cache is
    /// unusable afterward.
    pub async fn shutdown(&self) {
        self.pool.destroy_all();
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(handle) = &self.health_task {
            handle.abort();
        }
    }
}
