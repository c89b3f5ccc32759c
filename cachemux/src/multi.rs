//! Scatter/gather multi-op engine: partition keys by ring membership, send
//! one quiet-then-NOOP batch per server, and aggregate. A server whose group
//! fails (timeout, transport error) is quarantined; its keys are reported as
//! failures rather than aborting the whole call -- no multi-op fails
//! outright because one shard is down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cachemux_core::HashRing;
use tracing::warn;

use crate::config::Server;
use crate::connection::{Connection, ConnectionFactory};
use crate::health::HealthMonitor;
use crate::protocol::{Opcode, RequestFrame};

fn storage_extras(flags: u32, expiration: u32) -> Bytes {
    let mut b = BytesMut::with_capacity(8);
    b.extend_from_slice(&flags.to_be_bytes());
    b.extend_from_slice(&expiration.to_be_bytes());
    b.freeze()
}

/// One key's pending write: its value, storage flags, expiration, and the
/// CAS token to stamp on the request (0 for an unconditional `multi_set`).
#[derive(Debug, Clone)]
pub struct WriteItem {
    pub key: Bytes,
    pub value: Bytes,
    pub flags: u32,
    pub expiration: u32,
    pub cas: u64,
}

pub struct MultiOpEngine {
    ring: Arc<HashRing<Server>>,
    pool: cachemux_core::Pool<Server, Connection, ConnectionFactory>,
    health: Arc<HealthMonitor>,
}

impl MultiOpEngine {
    pub fn new(
        ring: Arc<HashRing<Server>>,
        pool: cachemux_core::Pool<Server, Connection, ConnectionFactory>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        MultiOpEngine { ring, pool, health }
    }

    /// Fetch every key in `keys`, returning whatever values came back.
    /// Missing keys (cache misses, or keys routed to a down server) are
    /// simply absent from the result map.
    pub async fn multi_get(
        &self,
        keys: &[Bytes],
        write_timeout: Option<Duration>,
        response_timeout: Option<Duration>,
    ) -> HashMap<Bytes, Bytes> {
        let mut groups: HashMap<Server, Vec<Bytes>> = HashMap::new();
        for key in keys {
            if let Some(server) = self.ring.lookup(key) {
                groups.entry(server).or_default().push(key.clone());
            }
        }

        let mut handles = Vec::with_capacity(groups.len());
        for (server, keys) in groups {
            let pool = self.pool.clone();
            handles.push(tokio::spawn(async move {
                fetch_group(pool, server, keys, write_timeout, response_timeout).await
            }));
        }

        let mut out = HashMap::with_capacity(keys.len());
        for handle in handles {
            match handle.await {
                Ok(Ok((_server, partial))) => out.extend(partial),
                Ok(Err((server, e))) => {
                    warn!(server = %server, error = ?e, "multi-get group failed, quarantining");
                    self.health.quarantine(&server);
                }
                Err(join_err) => {
                    warn!(error = ?join_err, "multi-get group task panicked");
                }
            }
        }
        out
    }

    /// Unconditionally store every item, per-key. A key's outcome is `false`
    /// if its write was rejected (e.g. `Add`-like constraints don't apply
    /// here, but a malformed value or an out-of-memory server does) or if
    /// the key's whole server group failed.
    pub async fn multi_set(
        &self,
        items: &[WriteItem],
        write_timeout: Option<Duration>,
        response_timeout: Option<Duration>,
    ) -> HashMap<Bytes, bool> {
        self.scatter_store(items, write_timeout, response_timeout).await
    }

    /// Compare-and-swap every item against the CAS token it carries. A key's
    /// outcome is `false` on a CAS conflict, a missing key, or a failed
    /// server group.
    pub async fn multi_cas(
        &self,
        items: &[WriteItem],
        write_timeout: Option<Duration>,
        response_timeout: Option<Duration>,
    ) -> HashMap<Bytes, bool> {
        self.scatter_store(items, write_timeout, response_timeout).await
    }

    async fn scatter_store(
        &self,
        items: &[WriteItem],
        write_timeout: Option<Duration>,
        response_timeout: Option<Duration>,
    ) -> HashMap<Bytes, bool> {
        let mut groups: HashMap<Server, Vec<WriteItem>> = HashMap::new();
        let mut out = HashMap::with_capacity(items.len());
        for item in items {
            match self.ring.lookup(&item.key) {
                Some(server) => groups.entry(server).or_default().push(item.clone()),
                None => {
                    out.insert(item.key.clone(), false);
                }
            }
        }

        let mut handles = Vec::with_capacity(groups.len());
        for (server, items) in groups {
            let pool = self.pool.clone();
            handles.push(tokio::spawn(async move {
                store_group(pool, server, items, write_timeout, response_timeout).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok((_server, partial))) => out.extend(partial),
                Ok(Err((server, keys, e))) => {
                    warn!(server = %server, error = ?e, "multi-store group failed, quarantining");
                    self.health.quarantine(&server);
                    out.extend(keys.into_iter().map(|k| (k, false)));
                }
                Err(join_err) => {
                    warn!(error = ?join_err, "multi-store group task panicked");
                }
            }
        }
        out
    }

    /// Delete every key, per-key. Delete is idempotent: a key that was
    /// already absent counts as a successful outcome (`true`), matching
    /// `Cache::delete`'s single-key contract. A key's outcome is `false`
    /// only if its server group could not be reached at all.
    pub async fn multi_delete(
        &self,
        keys: &[Bytes],
        write_timeout: Option<Duration>,
        response_timeout: Option<Duration>,
    ) -> HashMap<Bytes, bool> {
        let mut groups: HashMap<Server, Vec<Bytes>> = HashMap::new();
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.ring.lookup(key) {
                Some(server) => groups.entry(server).or_default().push(key.clone()),
                None => {
                    out.insert(key.clone(), false);
                }
            }
        }

        let mut handles = Vec::with_capacity(groups.len());
        for (server, keys) in groups {
            let pool = self.pool.clone();
            handles.push(tokio::spawn(async move {
                delete_group(pool, server, keys, write_timeout, response_timeout).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok((_server, partial))) => out.extend(partial),
                Ok(Err((server, keys, e))) => {
                    warn!(server = %server, error = ?e, "multi-delete group failed, quarantining");
                    self.health.quarantine(&server);
                    out.extend(keys.into_iter().map(|k| (k, false)));
                }
                Err(join_err) => {
                    warn!(error = ?join_err, "multi-delete group task panicked");
                }
            }
        }
        out
    }
}

async fn fetch_group(
    pool: cachemux_core::Pool<Server, Connection, ConnectionFactory>,
    server: Server,
    keys: Vec<Bytes>,
    write_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
) -> Result<(Server, HashMap<Bytes, Bytes>), (Server, crate::error::Error)> {
    let timeout_ms = response_timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);
    let mut pooled = pool
        .borrow(&server, timeout_ms)
        .await
        .map_err(|e| (server.clone(), crate::error::Error::from(e)))?;

    let requests: Vec<RequestFrame> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| RequestFrame::new(Opcode::GetQ, i as u32).with_key(key.clone()))
        .collect();
    let noop_opaque = keys.len() as u32;

    let result = pooled
        .get_mut()
        .send_quiet_batch(&requests, noop_opaque, write_timeout, response_timeout)
        .await;

    match result {
        Ok(responses) => {
            pooled.return_to().await;
            let mut out = HashMap::with_capacity(responses.len());
            for (opaque, frame) in responses {
                if frame.is_success() {
                    if let Some(key) = keys.get(opaque as usize) {
                        out.insert(key.clone(), frame.value);
                    }
                }
            }
            Ok((server, out))
        }
        Err(e) => {
            pooled.invalidate().await;
            Err((server, e))
        }
    }
}

/// Send a quiet `SetQ` batch for `items`. Quiet store commands are silent on
/// success, so every key starts out `true` and is flipped to `false` only
/// when a response frame (necessarily an error, since success is silent)
/// comes back for its opaque index.
async fn store_group(
    pool: cachemux_core::Pool<Server, Connection, ConnectionFactory>,
    server: Server,
    items: Vec<WriteItem>,
    write_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
) -> Result<(Server, HashMap<Bytes, bool>), (Server, Vec<Bytes>, crate::error::Error)> {
    let timeout_ms = response_timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);
    let keys: Vec<Bytes> = items.iter().map(|i| i.key.clone()).collect();
    let mut pooled = pool
        .borrow(&server, timeout_ms)
        .await
        .map_err(|e| (server.clone(), keys.clone(), crate::error::Error::from(e)))?;

    let requests: Vec<RequestFrame> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            RequestFrame::new(Opcode::SetQ, i as u32)
                .with_key(item.key.clone())
                .with_extras(storage_extras(item.flags, item.expiration))
                .with_value(item.value.clone())
                .with_cas(item.cas)
        })
        .collect();
    let noop_opaque = items.len() as u32;

    let result = pooled
        .get_mut()
        .send_quiet_batch(&requests, noop_opaque, write_timeout, response_timeout)
        .await;

    match result {
        Ok(responses) => {
            pooled.return_to().await;
            let mut out: HashMap<Bytes, bool> = keys.iter().cloned().map(|k| (k, true)).collect();
            for (opaque, frame) in responses {
                if let Some(item) = items.get(opaque as usize) {
                    out.insert(item.key.clone(), frame.is_success());
                }
            }
            Ok((server, out))
        }
        Err(e) => {
            pooled.invalidate().await;
            Err((server, keys, e))
        }
    }
}

/// Send a quiet `DeleteQ` batch for `keys`. Like `store_group`, success is
/// silent; a response for a key's opaque index means the server reported an
/// error, but `KeyNotFound` is still treated as a successful no-op to match
/// `Cache::delete`'s idempotent contract.
async fn delete_group(
    pool: cachemux_core::Pool<Server, Connection, ConnectionFactory>,
    server: Server,
    keys: Vec<Bytes>,
    write_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
) -> Result<(Server, HashMap<Bytes, bool>), (Server, Vec<Bytes>, crate::error::Error)> {
    let timeout_ms = response_timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);
    let mut pooled = pool
        .borrow(&server, timeout_ms)
        .await
        .map_err(|e| (server.clone(), keys.clone(), crate::error::Error::from(e)))?;

    let requests: Vec<RequestFrame> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| RequestFrame::new(Opcode::DeleteQ, i as u32).with_key(key.clone()))
        .collect();
    let noop_opaque = keys.len() as u32;

    let result = pooled
        .get_mut()
        .send_quiet_batch(&requests, noop_opaque, write_timeout, response_timeout)
        .await;

    match result {
        Ok(responses) => {
            pooled.return_to().await;
            let mut out: HashMap<Bytes, bool> = keys.iter().cloned().map(|k| (k, true)).collect();
            for (opaque, frame) in responses {
                if let Some(key) = keys.get(opaque as usize) {
                    let ok = frame.is_success() || frame.status().ok() == Some(crate::protocol::Status::KeyNotFound);
                    out.insert(key.clone(), ok);
                }
            }
            Ok((server, out))
        }
        Err(e) => {
            pooled.invalidate().await;
            Err((server, keys, e))
        }
    }
}
