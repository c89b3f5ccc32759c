//! Live/Quarantined state machine. A server that fails a request is pulled
//! out of the hash ring and probed periodically with `version` until it
//! answers again, at which point it rejoins the ring and its pool is
//! preloaded back up to `min`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cachemux_core::{HashRing, Pool};
use parking_lot::Mutex;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::Server;
use crate::connection::{Connection, ConnectionFactory};

pub struct HealthMonitor {
    ring: Arc<HashRing<Server>>,
    pool: Pool<Server, Connection, ConnectionFactory>,
    quarantined: Mutex<HashSet<Server>>,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(ring: Arc<HashRing<Server>>, pool: Pool<Server, Connection, ConnectionFactory>) -> Arc<Self> {
        Arc::new(HealthMonitor {
            ring,
            pool,
            quarantined: Mutex::new(HashSet::new()),
            probe_timeout: Duration::from_millis(500),
        })
    }

    pub fn is_quarantined(&self, server: &Server) -> bool {
        self.quarantined.lock().contains(server)
    }

    pub fn quarantined_servers(&self) -> Vec<Server> {
        self.quarantined.lock().iter().cloned().collect()
    }

    /// Pull `server` out of rotation. A no-op if it's already quarantined.
    pub fn quarantine(&self, server: &Server) {
        let newly = self.quarantined.lock().insert(server.clone());
        if newly {
            warn!(server = %server, "quarantining server after a failed request");
            self.ring.remove(server);
            self.pool.clear(server);
        }
    }

    /// Spawn the periodic revival-probe loop on the current tokio runtime,
    /// returning a handle the caller can abort on shutdown. A zero interval
    /// disables the probe loop entirely (`tokio::time::interval` panics on
    /// a zero duration) and this returns `None`.
    pub fn spawn(self: &Arc<Self>, interval_dur: Duration) -> Option<tokio::task::JoinHandle<()>> {
        if interval_dur.is_zero() {
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(interval_dur);
            loop {
                ticker.tick().await;
                this.probe_once().await;
            }
        }))
    }

    async fn probe_once(&self) {
        let candidates = self.quarantined_servers();
        for server in candidates {
            match self.pool.borrow(&server, self.probe_timeout.as_millis() as i64).await {
                Ok(mut pooled) => {
                    let result = pooled.get_mut().probe_version(self.probe_timeout).await;
                    match result {
                        Ok(_version) => {
                            pooled.return_to().await;
                            self.revive(&server).await;
                        }
                        Err(_) => {
                            pooled.invalidate().await;
                        }
                    }
                }
                Err(_) => {
                    // pool has no connection and couldn't create one; still
                    // quarantined, try again next tick.
                }
            }
        }
    }

    async fn revive(&self, server: &Server) {
        self.quarantined.lock().remove(server);
        self.ring.add(server.clone());
        info!(server = %server, "server revived, rejoining ring");
        if let Err(e) = self.pool.preload_min(server).await {
            warn!(server = %server, error = ?e, "preload after revival failed");
        }
    }
}
