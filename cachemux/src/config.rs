//! Typed configuration surface. Builder-style structs with `Default` impls
//! carrying the numeric defaults, the way `volo_thrift::transport::pool::Config`
//! shapes its own pool configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use cachemux_core::HashAlgorithm;

use crate::error::Error;

/// One backend server, identified by host and port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Server {
    pub host: Box<str>,
    pub port: u16,
}

impl Server {
    pub fn new(host: impl Into<Box<str>>, port: u16) -> Self {
        Server {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Server {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("\"{s}\" is not in host:port form")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("\"{port}\" is not a valid port")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("\"{s}\" has an empty host")));
        }
        Ok(Server::new(host, port))
    }
}

/// Parse a comma-separated `host:port` server list, trimming whitespace
/// around each entry and collapsing duplicates while preserving first-seen
/// order.
pub fn from_server_list(list: &str) -> Result<Vec<Server>, Error> {
    let mut servers = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let server: Server = entry.parse()?;
        if !servers.contains(&server) {
            servers.push(server);
        }
    }
    Ok(servers)
}

/// Pool sizing and validation policy, applied identically to every
/// server's connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub max: Option<usize>,
    pub borrow_validation: bool,
    pub return_validation: bool,
    pub disposable: bool,
    pub keep_alive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min: 1,
            max: Some(10),
            borrow_validation: false,
            return_validation: true,
            disposable: true,
            keep_alive: Some(Duration::from_secs(30)),
        }
    }
}

impl PoolConfig {
    pub fn min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    pub fn max(mut self, max: Option<usize>) -> Self {
        self.max = max;
        self
    }

    pub fn borrow_validation(mut self, on: bool) -> Self {
        self.borrow_validation = on;
        self
    }

    pub fn return_validation(mut self, on: bool) -> Self {
        self.return_validation = on;
        self
    }

    pub fn disposable(mut self, on: bool) -> Self {
        self.disposable = on;
        self
    }

    pub fn keep_alive(mut self, dur: Option<Duration>) -> Self {
        self.keep_alive = dur;
        self
    }

    pub(crate) fn to_core(&self) -> cachemux_core::PoolConfig {
        cachemux_core::PoolConfig {
            min: self.min,
            max: self.max,
            borrow_validation: self.borrow_validation,
            return_validation: self.return_validation,
            disposable: self.disposable,
            keep_alive: self.keep_alive,
        }
    }
}

/// Per-cache behavior: timeouts, hashing, health monitoring, pooling.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on establishing a new TCP connection. `None` means block
    /// indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Upper bound on writing a request (or a quiet batch) to the wire.
    /// Applied independently per server group for multi-ops.
    pub write_timeout: Option<Duration>,
    /// Upper bound on waiting for a response once a request has been
    /// written. Applied independently per server group for multi-ops.
    pub response_timeout: Option<Duration>,
    pub hash_algorithm: HashAlgorithm,
    /// Interval between `version` health probes of quarantined servers.
    /// A zero interval disables the background probe loop entirely.
    pub health_check_interval: Duration,
    /// Upper bound on retry-on-a-different-server attempts for one logical
    /// operation; the effective bound is `min(this, live_servers - 1)`.
    pub max_failover_attempts: usize,
    pub pool: PoolConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            connect_timeout: Some(Duration::from_millis(5000)),
            write_timeout: Some(Duration::from_millis(5000)),
            response_timeout: Some(Duration::from_millis(10000)),
            hash_algorithm: HashAlgorithm::default(),
            health_check_interval: Duration::from_secs(5),
            max_failover_attempts: 2,
            pool: PoolConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn connect_timeout(mut self, dur: Option<Duration>) -> Self {
        self.connect_timeout = dur;
        self
    }

    pub fn write_timeout(mut self, dur: Option<Duration>) -> Self {
        self.write_timeout = dur;
        self
    }

    pub fn response_timeout(mut self, dur: Option<Duration>) -> Self {
        self.response_timeout = dur;
        self
    }

    pub fn hash_algorithm(mut self, algo: HashAlgorithm) -> Self {
        self.hash_algorithm = algo;
        self
    }

    pub fn health_check_interval(mut self, dur: Duration) -> Self {
        self.health_check_interval = dur;
        self
    }

    pub fn max_failover_attempts(mut self, n: usize) -> Self {
        self.max_failover_attempts = n;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Top-level configuration handed to `CacheManager::new`.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub servers: Vec<Server>,
    pub cache: CacheConfig,
}

impl ManagerConfig {
    pub fn new(servers: Vec<Server>) -> Self {
        ManagerConfig {
            servers,
            cache: CacheConfig::default(),
        }
    }

    pub fn from_server_list(list: &str) -> Result<Self, Error> {
        Ok(ManagerConfig::new(from_server_list(list)?))
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_dedupes_server_list() {
        let servers = from_server_list(" a:1 , b:2,a:1 , c:3 ").unwrap();
        assert_eq!(
            servers,
            vec![Server::new("a", 1), Server::new("b", 2), Server::new("c", 3)]
        );
    }

    #[test]
    fn rejects_malformed_entry() {
        assert!(from_server_list("a:1,not-a-server").is_err());
    }

    #[test]
    fn display_roundtrips_through_from_str() {
        let s = Server::new("cache01.internal", 11211);
        let parsed: Server = s.to_string().parse().unwrap();
        assert_eq!(s, parsed);
    }
}
