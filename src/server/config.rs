use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::{DEF_SERVER_PORT, DEF_SERVER_RETRIES, DEF_SERVER_TIMEOUT_SEC};

/// Most sessions a single worker multiplexes.
pub const MAX_SESSIONS_PER_WORKER: usize = 32;

/// TFTP server configuration
///
/// # Example
///
/// ```rust
/// use tftpx::server::ServerConfig;
/// use std::path::PathBuf;
///
/// let config = ServerConfig::new("127.0.0.1".parse().unwrap(), 6969, PathBuf::from("/srv/tftp"))
///     .with_write_requests(true)
///     .with_workers(2);
/// assert_eq!(config.workers, 2);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// IP address to listen on. `::` also accepts IPv4 peers.
    pub host: IpAddr,
    /// Port number to listen on
    pub port: u16,
    /// Directory requests are resolved against
    pub root: PathBuf,
    /// Consecutive timeouts tolerated before a session gives up
    pub retries: u32,
    /// Retransmission timeout when the client does not negotiate one
    pub timeout: Duration,
    /// Number of worker threads
    pub workers: usize,
    /// Concurrent sessions per worker
    pub sessions_per_worker: usize,
    /// Accept WRQ
    pub enable_write_requests: bool,
    /// Accept RRQ carrying `read-type=directory`
    pub enable_list_requests: bool,
    /// Accept `timeout=adaptive`
    pub enable_adaptive_timeout: bool,
    /// How often aggregate server stats are logged
    pub stats_interval: Duration,
}

impl ServerConfig {
    pub fn new(host: IpAddr, port: u16, root: PathBuf) -> Self {
        Self {
            host,
            port,
            root,
            retries: DEF_SERVER_RETRIES,
            timeout: Duration::from_secs(DEF_SERVER_TIMEOUT_SEC),
            workers: default_workers(),
            sessions_per_worker: MAX_SESSIONS_PER_WORKER,
            enable_write_requests: false,
            enable_list_requests: false,
            enable_adaptive_timeout: false,
            stats_interval: Duration::from_secs(60),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_sessions_per_worker(mut self, sessions: usize) -> Self {
        self.sessions_per_worker = sessions.clamp(1, usize::from(u16::MAX));
        self
    }

    pub fn with_write_requests(mut self, enable: bool) -> Self {
        self.enable_write_requests = enable;
        self
    }

    pub fn with_list_requests(mut self, enable: bool) -> Self {
        self.enable_list_requests = enable;
        self
    }

    pub fn with_adaptive_timeout(mut self, enable: bool) -> Self {
        self.enable_adaptive_timeout = enable;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            DEF_SERVER_PORT,
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        )
    }
}

/// One core is left to the listener.
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}
