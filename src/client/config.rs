use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::options::{OptionSet, TimeoutValue};
use crate::packet::{Mode, RequestKind};
use crate::{DEF_CLIENT_RETRIES, DEF_CLIENT_TIMEOUT_SEC, DEF_SERVER_PORT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// TFTP client configuration. Options left as `None` are not requested.
///
/// ```rust
/// use tftpx::client::ClientConfig;
///
/// let config = ClientConfig::new("127.0.0.1:69".parse().unwrap())
///     .with_block_size(1428)
///     .with_window_size(8)
///     .with_tsize(true);
/// assert_eq!(config.block_size, Some(1428));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    /// Consecutive timeouts tolerated before a request fails
    pub retries: u32,
    /// Local retransmission timeout unless the server adopts `timeout`
    pub timeout: Duration,
    pub mode: Mode,
    pub block_size: Option<u16>,
    pub window_size: Option<u16>,
    pub timeout_option: Option<TimeoutValue>,
    pub use_tsize: bool,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            retries: DEF_CLIENT_RETRIES,
            timeout: Duration::from_secs(DEF_CLIENT_TIMEOUT_SEC),
            mode: Mode::Octet,
            block_size: None,
            window_size: None,
            timeout_option: None,
            use_tsize: false,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_block_size(mut self, block_size: u16) -> Self {
        self.block_size = Some(block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE));
        self
    }

    pub fn with_window_size(mut self, window_size: u16) -> Self {
        self.window_size = Some(window_size.max(1));
        self
    }

    /// Asks the server to use `timeout`; zero seconds is not a valid value
    /// and clears the option.
    pub fn with_timeout_option(mut self, timeout: TimeoutValue) -> Self {
        self.timeout_option = match timeout {
            TimeoutValue::Seconds(0) => None,
            other => Some(other),
        };
        self
    }

    pub fn with_tsize(mut self, use_tsize: bool) -> Self {
        self.use_tsize = use_tsize;
        self
    }

    /// The same request without any options, for servers predating RFC 2347.
    pub fn without_options(&self) -> Self {
        Self {
            block_size: None,
            window_size: None,
            timeout_option: None,
            use_tsize: false,
            ..self.clone()
        }
    }

    /// Options to put on a request. `size` is the local file size, sent as
    /// `tsize` on a write.
    pub fn requested_options(&self, kind: RequestKind, size: Option<u64>) -> OptionSet {
        let transfer_size = match kind {
            _ if !self.use_tsize => None,
            RequestKind::Read => Some(0),
            RequestKind::Write => size,
        };
        OptionSet {
            block_size: self.block_size,
            timeout: self.timeout_option,
            transfer_size,
            window_size: self.window_size,
            read_type: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEF_SERVER_PORT))
    }
}
