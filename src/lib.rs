pub mod cli;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod netascii;
pub mod options;
pub mod packet;
pub mod server;
pub mod timeout;
pub mod window;

pub use crate::cli::Cli;
pub use crate::client::{Client, ClientConfig, TransferStats};
pub use crate::packet::Packet;
pub use crate::server::{Server, ServerConfig};

pub const DEF_BLOCK_SIZE: u16 = 512; // RFC 1350
pub const MIN_BLOCK_SIZE: u16 = 8; // RFC 2348
pub const MAX_BLOCK_SIZE: u16 = 65464; // RFC 2348

pub const DEF_WINDOW_SIZE: u16 = 1; // RFC 7440

/// Largest RRQ/WRQ accepted on the listening port.
pub const MAX_REQUEST_SIZE: usize = 512;

pub const DEF_SERVER_PORT: u16 = 6969;
pub const DEF_SERVER_RETRIES: u32 = 5;
pub const DEF_SERVER_TIMEOUT_SEC: u64 = 2;

pub const DEF_CLIENT_RETRIES: u32 = 3;
pub const DEF_CLIENT_TIMEOUT_SEC: u64 = 1;
