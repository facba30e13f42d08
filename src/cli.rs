use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientConfig;
use crate::options::TimeoutValue;
use crate::packet::Mode;
use crate::server::{ServerConfig, MAX_SESSIONS_PER_WORKER};
use crate::{
    DEF_BLOCK_SIZE, DEF_CLIENT_RETRIES, DEF_CLIENT_TIMEOUT_SEC, DEF_SERVER_PORT, DEF_SERVER_RETRIES,
    DEF_SERVER_TIMEOUT_SEC, DEF_WINDOW_SIZE,
};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftpx")]
#[command(about = "A windowed TFTP client/server", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server
    Serve(ServeArgs),
    /// Download a file
    Get {
        #[command(flatten)]
        client: ClientArgs,
        /// Remote file
        remote: String,
        /// Local file, defaults to the remote file name
        local: Option<PathBuf>,
    },
    /// Upload a file
    Put {
        #[command(flatten)]
        client: ClientArgs,
        /// Local file
        local: PathBuf,
        /// Remote file, defaults to the local file name
        remote: Option<String>,
    },
    /// List a server directory
    List {
        #[command(flatten)]
        client: ClientArgs,
        /// Remote directory
        #[arg(default_value = ".")]
        dir: String,
    },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen ip
    #[arg(short, long, default_value = "::")]
    pub ip: IpAddr,

    /// Listen port
    #[arg(short, long, default_value_t = DEF_SERVER_PORT)]
    pub port: u16,

    /// Root directory
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,

    /// Timeout (ms) when the client does not negotiate one
    #[arg(short, long, default_value_t = DEF_SERVER_TIMEOUT_SEC * 1000)]
    pub timeout: u64,

    /// Max retries
    #[arg(short, long, default_value_t = DEF_SERVER_RETRIES)]
    pub retry: u32,

    /// Worker threads [default: cores - 1]
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Sessions per worker
    #[arg(short, long, default_value_t = MAX_SESSIONS_PER_WORKER)]
    pub sessions: usize,

    /// Accept write requests
    #[arg(long)]
    pub enable_write_requests: bool,

    /// Accept directory listing requests
    #[arg(long)]
    pub enable_list_requests: bool,

    /// Accept timeout=adaptive
    #[arg(long)]
    pub enable_adaptive_timeout: bool,

    /// Server stats interval (s)
    #[arg(long, default_value_t = 60)]
    pub stats_interval: u64,
}

impl ServeArgs {
    pub fn config(&self, root: PathBuf) -> ServerConfig {
        let config = ServerConfig::new(self.ip, self.port, root)
            .with_timeout(Duration::from_millis(self.timeout))
            .with_retries(self.retry)
            .with_sessions_per_worker(self.sessions)
            .with_write_requests(self.enable_write_requests)
            .with_list_requests(self.enable_list_requests)
            .with_adaptive_timeout(self.enable_adaptive_timeout)
            .with_stats_interval(Duration::from_secs(self.stats_interval));
        match self.workers {
            Some(workers) => config.with_workers(workers),
            None => config,
        }
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server ip
    #[arg(short, long, default_value = "127.0.0.1")]
    pub ip: IpAddr,

    /// Server port
    #[arg(short, long, default_value_t = DEF_SERVER_PORT)]
    pub port: u16,

    /// Block size
    #[arg(short, long, default_value_t = DEF_BLOCK_SIZE)]
    pub blksize: u16,

    /// Window size
    #[arg(short, long, default_value_t = 10)]
    pub windowsize: u16,

    /// Timeout (ms)
    #[arg(short, long, default_value_t = DEF_CLIENT_TIMEOUT_SEC * 1000)]
    pub timeout: u64,

    /// Max retries
    #[arg(short, long, default_value_t = DEF_CLIENT_RETRIES)]
    pub retry: u32,

    /// Ask the server for an adaptive timeout
    #[arg(short, long)]
    pub adaptive_timeout: bool,

    /// Request the transfer size
    #[arg(long)]
    pub use_tsize: bool,

    /// Transfer mode (octet, netascii)
    #[arg(short, long, default_value = "octet")]
    pub mode: Mode,
}

impl ClientArgs {
    /// Block and window size are only requested when they differ from the
    /// protocol defaults.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(SocketAddr::new(self.ip, self.port))
            .with_timeout(Duration::from_millis(self.timeout))
            .with_retries(self.retry)
            .with_mode(self.mode)
            .with_tsize(self.use_tsize);
        if self.blksize != DEF_BLOCK_SIZE {
            config = config.with_block_size(self.blksize);
        }
        if self.windowsize != DEF_WINDOW_SIZE {
            config = config.with_window_size(self.windowsize);
        }
        if self.adaptive_timeout {
            config = config.with_timeout_option(TimeoutValue::Adaptive);
        }
        config
    }
}
