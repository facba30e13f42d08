//! TFTP client: GET, PUT and directory listing against one server.

mod config;
mod transfer;

pub use config::ClientConfig;
pub use transfer::TransferStats;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::RequestFailure;
use crate::netascii::{self, NetasciiReader};
use crate::options::READ_TYPE_DIRECTORY;
use crate::packet::{Mode, RequestKind};

#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Downloads `remote` into `sink`.
    pub async fn get_to<W: Write + ?Sized>(&self, remote: &str, sink: &mut W) -> Result<TransferStats, RequestFailure> {
        let requested = self.config.requested_options(RequestKind::Read, None);
        transfer::receive(&self.config, remote, &requested, sink).await
    }

    /// Downloads `remote` to the file `local`, which is removed again if the
    /// transfer fails.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<TransferStats, RequestFailure> {
        let mut file = BufWriter::new(File::create(local)?);
        let result = match self.get_to(remote, &mut file).await {
            Ok(stats) => file.flush().map(|()| stats).map_err(RequestFailure::from),
            Err(failure) => Err(failure),
        };
        if result.is_err() {
            drop(file);
            if let Err(e) = fs::remove_file(local) {
                log::debug!("could not remove {}: {e}", local.display());
            }
        }
        result
    }

    /// Uploads everything `source` yields as `remote`. `size` is announced
    /// as `tsize` when enabled.
    pub async fn put_from<R: Read + ?Sized>(
        &self,
        remote: &str,
        source: &mut R,
        size: Option<u64>,
    ) -> Result<TransferStats, RequestFailure> {
        let requested = self.config.requested_options(RequestKind::Write, size);
        transfer::send(&self.config, remote, &requested, source).await
    }

    /// Uploads the file `local` as `remote`, transcoding it in netascii mode.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<TransferStats, RequestFailure> {
        let file = File::open(local)?;
        match self.config.mode {
            Mode::Octet => {
                let size = file.metadata()?.len();
                self.put_from(remote, &mut BufReader::new(file), Some(size)).await
            }
            Mode::Netascii => {
                let size = netascii::encoded_len(BufReader::new(File::open(local)?))?;
                let mut reader = NetasciiReader::new(BufReader::new(file));
                self.put_from(remote, &mut reader, Some(size)).await
            }
        }
    }

    /// Fetches the listing of the server directory `dir`, one entry per line.
    pub async fn list(&self, dir: &str) -> Result<(Vec<u8>, TransferStats), RequestFailure> {
        let mut requested = self.config.requested_options(RequestKind::Read, None);
        requested.read_type = Some(READ_TYPE_DIRECTORY.to_string());
        let mut listing = Vec::new();
        let stats = transfer::receive(&self.config, dir, &requested, &mut listing).await?;
        Ok((listing, stats))
    }

    /// Like [`Client::get`], retrying once without options when the server
    /// looks like it does not support them.
    pub async fn get_with_fallback(&self, remote: &str, local: &Path) -> Result<TransferStats, RequestFailure> {
        match self.get(remote, local).await {
            Err(failure) if failure.server_may_not_support_options => {
                log::info!("GET {remote} failed ({failure}), retrying without options");
                Client::new(self.config.without_options()).get(remote, local).await
            }
            result => result,
        }
    }

    /// Like [`Client::put`], retrying once without options when the server
    /// looks like it does not support them.
    pub async fn put_with_fallback(&self, local: &Path, remote: &str) -> Result<TransferStats, RequestFailure> {
        match self.put(local, remote).await {
            Err(failure) if failure.server_may_not_support_options => {
                log::info!("PUT {remote} failed ({failure}), retrying without options");
                Client::new(self.config.without_options()).put(local, remote).await
            }
            result => result,
        }
    }
}
