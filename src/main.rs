use anyhow::{anyhow, Context};
use clap::Parser;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tftpx::cli::Command;
use tftpx::{Cli, Client, Server, TransferStats};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match args.command {
        Command::Serve(serve) => {
            let root = fs::canonicalize(&serve.directory)
                .with_context(|| format!("bad root directory {}", serve.directory.display()))?;
            let server = Server::bind(serve.config(root)).await?;
            server.run().await
        }
        Command::Get { client, remote, local } => {
            let local = match local {
                Some(local) => local,
                None => PathBuf::from(
                    Path::new(&remote)
                        .file_name()
                        .ok_or_else(|| anyhow!("cannot derive a local name from {remote:?}"))?,
                ),
            };
            let stats = Client::new(client.config())
                .get_with_fallback(&remote, &local)
                .await
                .with_context(|| format!("GET {remote} failed"))?;
            print_summary(&stats);
            Ok(())
        }
        Command::Put { client, local, remote } => {
            let remote = match remote {
                Some(remote) => remote,
                None => local
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| anyhow!("cannot derive a remote name from {}", local.display()))?
                    .to_string(),
            };
            let stats = Client::new(client.config())
                .put_with_fallback(&local, &remote)
                .await
                .with_context(|| format!("PUT {remote} failed"))?;
            print_summary(&stats);
            Ok(())
        }
        Command::List { client, dir } => {
            let (listing, _) = Client::new(client.config())
                .list(&dir)
                .await
                .with_context(|| format!("LIST {dir} failed"))?;
            io::stdout().write_all(&listing)?;
            Ok(())
        }
    }
}

fn print_summary(stats: &TransferStats) {
    let secs = stats.elapsed.as_secs_f64();
    println!(
        "{} bytes, blksize: {}, windowsize: {}, retrans: {}",
        stats.bytes, stats.block_size, stats.window_size, stats.retransmits
    );
    println!(
        "cost: {:.3}s, speed: {:.2} MB/s",
        secs,
        stats.bytes as f64 / secs.max(f64::EPSILON) / 1024.0 / 1024.0
    );
}
