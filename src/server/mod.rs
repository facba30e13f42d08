//! Multi-threaded TFTP server.
//!
//! A single listener task receives requests on the well-known port and hands
//! each one to the least busy worker. Admission is bounded by a semaphore
//! with one permit per session slot across all workers; the listener stops
//! reading while every slot is taken.

mod config;
mod session;
mod source;
mod stats;
mod worker;

pub use config::{ServerConfig, MAX_SESSIONS_PER_WORKER};
pub use session::{Session, State, Status};
pub use stats::{print_session_stats, ServerStats, SessionStats, StatsWindow};
pub use worker::StatsCallback;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant};

use crate::packet::{peek_opcode, Opcode};
use crate::MAX_REQUEST_SIZE;
use worker::{Incoming, Worker};

pub struct Server {
    socket: UdpSocket,
    config: Arc<ServerConfig>,
    stats: Arc<ServerStats>,
    callback: Option<StatsCallback>,
}

impl Server {
    /// Binds the listening socket. An IPv6 wildcard host also accepts IPv4
    /// peers.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let addr = config.listen_addr();
        let socket = bind_listener(addr).with_context(|| format!("failed to bind {addr}"))?;
        let socket = UdpSocket::from_std(socket)?;
        Ok(Self {
            socket,
            config: Arc::new(config),
            stats: Arc::new(ServerStats::new()),
            callback: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Registers `callback` to run on the worker thread after every session.
    pub fn with_session_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SessionStats) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Serves until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serves until `shutdown` resolves, then waits for live sessions to
    /// finish.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;
        let workers = (0..config.workers)
            .map(|index| {
                Worker::spawn(
                    index,
                    Arc::clone(config),
                    Arc::clone(&self.stats),
                    self.callback.clone(),
                )
            })
            .collect::<io::Result<Vec<_>>>()
            .context("failed to start workers")?;
        let permits = Arc::new(Semaphore::new(config.workers * config.sessions_per_worker));

        let period = config.stats_interval.max(Duration::from_secs(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        tokio::pin!(shutdown);

        log::info!(
            "TFTP server listening on {}, root: {}",
            self.socket.local_addr()?,
            config.root.display()
        );
        log::info!(
            "workers: {}, sessions per worker: {}, retries: {}, timeout: {:?}",
            config.workers,
            config.sessions_per_worker,
            config.retries,
            config.timeout
        );

        let mut buf = vec![0u8; MAX_REQUEST_SIZE + 1];
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.context("admission semaphore closed")?
                }
                _ = ticker.tick() => {
                    self.stats.report(period);
                    continue;
                }
                () = &mut shutdown => break,
            };

            let (n, peer) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        log::warn!("recv_from failed: {e}");
                        continue;
                    }
                },
                _ = ticker.tick() => {
                    self.stats.report(period);
                    continue;
                }
                () = &mut shutdown => break,
            };

            if n > MAX_REQUEST_SIZE {
                log::warn!("dropping oversized request of {n} bytes from {peer}");
                continue;
            }
            let request = &buf[..n];
            match peek_opcode(request) {
                Some(Opcode::Rrq | Opcode::Wrq) => {}
                other => {
                    log::debug!("ignoring {other:?} from {peer} on the listening port");
                    continue;
                }
            }

            let Some(worker) = workers.iter().min_by_key(|w| w.active()) else {
                break;
            };
            self.stats.session_spawned();
            let incoming = Incoming {
                request: request.to_vec(),
                peer,
                permit,
            };
            if let Err(incoming) = worker.dispatch(incoming) {
                log::error!(
                    "worker {} could not take the request from {}",
                    worker.index(),
                    incoming.peer
                );
            }
        }

        let active: usize = workers.iter().map(Worker::active).sum();
        log::info!("shutting down, waiting for {active} sessions");
        for worker in &workers {
            worker.shutdown();
        }
        tokio::task::spawn_blocking(move || workers.into_iter().for_each(Worker::join))
            .await
            .context("failed to join workers")?;
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
