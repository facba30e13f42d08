use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::SessionError;
use crate::options::{format_options, OptionSet};

/// Per-session counters, reported once when the session closes.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    pub file: String,
    pub mode: String,
    pub error: Option<SessionError>,
    pub options_in: OptionSet,
    pub options_acked: OptionSet,
    pub started: Instant,
    pub elapsed: Duration,
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub block_size: u16,
    pub window_size: u16,
}

impl SessionStats {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            local: None,
            file: String::new(),
            mode: String::new(),
            error: None,
            options_in: OptionSet::default(),
            options_acked: OptionSet::default(),
            started: Instant::now(),
            elapsed: Duration::ZERO,
            packets_sent: 0,
            packets_acked: 0,
            bytes_sent: 0,
            bytes_received: 0,
            retransmits: 0,
            block_size: crate::DEF_BLOCK_SIZE,
            window_size: crate::DEF_WINDOW_SIZE,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub fn print_session_stats(stats: &SessionStats) {
    log::info!(
        "Stats: for {} requesting {} [{}]",
        stats.peer,
        stats.file,
        stats.mode
    );
    if let Some(error) = &stats.error {
        log::info!("  Error: {} {}", error.code, error.message);
    }
    log::info!("  Time spent: {:.3}s", stats.elapsed.as_secs_f64());
    log::info!(
        "  Packets sent: {}, ACKed: {}",
        stats.packets_sent,
        stats.packets_acked
    );
    if stats.bytes_received > 0 {
        log::info!("  Bytes received: {}", stats.bytes_received);
    } else {
        log::info!("  Bytes sent: {}", stats.bytes_sent);
    }
    log::info!(
        "  Options: requested {}, acked {}",
        format_options(&stats.options_in),
        format_options(&stats.options_acked)
    );
    log::info!(
        "  Block size: {}, Window size: {}",
        stats.block_size,
        stats.window_size
    );
    log::info!("  Retransmits: {}", stats.retransmits);
    log::info!(
        "  Server port: {}, Client port: {}",
        stats.local.map_or(0, |addr| addr.port()),
        stats.peer.port()
    );
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsWindow {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Aggregate counters shared by the listener and all workers.
#[derive(Debug, Default)]
pub struct ServerStats {
    inner: Mutex<StatsWindow>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsWindow> {
        // counters stay meaningful even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_spawned(&self) {
        self.lock().spawned += 1;
    }

    pub fn session_finished(&self, stats: &SessionStats) {
        let mut window = self.lock();
        if stats.succeeded() {
            window.completed += 1;
        } else {
            window.failed += 1;
        }
    }

    /// Returns the counters accumulated since the previous call and resets
    /// them.
    pub fn take(&self) -> StatsWindow {
        std::mem::take(&mut *self.lock())
    }

    pub fn report(&self, interval: Duration) {
        let window = self.take();
        log::info!("Server stats - every {} seconds", interval.as_secs());
        log::info!(
            "Number of spawned TFTP sessions in stats time frame : {}",
            window.spawned
        );
        log::info!(
            "Sessions completed : {}, failed : {}",
            window.completed,
            window.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ErrorCode;
    use std::sync::Arc;

    #[test]
    fn take_resets_window() {
        let stats = Arc::new(ServerStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.session_spawned();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let peer = "127.0.0.1:1234".parse().unwrap();
        let mut failed = SessionStats::new(peer);
        failed.error = Some(SessionError::new(ErrorCode::FileNotFound, "No such file or directory."));
        stats.session_finished(&SessionStats::new(peer));
        stats.session_finished(&failed);

        assert_eq!(
            stats.take(),
            StatsWindow {
                spawned: 400,
                completed: 1,
                failed: 1
            }
        );
        assert_eq!(stats.take(), StatsWindow::default());
    }
}
