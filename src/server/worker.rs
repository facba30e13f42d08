//! Worker threads, each multiplexing a fixed number of session slots over
//! its own dispatcher.
//!
//! The listener hands a request to a worker by parking it in a free slot of
//! the worker's inbox and posting a start event for that slot. The worker
//! builds the session when the event comes out of its queue, so all session
//! state stays on the worker thread.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tokio::sync::OwnedSemaphorePermit;

use super::config::ServerConfig;
use super::session::{Session, Status};
use super::stats::{print_session_stats, ServerStats, SessionStats};
use crate::dispatcher::{Dispatcher, EventId, EventKind, Remote};

/// Invoked on the worker thread each time a session closes.
pub type StatsCallback = Arc<dyn Fn(&SessionStats) + Send + Sync>;

/// A request accepted by the listener, with the admission permit it holds
/// until its session closes.
pub struct Incoming {
    pub request: Vec<u8>,
    pub peer: SocketAddr,
    pub permit: OwnedSemaphorePermit,
}

enum Slot {
    Free,
    Pending(Incoming),
    /// The permit is released when the slot is freed.
    Busy { _permit: OwnedSemaphorePermit },
}

struct Shared {
    slots: Mutex<Vec<Slot>>,
    active: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Worker {
    index: usize,
    shared: Arc<Shared>,
    remote: Remote,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        index: usize,
        config: Arc<ServerConfig>,
        stats: Arc<ServerStats>,
        callback: Option<StatsCallback>,
    ) -> io::Result<Self> {
        let dispatcher = Dispatcher::new()?;
        let remote = dispatcher.remote();
        let shared = Arc::new(Shared {
            slots: Mutex::new((0..config.sessions_per_worker).map(|_| Slot::Free).collect()),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("tftp-worker-{index}"))
                .spawn(move || {
                    log::debug!("worker {index} started");
                    run(dispatcher, &shared, &config, &stats, callback.as_ref());
                    log::debug!("worker {index} stopped");
                })?
        };

        Ok(Self {
            index,
            shared,
            remote,
            thread: Some(thread),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Sessions currently assigned to this worker, including ones not yet
    /// started.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Parks `incoming` in a free slot and wakes the worker. Gives the
    /// request back if no slot is free or the worker has exited.
    pub fn dispatch(&self, incoming: Incoming) -> Result<(), Incoming> {
        let mut slots = self.shared.slots();
        let Some(slot) = slots.iter().position(|s| matches!(s, Slot::Free)) else {
            return Err(incoming);
        };
        // the worker cannot look at the slot before the lock is released;
        // slot count is capped at u16::MAX in the config
        if !self.remote.notify(EventId::new(slot as u16, EventKind::Start, 0)) {
            return Err(incoming);
        }
        slots[slot] = Slot::Pending(incoming);
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Asks the worker to exit once its live sessions have closed.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.remote.notify(EventId::new(0, EventKind::Wake, 0));
    }

    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("worker {} panicked", self.index);
            }
        }
    }
}

fn run(
    mut dispatcher: Dispatcher,
    shared: &Shared,
    config: &Arc<ServerConfig>,
    stats: &ServerStats,
    callback: Option<&StatsCallback>,
) {
    let mut sessions: Vec<Option<Session>> = (0..config.sessions_per_worker).map(|_| None).collect();

    loop {
        if shared.shutdown.load(Ordering::Acquire) && shared.active.load(Ordering::Acquire) == 0 {
            break;
        }
        let Some(event) = dispatcher.wait_event() else {
            break;
        };
        let slot = usize::from(event.id.slot);

        match event.id.kind {
            EventKind::Wake => continue,
            EventKind::Start => {
                let incoming = {
                    let mut slots = shared.slots();
                    let Some(entry) = slots.get_mut(slot) else {
                        continue;
                    };
                    match mem::replace(entry, Slot::Free) {
                        Slot::Pending(incoming) => {
                            let Incoming { request, peer, permit } = incoming;
                            *entry = Slot::Busy { _permit: permit };
                            (request, peer)
                        }
                        other => {
                            *entry = other;
                            log::warn!("start event {} for a slot with no request", event.id);
                            continue;
                        }
                    }
                };
                let (request, peer) = incoming;
                sessions[slot] = Some(Session::new(event.id.slot, request, peer, Arc::clone(config)));
            }
            _ => {}
        }

        let Some(session) = sessions.get_mut(slot).and_then(Option::as_mut) else {
            log::trace!("event {} for an idle slot", event.id);
            continue;
        };
        if session.handle_event(&mut dispatcher, event) == Status::Closed {
            if let Some(session) = sessions[slot].take() {
                let closed = session.stats();
                print_session_stats(closed);
                stats.session_finished(closed);
                if let Some(callback) = callback {
                    callback(closed);
                }
            }
            let released = mem::replace(&mut shared.slots()[slot], Slot::Free);
            shared.active.fetch_sub(1, Ordering::AcqRel);
            drop(released);
        }
    }
}
