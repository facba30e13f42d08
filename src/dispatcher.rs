//! Completion-queue style I/O for one worker thread.
//!
//! Operations are submitted with a caller-chosen [`EventId`] and complete
//! later as an [`Event`] carrying the same id. Everything runs on a private
//! current-thread tokio runtime which only makes progress inside
//! [`Dispatcher::wait_event`], so the code handling an event never races
//! with the operations it submits.
//!
//! Every submitted operation yields exactly one event. A cancelled
//! operation completes with [`DispatchError::Canceled`]; cancelling one that
//! has already completed makes the cancel itself fail with
//! [`DispatchError::NotFound`] while the original completion is still
//! delivered.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Wake,
    Received,
    Timer,
    Sent,
    Cancel,
}

/// Correlation id: owning session slot, logical event kind, and a
/// per-session sequence number telling apart successive operations of the
/// same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    pub slot: u16,
    pub kind: EventKind,
    pub seq: u16,
}

impl EventId {
    pub fn new(slot: u16, kind: EventKind, seq: u16) -> Self {
        Self { slot, kind, seq }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}#{}", self.slot, self.kind, self.seq)
    }
}

#[derive(Debug)]
pub enum Completion {
    TimerFired,
    Sent(usize),
    Received { data: Vec<u8>, from: SocketAddr },
    Cancelled,
    Nop,
}

#[derive(Debug)]
pub struct Event {
    pub id: EventId,
    pub result: Result<Completion, DispatchError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub(crate) u32);

/// Submission side of the dispatcher, as seen by a session.
pub trait Dispatch {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketHandle>;

    fn local_addr(&self, socket: SocketHandle) -> io::Result<SocketAddr>;

    /// Drops the socket. Operations still pending on it keep it alive
    /// until they complete.
    fn close(&mut self, socket: SocketHandle);

    fn submit_timeout(&mut self, id: EventId, after: Duration);

    fn submit_recv(&mut self, id: EventId, socket: SocketHandle, capacity: usize);

    fn submit_send(&mut self, id: EventId, socket: SocketHandle, packet: Vec<u8>, to: SocketAddr);

    fn submit_cancel(&mut self, id: EventId, target: EventId);
}

struct InFlight {
    claimed: Arc<AtomicBool>,
    abort: AbortHandle,
}

pub struct Dispatcher {
    runtime: Runtime,
    tx: UnboundedSender<Event>,
    rx: UnboundedReceiver<Event>,
    sockets: HashMap<SocketHandle, Arc<UdpSocket>>,
    next_socket: u32,
    in_flight: HashMap<EventId, InFlight>,
}

/// Thread-safe handle for posting no-op events into a dispatcher's queue.
#[derive(Clone)]
pub struct Remote {
    tx: UnboundedSender<Event>,
}

impl Remote {
    /// Returns false once the dispatcher is gone.
    pub fn notify(&self, id: EventId) -> bool {
        self.tx
            .send(Event {
                id,
                result: Ok(Completion::Nop),
            })
            .is_ok()
    }
}

impl Dispatcher {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            tx,
            rx,
            sockets: HashMap::new(),
            next_socket: 0,
            in_flight: HashMap::new(),
        })
    }

    pub fn remote(&self) -> Remote {
        Remote {
            tx: self.tx.clone(),
        }
    }

    pub fn submit_nop(&mut self, id: EventId) {
        self.push(id, Ok(Completion::Nop));
    }

    /// Blocks until the next completion is available.
    pub fn wait_event(&mut self) -> Option<Event> {
        let event = self.runtime.block_on(self.rx.recv())?;
        self.in_flight.remove(&event.id);
        Some(event)
    }

    /// Number of cancellable operations not yet completed.
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    fn push(&self, id: EventId, result: Result<Completion, DispatchError>) {
        // the receiver lives in `self`, so this cannot fail
        let _ = self.tx.send(Event { id, result });
    }

    fn socket(&self, id: EventId, socket: SocketHandle) -> Option<Arc<UdpSocket>> {
        let found = self.sockets.get(&socket).cloned();
        if found.is_none() {
            self.push(id, Err(DispatchError::UnknownSocket));
        }
        found
    }

    fn spawn_tracked<F>(&mut self, id: EventId, op: F)
    where
        F: Future<Output = Result<Completion, DispatchError>> + Send + 'static,
    {
        let claimed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&claimed);
        let tx = self.tx.clone();
        let handle = self.runtime.spawn(async move {
            let result = op.await;
            if !flag.swap(true, Ordering::AcqRel) {
                let _ = tx.send(Event { id, result });
            }
        });
        self.in_flight.insert(
            id,
            InFlight {
                claimed,
                abort: handle.abort_handle(),
            },
        );
    }
}

impl Dispatch for Dispatcher {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketHandle> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let socket = {
            let _guard = self.runtime.enter();
            UdpSocket::from_std(socket)?
        };
        let handle = SocketHandle(self.next_socket);
        self.next_socket = self.next_socket.wrapping_add(1);
        self.sockets.insert(handle, Arc::new(socket));
        Ok(handle)
    }

    fn local_addr(&self, socket: SocketHandle) -> io::Result<SocketAddr> {
        self.sockets
            .get(&socket)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))?
            .local_addr()
    }

    fn close(&mut self, socket: SocketHandle) {
        self.sockets.remove(&socket);
    }

    fn submit_timeout(&mut self, id: EventId, after: Duration) {
        self.spawn_tracked(id, async move {
            tokio::time::sleep(after).await;
            Ok(Completion::TimerFired)
        });
    }

    fn submit_recv(&mut self, id: EventId, socket: SocketHandle, capacity: usize) {
        let Some(socket) = self.socket(id, socket) else {
            return;
        };
        self.spawn_tracked(id, async move {
            let mut data = vec![0u8; capacity];
            let (n, from) = socket.recv_from(&mut data).await?;
            data.truncate(n);
            Ok(Completion::Received { data, from })
        });
    }

    fn submit_send(&mut self, id: EventId, socket: SocketHandle, packet: Vec<u8>, to: SocketAddr) {
        let Some(socket) = self.socket(id, socket) else {
            return;
        };
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            let result = socket
                .send_to(&packet, to)
                .await
                .map(Completion::Sent)
                .map_err(DispatchError::from);
            let _ = tx.send(Event { id, result });
        });
    }

    fn submit_cancel(&mut self, id: EventId, target: EventId) {
        let result = match self.in_flight.remove(&target) {
            Some(op) if !op.claimed.swap(true, Ordering::AcqRel) => {
                op.abort.abort();
                self.push(target, Err(DispatchError::Canceled));
                Ok(Completion::Cancelled)
            }
            _ => Err(DispatchError::NotFound),
        };
        self.push(id, result);
    }
}
