//! One server-side transfer, driven entirely by dispatcher completions.
//!
//! A session never blocks. Each call to [`Session::handle_event`] runs one
//! step of the state machine, submits whatever I/O that step needs and
//! returns. Protocol and resource failures are answered with an ERROR packet
//! and end the session; they are never returned to the caller.
//!
//! Every operation a session submits produces exactly one completion, and
//! the session counts them. Closing first cancels the outstanding receive and
//! timer, then waits for all completions (including those of the cancels)
//! before releasing the socket, so nothing can arrive for a slot after it has
//! been reused.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use super::config::ServerConfig;
use super::source::{self, Source};
use super::stats::SessionStats;
use crate::dispatcher::{Completion, Dispatch, Event, EventId, EventKind, SocketHandle};
use crate::error::{DispatchError, SessionError};
use crate::options::{OptionKind, TimeoutValue, READ_TYPE_DIRECTORY};
use crate::packet::{ErrorCode, Mode, Packet};
use crate::timeout::AdaptiveTimeout;
use crate::window::SendWindow;
use crate::{DEF_BLOCK_SIZE, DEF_WINDOW_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the worker to deliver the start event.
    Start,
    /// OACK sent; RRQ waits for ACK 0, WRQ for DATA 1.
    AwaitingOptionAck,
    /// RRQ: window in flight, waiting for an ACK or the retransmit timer.
    AwaitingAckOrTimeout,
    /// WRQ: waiting for the next DATA block.
    AwaitingNextBlock,
    /// Terminal transition taken; completions are still being drained.
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Closed,
}

enum Transfer {
    None,
    Read {
        window: SendWindow,
        source: Box<dyn Read + Send>,
    },
    Write {
        sink: File,
        /// Last block written, in order.
        last_received: u16,
        /// Blocks written since the last ACK went out.
        unacked: u16,
    },
}

pub struct Session {
    slot: u16,
    config: Arc<ServerConfig>,
    request: Vec<u8>,
    peer: SocketAddr,
    socket: Option<SocketHandle>,
    state: State,
    transfer: Transfer,
    block_size: u16,
    window_size: u16,
    timeout: Duration,
    adaptive: Option<AdaptiveTimeout>,
    oack: Option<Vec<u8>>,
    retries: u32,
    pending: usize,
    seq: u16,
    recv_op: Option<EventId>,
    timer_op: Option<EventId>,
    stats: SessionStats,
}

impl Session {
    pub fn new(slot: u16, request: Vec<u8>, peer: SocketAddr, config: Arc<ServerConfig>) -> Self {
        let peer = unmap_peer(peer);
        Self {
            slot,
            timeout: config.timeout,
            config,
            request,
            peer,
            socket: None,
            state: State::Start,
            transfer: Transfer::None,
            block_size: DEF_BLOCK_SIZE,
            window_size: DEF_WINDOW_SIZE,
            adaptive: None,
            oack: None,
            retries: 0,
            pending: 0,
            seq: 0,
            recv_op: None,
            timer_op: None,
            stats: SessionStats::new(peer),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn handle_event<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D, event: Event) -> Status {
        if !matches!(event.id.kind, EventKind::Start | EventKind::Wake) {
            self.pending = self.pending.saturating_sub(1);
        }

        match event.id.kind {
            EventKind::Start => {
                if self.state == State::Start {
                    self.start(dispatch);
                }
            }
            EventKind::Received => self.on_received(dispatch, event.id, event.result),
            EventKind::Timer => self.on_timer(dispatch, event.id, event.result),
            EventKind::Sent => {
                if let Err(e) = event.result {
                    self.on_transport_error(dispatch, "send", e);
                }
            }
            EventKind::Cancel | EventKind::Wake => {}
        }

        if self.state == State::Draining && self.pending == 0 {
            self.finish(dispatch);
        }
        if self.state == State::Closed {
            Status::Closed
        } else {
            Status::Running
        }
    }

    fn is_active(&self) -> bool {
        !matches!(self.state, State::Start | State::Draining | State::Closed)
    }

    fn start<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) {
        let local = match self.peer {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        match dispatch.bind(local) {
            Ok(socket) => {
                self.socket = Some(socket);
                self.stats.local = dispatch.local_addr(socket).ok();
            }
            Err(e) => {
                log::error!("could not bind a socket for {}: {e}", self.peer);
                self.stats.error = Some(SessionError::new(ErrorCode::NotDefined, e.to_string()));
                self.state = State::Draining;
                return;
            }
        }

        match self.negotiate(dispatch) {
            Ok(()) => self.post_recv(dispatch),
            Err(error) => self.fail(dispatch, error),
        }
    }

    /// Validates the request, opens its file and sends the first reply.
    fn negotiate<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) -> Result<(), SessionError> {
        let packet = Packet::deserialize(&self.request).map_err(|e| {
            SessionError::new(ErrorCode::IllegalOperation, format!("Malformed request: {e}."))
        })?;
        let (is_write, filename, mode, mut options) = match packet {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => (false, filename, mode, options),
            Packet::Wrq {
                filename,
                mode,
                options,
            } => (true, filename, mode, options),
            _ => {
                return Err(SessionError::new(
                    ErrorCode::IllegalOperation,
                    "Unexpected packet opcode.",
                ));
            }
        };
        self.stats.file = filename.clone();
        self.stats.mode = mode.clone();
        self.stats.options_in = options.clone();
        log::debug!(
            "{} from {} for {filename} [{mode}] {options}",
            if is_write { "WRQ" } else { "RRQ" },
            self.peer
        );

        if is_write && !self.config.enable_write_requests {
            return Err(SessionError::new(
                ErrorCode::AccessViolation,
                "Write requests are disabled.",
            ));
        }
        let mode: Mode = mode
            .parse()
            .map_err(|_| SessionError::new(ErrorCode::IllegalOperation, "Unknown mode."))?;

        if options.timeout == Some(TimeoutValue::Adaptive)
            && (is_write || !self.config.enable_adaptive_timeout)
        {
            options.clear(OptionKind::Timeout);
        }
        if is_write || !self.config.enable_list_requests {
            options.clear(OptionKind::ReadType);
        }
        let listing = match options.read_type.as_deref() {
            None => false,
            Some(value) if value.eq_ignore_ascii_case(READ_TYPE_DIRECTORY) => true,
            Some(_) => {
                return Err(SessionError::new(ErrorCode::IllegalOperation, "Invalid read type."));
            }
        };

        self.block_size = options.block_size.unwrap_or(DEF_BLOCK_SIZE);
        self.window_size = options.window_size.unwrap_or(DEF_WINDOW_SIZE);
        match options.timeout {
            Some(TimeoutValue::Seconds(secs)) => self.timeout = Duration::from_secs(u64::from(secs)),
            Some(TimeoutValue::Adaptive) => self.adaptive = Some(AdaptiveTimeout::new()),
            None => {}
        }

        if is_write {
            let sink = source::open_write(&self.config.root, &filename)?;
            self.transfer = Transfer::Write {
                sink,
                last_received: 0,
                unacked: 0,
            };
        } else {
            let Source { reader, size } = source::open_read(&self.config.root, &filename, mode, listing)?;
            if options.transfer_size.is_some() {
                options.transfer_size = size;
            }
            self.transfer = Transfer::Read {
                window: SendWindow::new(self.window_size, self.block_size),
                source: reader,
            };
        }

        self.stats.block_size = self.block_size;
        self.stats.window_size = self.window_size;
        self.stats.options_acked = options.clone();

        if !options.is_empty() {
            let oack = Packet::Oack(options).serialize();
            self.oack = Some(oack.clone());
            self.state = State::AwaitingOptionAck;
            self.send(dispatch, oack, self.peer);
            self.arm_timer(dispatch);
        } else if is_write {
            self.state = State::AwaitingNextBlock;
            self.send(dispatch, Packet::Ack(0).serialize(), self.peer);
            self.arm_timer(dispatch);
        } else {
            self.state = State::AwaitingAckOrTimeout;
            self.send_data(dispatch)?;
        }
        Ok(())
    }

    fn on_received<D: Dispatch + ?Sized>(
        &mut self,
        dispatch: &mut D,
        id: EventId,
        result: Result<Completion, DispatchError>,
    ) {
        if self.recv_op == Some(id) {
            self.recv_op = None;
        }
        match result {
            Ok(Completion::Received { data, from }) => {
                if !self.is_active() {
                    return;
                }
                self.on_datagram(dispatch, &data, from);
                if self.is_active() && self.recv_op.is_none() {
                    self.post_recv(dispatch);
                }
            }
            Ok(_) => {}
            Err(e) if e.is_benign() => {}
            Err(e) => self.on_transport_error(dispatch, "receive", e),
        }
    }

    fn on_timer<D: Dispatch + ?Sized>(
        &mut self,
        dispatch: &mut D,
        id: EventId,
        result: Result<Completion, DispatchError>,
    ) {
        // superseded timers complete too
        if self.timer_op != Some(id) {
            return;
        }
        self.timer_op = None;
        match result {
            Ok(_) if self.is_active() => self.on_timeout(dispatch),
            Ok(_) => {}
            Err(e) if e.is_benign() => {}
            Err(e) => self.on_transport_error(dispatch, "timer", e),
        }
    }

    fn on_transport_error<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D, op: &str, e: DispatchError) {
        log::error!("{op} failed for session with {}: {e}", self.peer);
        if self.is_active() {
            self.stats.error = Some(SessionError::new(ErrorCode::NotDefined, e.to_string()));
            self.begin_close(dispatch);
        }
    }

    fn on_datagram<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D, data: &[u8], from: SocketAddr) {
        if from != self.peer {
            log::warn!("datagram from unknown transfer ID {from} on the session of {}", self.peer);
            let error = Packet::error(
                ErrorCode::UnknownTransferId,
                ErrorCode::UnknownTransferId.default_message(),
            );
            self.send_untracked(dispatch, error.serialize(), from);
            return;
        }

        let packet = match Packet::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("ignoring malformed datagram from {from}: {e}");
                return;
            }
        };

        let result = match (self.state, packet) {
            (_, Packet::Error { code, message }) => {
                log::info!("{} aborted the transfer: {code} {message}", self.peer);
                self.stats.error = Some(SessionError::new(ErrorCode::from(code), message));
                self.begin_close(dispatch);
                return;
            }
            (State::AwaitingOptionAck | State::AwaitingAckOrTimeout, Packet::Ack(block)) if self.is_read() => {
                self.on_ack(dispatch, block)
            }
            (State::AwaitingOptionAck | State::AwaitingNextBlock, Packet::Data { block, data })
                if self.is_write() =>
            {
                self.on_data(dispatch, block, &data)
            }
            _ => Err(SessionError::new(
                ErrorCode::IllegalOperation,
                "Unexpected packet opcode.",
            )),
        };
        if let Err(error) = result {
            self.fail(dispatch, error);
        }
    }

    fn is_read(&self) -> bool {
        matches!(self.transfer, Transfer::Read { .. })
    }

    fn is_write(&self) -> bool {
        matches!(self.transfer, Transfer::Write { .. })
    }

    fn on_ack<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D, block: u16) -> Result<(), SessionError> {
        if self.state == State::AwaitingOptionAck {
            if block != 0 {
                return Ok(());
            }
            self.state = State::AwaitingAckOrTimeout;
            self.retries = 0;
            self.stats.packets_acked += 1;
            return self.send_data(dispatch);
        }

        let Transfer::Read { window, .. } = &mut self.transfer else {
            return Ok(());
        };
        let Some(acked) = window.on_ack(block) else {
            log::trace!("stale ACK {block} from {}", self.peer);
            return Ok(());
        };
        let complete = window.is_complete();

        self.stats.packets_acked += acked.blocks;
        self.stats.bytes_sent += acked.bytes;
        self.retries = 0;
        if let Some(adaptive) = &mut self.adaptive {
            if let Some(rto) = adaptive.stop_timer(acked.seq) {
                log::trace!("RTO for {} now {rto:?}", self.peer);
            }
        }

        if complete {
            self.begin_close(dispatch);
            return Ok(());
        }
        self.send_data(dispatch)
    }

    fn on_data<D: Dispatch + ?Sized>(
        &mut self,
        dispatch: &mut D,
        block: u16,
        data: &[u8],
    ) -> Result<(), SessionError> {
        self.state = State::AwaitingNextBlock;
        let block_size = usize::from(self.block_size);
        let window_size = self.window_size;
        let Transfer::Write {
            sink,
            last_received,
            unacked,
        } = &mut self.transfer
        else {
            return Ok(());
        };

        if block != last_received.wrapping_add(1) {
            let resend = *last_received;
            *unacked = 0;
            self.stats.retransmits += 1;
            self.send(dispatch, Packet::Ack(resend).serialize(), self.peer);
            return Ok(());
        }

        sink.write_all(data).map_err(|e| {
            log::warn!("write for {} failed: {e}", self.peer);
            source::map_write_error(&e)
        })?;
        *last_received = block;
        *unacked += 1;
        let last = data.len() < block_size;
        let ack_now = last || *unacked >= window_size;
        if ack_now {
            *unacked = 0;
        }

        self.stats.bytes_received += data.len() as u64;
        self.stats.packets_acked += 1;
        self.retries = 0;

        if ack_now {
            self.send(dispatch, Packet::Ack(block).serialize(), self.peer);
        }
        if last {
            self.begin_close(dispatch);
        } else {
            self.rearm_timer(dispatch);
        }
        Ok(())
    }

    fn on_timeout<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) {
        if self.retries >= self.config.retries {
            let missed_last = matches!(&self.transfer, Transfer::Read { window, .. } if window.final_sent());
            let message = if missed_last {
                format!("timeout after {} retransmits. Missed last ack.", self.retries)
            } else {
                format!("timeout after {} retransmits.", self.retries)
            };
            self.fail(dispatch, SessionError::new(ErrorCode::NotDefined, message));
            return;
        }

        self.retries += 1;
        if let Some(adaptive) = &mut self.adaptive {
            adaptive.cancel_timer();
            adaptive.backoff();
        }
        log::debug!("timeout #{} for {} in {:?}", self.retries, self.peer, self.state);

        match self.state {
            State::AwaitingOptionAck => {
                if let Some(oack) = self.oack.clone() {
                    self.stats.retransmits += 1;
                    self.send(dispatch, oack, self.peer);
                }
                self.arm_timer(dispatch);
            }
            State::AwaitingAckOrTimeout => {
                if let Transfer::Read { window, .. } = &mut self.transfer {
                    window.rewind();
                }
                if let Err(error) = self.send_data(dispatch) {
                    self.fail(dispatch, error);
                }
            }
            State::AwaitingNextBlock => {
                if let Transfer::Write {
                    last_received,
                    unacked,
                    ..
                } = &mut self.transfer
                {
                    let resend = *last_received;
                    *unacked = 0;
                    self.stats.retransmits += 1;
                    self.send(dispatch, Packet::Ack(resend).serialize(), self.peer);
                }
                self.arm_timer(dispatch);
            }
            State::Start | State::Draining | State::Closed => {}
        }
    }

    /// Tops up the window, transmits everything not yet sent and restarts
    /// the retransmit timer.
    fn send_data<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) -> Result<(), SessionError> {
        let Transfer::Read { window, source } = &mut self.transfer else {
            return Ok(());
        };
        window.fill(source.as_mut()).map_err(|e| {
            log::warn!("reading {} failed: {e}", self.stats.file);
            SessionError::new(ErrorCode::NotDefined, "Error while reading from source")
        })?;
        let outgoing: Vec<_> = std::iter::from_fn(|| window.next_packet()).collect();

        for out in outgoing {
            if out.retransmit {
                self.stats.retransmits += 1;
            } else if let Some(adaptive) = &mut self.adaptive {
                if !adaptive.is_running() {
                    adaptive.start_timer(out.seq);
                }
            }
            self.send(dispatch, out.packet, self.peer);
        }
        self.rearm_timer(dispatch);
        Ok(())
    }

    fn fail<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D, error: SessionError) {
        log::warn!("session with {} failed: {} {}", self.peer, error.code, error.message);
        self.send(
            dispatch,
            Packet::error(error.code, &error.message).serialize(),
            self.peer,
        );
        self.stats.error = Some(error);
        self.begin_close(dispatch);
    }

    fn begin_close<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) {
        self.state = State::Draining;
        if let Some(op) = self.recv_op.take() {
            self.cancel(dispatch, op);
        }
        if let Some(op) = self.timer_op.take() {
            self.cancel(dispatch, op);
        }
    }

    fn finish<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) {
        if let Some(socket) = self.socket.take() {
            dispatch.close(socket);
        }
        self.transfer = Transfer::None;
        self.stats.elapsed = self.stats.started.elapsed();
        self.state = State::Closed;
    }

    fn next_id(&mut self, kind: EventKind) -> EventId {
        self.seq = self.seq.wrapping_add(1);
        EventId::new(self.slot, kind, self.seq)
    }

    fn send<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D, packet: Vec<u8>, to: SocketAddr) {
        if self.send_untracked(dispatch, packet, to) {
            self.stats.packets_sent += 1;
        }
    }

    /// Submits a send that is not counted in the session stats. Returns
    /// false when the session has no socket.
    fn send_untracked<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D, packet: Vec<u8>, to: SocketAddr) -> bool {
        let Some(socket) = self.socket else {
            return false;
        };
        let id = self.next_id(EventKind::Sent);
        dispatch.submit_send(id, socket, packet, to);
        self.pending += 1;
        true
    }

    fn post_recv<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) {
        let Some(socket) = self.socket else {
            return;
        };
        let id = self.next_id(EventKind::Received);
        let capacity = usize::from(self.block_size.max(DEF_BLOCK_SIZE)) + 4;
        dispatch.submit_recv(id, socket, capacity);
        self.recv_op = Some(id);
        self.pending += 1;
    }

    fn current_timeout(&self) -> Duration {
        self.adaptive.as_ref().map_or(self.timeout, AdaptiveTimeout::rto)
    }

    fn arm_timer<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) {
        let id = self.next_id(EventKind::Timer);
        dispatch.submit_timeout(id, self.current_timeout());
        self.timer_op = Some(id);
        self.pending += 1;
    }

    fn rearm_timer<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D) {
        if let Some(op) = self.timer_op.take() {
            self.cancel(dispatch, op);
        }
        self.arm_timer(dispatch);
    }

    fn cancel<D: Dispatch + ?Sized>(&mut self, dispatch: &mut D, target: EventId) {
        let id = self.next_id(EventKind::Cancel);
        dispatch.submit_cancel(id, target);
        self.pending += 1;
    }
}

/// IPv4 peers reach a dual-stack listener as `::ffff:a.b.c.d`; the session
/// talks to them over plain IPv4.
fn unmap_peer(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => peer,
        },
        SocketAddr::V4(_) => peer,
    }
}
