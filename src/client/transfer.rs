//! Client side of a single request: the receive path for GET and LIST, the
//! windowed send path for PUT.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use super::config::ClientConfig;
use crate::error::{ClientError, RequestFailure};
use crate::options::{OptionSet, TimeoutValue};
use crate::packet::{encode_request, ErrorCode, Packet, RequestKind};
use crate::timeout::AdaptiveTimeout;
use crate::window::SendWindow;
use crate::{DEF_BLOCK_SIZE, DEF_WINDOW_SIZE};

/// Outcome of a successful request.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Payload bytes received (GET) or acknowledged (PUT).
    pub bytes: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub retransmits: u64,
    pub elapsed: Duration,
    /// Options the server acknowledged.
    pub options: OptionSet,
    pub block_size: u16,
    pub window_size: u16,
}

/// Per-request socket. The first valid reply fixes the server's transfer ID;
/// datagrams from anywhere else are answered with ERROR 5 and dropped.
struct Channel {
    socket: UdpSocket,
    server: SocketAddr,
    peer: Option<SocketAddr>,
    stats: TransferStats,
}

impl Channel {
    async fn open(server: SocketAddr) -> io::Result<Self> {
        let local = match server {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        Ok(Self {
            socket: UdpSocket::bind(local).await?,
            server,
            peer: None,
            stats: TransferStats {
                block_size: DEF_BLOCK_SIZE,
                window_size: DEF_WINDOW_SIZE,
                ..Default::default()
            },
        })
    }

    /// Sends to the transfer peer, or to the listening port before the
    /// first reply.
    async fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        let to = self.peer.unwrap_or(self.server);
        self.socket.send_to(packet, to).await?;
        self.stats.packets_sent += 1;
        Ok(())
    }

    async fn send_error(&mut self, code: ErrorCode, message: &str) {
        if let Err(e) = self.send(&Packet::error(code, message).serialize()).await {
            log::debug!("could not report {code} to the server: {e}");
        }
    }

    /// Waits until `deadline` for the next valid packet from the peer.
    async fn recv(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<Option<Packet>> {
        loop {
            let Ok(received) = timeout_at(deadline, self.socket.recv_from(buf)).await else {
                return Ok(None);
            };
            let (n, from) = received?;

            if self.peer.is_some_and(|peer| peer != from) {
                log::warn!("datagram from unknown transfer ID {from}");
                let error = Packet::error(ErrorCode::UnknownTransferId, "Unknown transfer ID.");
                if let Err(e) = self.socket.send_to(&error.serialize(), from).await {
                    log::debug!("could not answer {from}: {e}");
                }
                continue;
            }
            match Packet::deserialize(&buf[..n]) {
                Ok(packet) => {
                    self.peer.get_or_insert(from);
                    self.stats.packets_received += 1;
                    return Ok(Some(packet));
                }
                Err(e) => log::debug!("ignoring malformed datagram from {from}: {e}"),
            }
        }
    }
}

fn transfer_timeout(options: &OptionSet, default: Duration) -> Duration {
    match options.timeout {
        Some(TimeoutValue::Seconds(secs)) => Duration::from_secs(u64::from(secs)),
        _ => default,
    }
}

/// Runs a read request, writing the file to `sink`.
pub(crate) async fn receive<W: Write + ?Sized>(
    config: &ClientConfig,
    filename: &str,
    requested: &OptionSet,
    sink: &mut W,
) -> Result<TransferStats, RequestFailure> {
    let started = Instant::now();
    let request = encode_request(RequestKind::Read, filename, config.mode, requested)?;
    let mut channel = Channel::open(config.server).await?;
    channel.send(&request).await?;
    log::debug!("RRQ {filename} [{}] {requested} to {}", config.mode, config.server);

    let hint = !requested.is_empty();
    let mut last_sent = request;
    let mut first_reply = true;
    let mut block_size = DEF_BLOCK_SIZE;
    let mut window_size = DEF_WINDOW_SIZE;
    let mut wait = config.timeout;
    let mut announced = None;
    let mut expected: u16 = 1;
    let mut unacked: u16 = 0;
    let mut retries = 0;
    let mut buf = vec![0u8; usize::from(block_size) + 4];
    let mut deadline = Instant::now() + wait;

    loop {
        let Some(packet) = channel.recv(&mut buf, deadline).await? else {
            if retries >= config.retries {
                return Err(RequestFailure {
                    error: ClientError::Timeout { retries },
                    server_may_not_support_options: first_reply && hint,
                });
            }
            retries += 1;
            channel.stats.retransmits += 1;
            log::debug!("timeout #{retries}, resending last packet");
            channel.send(&last_sent).await?;
            deadline = Instant::now() + wait;
            continue;
        };

        match packet {
            Packet::Error { code, message } => {
                return Err(RequestFailure {
                    error: ClientError::Remote { code, message },
                    server_may_not_support_options: first_reply && hint,
                });
            }
            Packet::Oack(acked) if first_reply => {
                if !acked.is_subset_of(requested) {
                    channel.send_error(ErrorCode::InvalidOptions, "Invalid options.").await;
                    return Err(ClientError::InvalidOptions.into());
                }
                log::debug!("server acknowledged {acked}");
                block_size = acked.block_size.unwrap_or(DEF_BLOCK_SIZE);
                window_size = acked.window_size.unwrap_or(DEF_WINDOW_SIZE);
                wait = transfer_timeout(&acked, config.timeout);
                announced = acked.transfer_size;
                buf.resize(usize::from(block_size) + 4, 0);
                channel.stats.options = acked;
                first_reply = false;
                retries = 0;
                last_sent = Packet::Ack(0).serialize();
                channel.send(&last_sent).await?;
                deadline = Instant::now() + wait;
            }
            Packet::Oack(_) => {
                // our ACK 0 was lost
                if expected == 1 {
                    channel.send(&Packet::Ack(0).serialize()).await?;
                }
            }
            Packet::Data { block, data } => {
                first_reply = false;
                if block != expected {
                    log::trace!("DATA {block} while expecting {expected}");
                    unacked = 0;
                    last_sent = Packet::Ack(expected.wrapping_sub(1)).serialize();
                    channel.send(&last_sent).await?;
                    continue;
                }

                if let Err(e) = sink.write_all(&data) {
                    channel.send_error(ErrorCode::NotDefined, "Error writing to disk").await;
                    return Err(e.into());
                }
                channel.stats.bytes += data.len() as u64;
                expected = expected.wrapping_add(1);
                unacked += 1;
                retries = 0;

                let last = data.len() < usize::from(block_size);
                if last || unacked >= window_size {
                    unacked = 0;
                    last_sent = Packet::Ack(block).serialize();
                    channel.send(&last_sent).await?;
                }
                if last {
                    break;
                }
                deadline = Instant::now() + wait;
            }
            _ => {
                channel.send_error(ErrorCode::IllegalOperation, "Unexpected packet opcode.").await;
                return Err(ClientError::Protocol("unexpected packet opcode".to_string()).into());
            }
        }
    }

    if let Some(announced) = announced {
        if announced != channel.stats.bytes {
            return Err(ClientError::SizeMismatch {
                announced,
                received: channel.stats.bytes,
            }
            .into());
        }
    }

    channel.stats.block_size = block_size;
    channel.stats.window_size = window_size;
    channel.stats.elapsed = started.elapsed();
    Ok(channel.stats)
}

/// Runs a write request, sending everything `source` yields.
pub(crate) async fn send<R: Read + ?Sized>(
    config: &ClientConfig,
    filename: &str,
    requested: &OptionSet,
    source: &mut R,
) -> Result<TransferStats, RequestFailure> {
    let started = Instant::now();
    let request = encode_request(RequestKind::Write, filename, config.mode, requested)?;
    let mut channel = Channel::open(config.server).await?;
    channel.send(&request).await?;
    log::debug!("WRQ {filename} [{}] {requested} to {}", config.mode, config.server);

    let mut buf = vec![0u8; usize::from(DEF_BLOCK_SIZE) + 4];
    let mut retries = 0;
    let mut deadline = Instant::now() + config.timeout;

    let acked = loop {
        let Some(packet) = channel.recv(&mut buf, deadline).await? else {
            if retries >= config.retries {
                return Err(RequestFailure {
                    error: ClientError::Timeout { retries },
                    server_may_not_support_options: !requested.is_empty(),
                });
            }
            retries += 1;
            channel.stats.retransmits += 1;
            channel.send(&request).await?;
            deadline = Instant::now() + config.timeout;
            continue;
        };
        match packet {
            Packet::Ack(0) => break OptionSet::default(),
            Packet::Oack(acked) => {
                if !acked.is_subset_of(requested) {
                    channel.send_error(ErrorCode::InvalidOptions, "Invalid options.").await;
                    return Err(ClientError::InvalidOptions.into());
                }
                break acked;
            }
            Packet::Error { code, message } => {
                return Err(RequestFailure {
                    error: ClientError::Remote { code, message },
                    server_may_not_support_options: !requested.is_empty(),
                });
            }
            _ => {
                channel.send_error(ErrorCode::IllegalOperation, "Unexpected packet opcode.").await;
                return Err(ClientError::Protocol("unexpected reply to WRQ".to_string()).into());
            }
        }
    };

    let block_size = acked.block_size.unwrap_or(DEF_BLOCK_SIZE);
    let window_size = acked.window_size.unwrap_or(DEF_WINDOW_SIZE);
    let fixed = transfer_timeout(&acked, config.timeout);
    let mut adaptive = (acked.timeout == Some(TimeoutValue::Adaptive)).then(AdaptiveTimeout::new);
    log::debug!("server acknowledged {acked}");
    channel.stats.options = acked;

    let mut window = SendWindow::new(window_size, block_size);
    let mut retries = 0;
    loop {
        window.fill(source)?;
        let mut sent_any = false;
        while let Some(out) = window.next_packet() {
            if out.retransmit {
                channel.stats.retransmits += 1;
            } else if let Some(adaptive) = &mut adaptive {
                if !adaptive.is_running() {
                    adaptive.start_timer(out.seq);
                }
            }
            channel.send(&out.packet).await?;
            sent_any = true;
        }
        if sent_any {
            deadline = Instant::now() + adaptive.as_ref().map_or(fixed, AdaptiveTimeout::rto);
        }

        match channel.recv(&mut buf, deadline).await? {
            None => {
                if retries >= config.retries {
                    if window.final_sent() {
                        log::debug!("final ACK missed");
                    }
                    channel.send_error(ErrorCode::NotDefined, "timeout").await;
                    return Err(ClientError::Timeout { retries }.into());
                }
                retries += 1;
                if let Some(adaptive) = &mut adaptive {
                    adaptive.cancel_timer();
                    adaptive.backoff();
                }
                window.rewind();
            }
            Some(Packet::Ack(block)) => {
                let Some(acked) = window.on_ack(block) else {
                    continue;
                };
                retries = 0;
                channel.stats.bytes += acked.bytes;
                if let Some(adaptive) = &mut adaptive {
                    adaptive.stop_timer(acked.seq);
                }
                if window.is_complete() {
                    break;
                }
                // the remaining in-flight blocks get a fresh timer
                deadline = Instant::now() + adaptive.as_ref().map_or(fixed, AdaptiveTimeout::rto);
            }
            Some(Packet::Error { code, message }) => {
                return Err(ClientError::Remote { code, message }.into());
            }
            Some(Packet::Oack(_)) => {}
            Some(_) => {
                channel.send_error(ErrorCode::IllegalOperation, "Unexpected packet opcode.").await;
                return Err(ClientError::Protocol("unexpected packet during upload".to_string()).into());
            }
        }
    }

    channel.stats.block_size = block_size;
    channel.stats.window_size = window_size;
    channel.stats.elapsed = started.elapsed();
    Ok(channel.stats)
}
