//! Go-Back-N send window over a ring of pre-built DATA packets.
//!
//! Blocks are tracked by absolute sequence numbers starting at 1; the wire
//! block number is the sequence truncated to 16 bits, so numbering wraps
//! 65535 -> 0 -> 1. A slot is reused only after its block is acknowledged,
//! and a block shorter than the block size is always the final one.

use std::io::{self, ErrorKind, Read};

use crate::packet::write_data_header;

const HEADER_LEN: usize = 4;

pub struct SendWindow {
    size: u16,
    block_size: usize,
    slots: Vec<Vec<u8>>,
    /// Oldest unacknowledged block.
    begin: u64,
    next_make: u64,
    next_send: u64,
    /// One past the highest block ever transmitted.
    high_water: u64,
    last: Option<u64>,
}

/// A packet taken from the window for transmission.
#[derive(Debug)]
pub struct Outgoing {
    pub seq: u64,
    pub packet: Vec<u8>,
    pub retransmit: bool,
}

/// Effect of an in-window ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acked {
    pub seq: u64,
    pub blocks: u64,
    pub bytes: u64,
}

impl SendWindow {
    pub fn new(size: u16, block_size: u16) -> Self {
        let size = size.max(1);
        Self {
            size,
            block_size: usize::from(block_size),
            slots: vec![Vec::new(); usize::from(size)],
            begin: 1,
            next_make: 1,
            next_send: 1,
            high_water: 1,
            last: None,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn next_make(&self) -> u64 {
        self.next_make
    }

    pub fn next_send(&self) -> u64 {
        self.next_send
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Wire number of the most recently acknowledged block.
    pub fn last_acked(&self) -> u16 {
        (self.begin - 1) as u16
    }

    pub fn in_flight(&self) -> u64 {
        self.next_send - self.begin
    }

    pub fn has_unsent(&self) -> bool {
        self.next_send < self.next_make
    }

    /// True once the final block has been handed out at least once.
    pub fn final_sent(&self) -> bool {
        self.last.is_some_and(|last| self.high_water > last)
    }

    pub fn is_complete(&self) -> bool {
        self.last.is_some_and(|last| self.begin > last)
    }

    fn slot(&self, seq: u64) -> usize {
        (seq % u64::from(self.size)) as usize
    }

    /// Builds packets into free slots until the window is full or the
    /// source is exhausted. Each block is topped up with further reads until
    /// it is full or the source reports end of data.
    pub fn fill<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<usize> {
        let mut made = 0;
        while self.last.is_none() && self.next_make - self.begin < u64::from(self.size) {
            let seq = self.next_make;
            let index = self.slot(seq);
            let block_size = self.block_size;
            let packet = &mut self.slots[index];
            packet.resize(HEADER_LEN + block_size, 0);
            write_data_header(packet, seq as u16);

            let mut filled = 0;
            while filled < block_size {
                match source.read(&mut packet[HEADER_LEN + filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            packet.truncate(HEADER_LEN + filled);

            if filled < block_size {
                self.last = Some(seq);
            }
            self.next_make += 1;
            made += 1;
        }
        Ok(made)
    }

    /// Hands out the next built packet, if any.
    pub fn next_packet(&mut self) -> Option<Outgoing> {
        if !self.has_unsent() {
            return None;
        }
        let seq = self.next_send;
        self.next_send += 1;
        let retransmit = seq < self.high_water;
        self.high_water = self.high_water.max(self.next_send);
        Some(Outgoing {
            seq,
            packet: self.slots[self.slot(seq)].clone(),
            retransmit,
        })
    }

    /// Applies an ACK for wire block `block`. ACKs outside
    /// `[begin, next_send - 1]` are stale or duplicate and ignored.
    pub fn on_ack(&mut self, block: u16) -> Option<Acked> {
        let offset = u64::from(block.wrapping_sub(self.begin as u16));
        if offset >= self.in_flight() {
            return None;
        }
        let seq = self.begin + offset;
        let bytes = (self.begin..=seq)
            .map(|s| (self.slots[self.slot(s)].len() - HEADER_LEN) as u64)
            .sum();
        let blocks = seq - self.begin + 1;
        self.begin = seq + 1;
        Some(Acked { seq, blocks, bytes })
    }

    /// Go back to the oldest unacknowledged block.
    pub fn rewind(&mut self) {
        self.next_send = self.begin;
    }
}
