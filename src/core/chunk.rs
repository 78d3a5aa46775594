//! Batching of small unreliable datagrams into one physical datagram.
//!
//! ```text
//! [Header(Custom, CHUNKED)] [Count(2)] { [Size(2)] [Datagram(Size)] } * Count
//! ```
//!
//! Every entry is a complete datagram with its own header, so the receiver
//! resubmits each one through the normal inbound path.

use std::time::{Duration, Instant};

use crate::core::buffer::{PacketReader, PacketWriter};
use crate::core::packet::{PacketFlags, PacketHeader, PacketType, HEADER_SIZE};
use crate::error::Result;

/// Bytes a chunk adds before its first entry.
pub const CHUNK_OVERHEAD: usize = HEADER_SIZE + 2;

/// Bytes each entry adds in front of its datagram.
pub const CHUNK_ENTRY_OVERHEAD: usize = 2;

/// Encodes a chunk datagram containing `datagrams`.
pub fn encode_chunk(id: u16, datagrams: &[Vec<u8>]) -> Vec<u8> {
    let header = PacketHeader {
        id,
        packet_type: PacketType::Custom,
        flags: PacketFlags::CHUNKED,
    };
    let body_len: usize = datagrams.iter().map(|d| d.len() + CHUNK_ENTRY_OVERHEAD).sum();
    let mut writer = PacketWriter::with_capacity(CHUNK_OVERHEAD + body_len);
    writer.write_bytes(&header.encode());
    writer.write_u16(datagrams.len() as u16);
    for datagram in datagrams {
        writer.write_u16(datagram.len() as u16);
        writer.write_bytes(datagram);
    }
    writer.into_vec()
}

/// Splits a chunk body (after the outer header) into its entries.
pub fn decode_chunk(body: &[u8]) -> Result<Vec<&[u8]>> {
    let mut reader = PacketReader::new(body);
    let count = reader.read_u16()? as usize;
    // never trust the count for allocation, each entry needs at least two bytes
    let mut entries = Vec::with_capacity(count.min(body.len() / CHUNK_ENTRY_OVERHEAD));
    for _ in 0..count {
        let size = reader.read_u16()? as usize;
        entries.push(reader.read_bytes(size)?);
    }
    Ok(entries)
}

/// Pending unreliable datagrams waiting to be batched.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    pending: Vec<Vec<u8>>,
    encoded_len: usize,
    oldest: Option<Instant>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Size the chunk datagram would have if flushed now.
    pub fn encoded_len(&self) -> usize {
        CHUNK_OVERHEAD + self.encoded_len
    }

    /// Whether adding a datagram of `len` bytes would push the chunk past `mtu`.
    pub fn would_overflow(&self, len: usize, mtu: usize) -> bool {
        !self.is_empty() && self.encoded_len() + CHUNK_ENTRY_OVERHEAD + len > mtu
    }

    pub fn push(&mut self, datagram: Vec<u8>, now: Instant) {
        self.encoded_len += datagram.len() + CHUNK_ENTRY_OVERHEAD;
        self.oldest.get_or_insert(now);
        self.pending.push(datagram);
    }

    /// Whether the oldest pending datagram has waited at least `interval`.
    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        self.oldest
            .is_some_and(|oldest| now.saturating_duration_since(oldest) >= interval)
    }

    pub fn take(&mut self) -> Vec<Vec<u8>> {
        self.encoded_len = 0;
        self.oldest = None;
        std::mem::take(&mut self.pending)
    }
}
