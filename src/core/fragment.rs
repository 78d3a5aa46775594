//! Splitting oversized datagrams into fragments and reassembling them.
//!
//! A fragment datagram carries the outer header (PARTIAL flag set, type of the inner
//! packet) followed by:
//!
//! ```text
//! [GroupId(2)] [Index(1)] [Total(1)] [Size(2)] [Bytes(Size)]
//! ```
//!
//! The concatenated fragment bytes form the complete inner datagram, header included,
//! so transform flags are honoured on the reassembled packet rather than on each piece.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::core::buffer::{PacketReader, PacketWriter};
use crate::core::packet::{FRAGMENT_HEADER_SIZE, HEADER_SIZE};
use crate::error::constants;
use crate::error::{ProtocolError, Result};

/// Upper bound on fragments per group (index and total are single bytes).
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub group_id: u16,
    pub index: u8,
    pub total: u8,
    pub size: u16,
}

impl FragmentHeader {
    pub fn read(reader: &mut PacketReader<'_>) -> Result<Self> {
        Ok(Self {
            group_id: reader.read_u16()?,
            index: reader.read_u8()?,
            total: reader.read_u8()?,
            size: reader.read_u16()?,
        })
    }

    pub fn write(&self, writer: &mut PacketWriter) {
        writer.write_u16(self.group_id);
        writer.write_u8(self.index);
        writer.write_u8(self.total);
        writer.write_u16(self.size);
    }
}

/// Largest slice of the inner datagram one fragment can carry for a given MTU.
pub fn fragment_capacity(mtu: usize) -> usize {
    mtu.saturating_sub(HEADER_SIZE + FRAGMENT_HEADER_SIZE).max(1)
}

/// Splits `datagram` into fragment bodies (fragment header plus slice, no outer header).
///
/// # Errors
/// Returns `ProtocolError::InvalidFragment` if more than 255 fragments would be needed.
pub fn split(datagram: &[u8], group_id: u16, mtu: usize) -> Result<Vec<Vec<u8>>> {
    let capacity = fragment_capacity(mtu).min(u16::MAX as usize);
    let total = datagram.len().div_ceil(capacity);
    if total == 0 || total > MAX_FRAGMENTS {
        return Err(ProtocolError::InvalidFragment(constants::ERR_TOO_MANY_FRAGMENTS));
    }

    Ok(datagram
        .chunks(capacity)
        .enumerate()
        .map(|(index, slice)| {
            let mut writer = PacketWriter::with_capacity(FRAGMENT_HEADER_SIZE + slice.len());
            FragmentHeader {
                group_id,
                index: index as u8,
                total: total as u8,
                size: slice.len() as u16,
            }
            .write(&mut writer);
            writer.write_bytes(slice);
            writer.into_vec()
        })
        .collect())
}

/// Reassembly accumulator for one fragment group.
#[derive(Debug)]
pub struct PartialPacket {
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    created: Instant,
}

impl PartialPacket {
    pub fn new(total: u8, now: Instant) -> Self {
        Self {
            slots: vec![None; total as usize],
            received: 0,
            created: now,
        }
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Stores a fragment. A slot that is already filled is left untouched.
    ///
    /// Returns `true` if the slot was newly filled.
    pub fn insert(&mut self, index: u8, data: &[u8]) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(slot @ None) => {
                *slot = Some(data.to_vec());
                self.received += 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    /// Concatenates the fragments in index order.
    pub fn assemble(self) -> Vec<u8> {
        let len = self.slots.iter().flatten().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for slot in self.slots.into_iter().flatten() {
            out.extend_from_slice(&slot);
        }
        out
    }
}

/// Per-connection table of in-progress fragment groups.
#[derive(Debug, Default)]
pub struct FragmentTable {
    groups: DashMap<u16, PartialPacket>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Accepts one fragment body.
    ///
    /// Returns the inner datagram once the final missing fragment arrives.
    pub fn accept(&self, body: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        let mut reader = PacketReader::new(body);
        let header = FragmentHeader::read(&mut reader)?;
        if header.total == 0 {
            return Err(ProtocolError::InvalidFragment(constants::ERR_FRAGMENT_EMPTY));
        }
        if header.index >= header.total {
            return Err(ProtocolError::InvalidFragment(constants::ERR_FRAGMENT_INDEX));
        }
        if header.size as usize != reader.remaining() {
            return Err(ProtocolError::InvalidFragment(constants::ERR_FRAGMENT_SIZE));
        }
        let data = reader.read_bytes(header.size as usize)?;

        // entry() holds the shard lock, so two threads cannot both create the group
        match self.groups.entry(header.group_id) {
            Entry::Occupied(mut occupied) => {
                let partial = occupied.get_mut();
                if partial.total() != header.total as usize {
                    return Err(ProtocolError::InvalidFragment(constants::ERR_FRAGMENT_TOTAL));
                }
                if !partial.insert(header.index, data) {
                    debug!(
                        group = header.group_id,
                        index = header.index,
                        "Duplicate fragment ignored"
                    );
                    return Ok(None);
                }
                if partial.is_complete() {
                    Ok(Some(occupied.remove().assemble()))
                } else {
                    Ok(None)
                }
            }
            Entry::Vacant(vacant) => {
                let mut partial = PartialPacket::new(header.total, now);
                partial.insert(header.index, data);
                if partial.is_complete() {
                    Ok(Some(partial.assemble()))
                } else {
                    vacant.insert(partial);
                    Ok(None)
                }
            }
        }
    }

    /// Drops groups that have been incomplete for longer than `max_age`.
    pub fn purge_stale(&self, now: Instant, max_age: Duration) -> usize {
        let before = self.groups.len();
        self.groups
            .retain(|_, partial| now.saturating_duration_since(partial.created) < max_age);
        let removed = before - self.groups.len();
        if removed > 0 {
            debug!(removed, "Dropped stale fragment groups");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_split_sizes() {
        let data = sample(1000);
        let bodies = split(&data, 3, 300).unwrap();
        let capacity = fragment_capacity(300);
        assert_eq!(bodies.len(), data.len().div_ceil(capacity));
        for body in &bodies {
            assert!(body.len() + HEADER_SIZE <= 300);
        }
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let data = sample(2000);
        let bodies = split(&data, 11, 508).unwrap();
        let table = FragmentTable::new();
        let now = Instant::now();

        let mut result = None;
        for body in bodies.iter().rev() {
            result = table.accept(body, now).unwrap();
        }
        assert_eq!(result.unwrap(), data);
        assert_eq!(table.pending_groups(), 0);
    }

    #[test]
    fn test_duplicate_fragment_is_noop() {
        let data = sample(1200);
        let bodies = split(&data, 1, 508).unwrap();
        assert_eq!(bodies.len(), 3);
        let table = FragmentTable::new();
        let now = Instant::now();

        assert!(table.accept(&bodies[0], now).unwrap().is_none());
        assert!(table.accept(&bodies[0], now).unwrap().is_none());
        assert!(table.accept(&bodies[1], now).unwrap().is_none());
        assert_eq!(table.accept(&bodies[2], now).unwrap().unwrap(), data);
    }

    #[test]
    fn test_single_fragment_group() {
        let data = sample(10);
        let bodies = split(&data, 5, 508).unwrap();
        let table = FragmentTable::new();
        assert_eq!(
            table.accept(&bodies[0], Instant::now()).unwrap().unwrap(),
            data
        );
    }

    #[test]
    fn test_too_many_fragments() {
        let data = sample(300 * 256);
        assert!(split(&data, 0, 310).is_err());
    }

    #[test]
    fn test_rejects_bad_index_and_total() {
        let table = FragmentTable::new();
        let now = Instant::now();
        // index 2 of total 2
        assert!(table.accept(&[0, 0, 2, 2, 0, 0], now).is_err());
        // total 0
        assert!(table.accept(&[0, 0, 0, 0, 0, 0], now).is_err());
        // size claims more than present
        assert!(table.accept(&[0, 0, 0, 2, 9, 0, 1], now).is_err());
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let table = FragmentTable::new();
        let now = Instant::now();
        table.accept(&[4, 0, 0, 3, 1, 0, 0xAA], now).unwrap();
        assert!(table.accept(&[4, 0, 1, 2, 1, 0, 0xBB], now).is_err());
    }

    #[test]
    fn test_purge_stale() {
        let data = sample(1200);
        let bodies = split(&data, 9, 508).unwrap();
        let table = FragmentTable::new();
        let start = Instant::now();
        table.accept(&bodies[0], start).unwrap();

        assert_eq!(table.purge_stale(start, Duration::from_secs(1)), 0);
        assert_eq!(
            table.purge_stale(start + Duration::from_secs(2), Duration::from_secs(1)),
            1
        );
    }
}
