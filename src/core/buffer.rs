//! Growable write buffer and bounds-checked read cursor.
//!
//! All fixed-width integers are little-endian. Variable-length integers use the LEB128
//! encoding from `bytes-varint`. Strings and byte blocks are written as a varint length
//! followed by the raw bytes.

use bytes::{BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::error::{ProtocolError, Result};

/// Append-only buffer used to build packet payloads.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn write_var_u32(&mut self, v: u32) {
        self.buf.put_u32_varint(v);
    }

    pub fn write_var_u64(&mut self, v: u64) {
        self.buf.put_u64_varint(v);
    }

    /// Writes a varint length prefix followed by the UTF-8 bytes.
    pub fn write_string(&mut self, s: &str) {
        self.write_block(s.as_bytes());
    }

    /// Writes a varint length prefix followed by the bytes.
    pub fn write_block(&mut self, data: &[u8]) {
        self.buf.put_u64_varint(data.len() as u64);
        self.buf.put_slice(data);
    }

    /// Writes raw bytes with no length prefix.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Appends `count` zero bytes.
    pub fn write_zeros(&mut self, count: usize) {
        self.buf.put_bytes(0, count);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Drops everything after `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Removes the first `count` bytes.
    pub(crate) fn advance_front(&mut self, count: usize) {
        let _ = self.buf.split_to(count.min(self.buf.len()));
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Read cursor over a received datagram.
///
/// Every read checks the remaining length first and fails with
/// [`ProtocolError::BufferOverrun`] instead of reading past the end.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_fixed {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty> {
            let bytes = self.take(std::mem::size_of::<$ty>())?;
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            Ok(<$ty>::from_le_bytes(raw))
        }
    };
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread part of the buffer, without advancing.
    pub fn remaining_slice(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(ProtocolError::BufferOverrun { needed, remaining });
        }
        let out = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(out)
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    read_fixed!(read_u8, u8);
    read_fixed!(read_i8, i8);
    read_fixed!(read_u16, u16);
    read_fixed!(read_i16, i16);
    read_fixed!(read_u32, u32);
    read_fixed!(read_i32, i32);
    read_fixed!(read_u64, u64);
    read_fixed!(read_i64, i64);
    read_fixed!(read_f32, f32);
    read_fixed!(read_f64, f64);

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        let mut rest = self.remaining_slice();
        let before = rest.len();
        let value = rest
            .get_u32_varint()
            .map_err(|_| ProtocolError::BufferOverrun {
                needed: before + 1,
                remaining: before,
            })?;
        self.pos += before - rest.len();
        Ok(value)
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut rest = self.remaining_slice();
        let before = rest.len();
        let value = rest
            .get_u64_varint()
            .map_err(|_| ProtocolError::BufferOverrun {
                needed: before + 1,
                remaining: before,
            })?;
        self.pos += before - rest.len();
        Ok(value)
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Reads a varint-length-prefixed byte block.
    pub fn read_block(&mut self) -> Result<&'a [u8]> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::OversizedPacket(usize::MAX))?;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_block()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidString)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_fixed_width_little_endian() {
        let mut w = PacketWriter::new();
        w.write_u16(0x0102);
        w.write_u32(0xAABBCCDD);
        assert_eq!(w.as_slice(), &[0x02, 0x01, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_mixed_primitives() {
        let mut w = PacketWriter::new();
        w.write_bool(true);
        w.write_i32(-7);
        w.write_f64(2.5);
        w.write_var_u32(300);
        w.write_string("héllo");
        w.write_block(&[9, 8, 7]);

        let mut r = PacketReader::new(w.as_slice());
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_f64().unwrap(), 2.5);
        assert_eq!(r.read_var_u32().unwrap(), 300);
        assert_eq!(r.read_string().unwrap(), "héllo");
        assert_eq!(r.read_block().unwrap(), &[9, 8, 7]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_overrun_reports_sizes() {
        let mut r = PacketReader::new(&[1, 2, 3]);
        r.read_u16().unwrap();
        match r.read_u32() {
            Err(ProtocolError::BufferOverrun { needed, remaining }) => {
                assert_eq!(needed, 4);
                assert_eq!(remaining, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        // a failed read does not move the cursor
        assert_eq!(r.position(), 2);
    }

    #[test]
    fn test_string_length_past_end() {
        let mut w = PacketWriter::new();
        w.write_var_u32(50);
        w.write_bytes(b"short");
        let mut r = PacketReader::new(w.as_slice());
        assert!(matches!(
            r.read_string(),
            Err(ProtocolError::BufferOverrun { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut w = PacketWriter::new();
        w.write_block(&[0xff, 0xfe]);
        let mut r = PacketReader::new(w.as_slice());
        assert!(matches!(r.read_string(), Err(ProtocolError::InvalidString)));
    }

    #[test]
    fn test_truncated_varint() {
        let mut r = PacketReader::new(&[0x80, 0x80]);
        assert!(r.read_var_u32().is_err());
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn test_advance_front_and_truncate() {
        let mut w = PacketWriter::new();
        w.write_bytes(&[0, 0, 1, 2, 3, 4]);
        w.advance_front(2);
        w.truncate(3);
        assert_eq!(w.as_slice(), &[1, 2, 3]);
    }
}
