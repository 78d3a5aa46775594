//! Packet header, packet types and the outbound/inbound packet views.
//!
//! ```text
//! [Id(2, LE)] [Type(1)] [Flags(1)] [Payload(N)]
//! ```
//!
//! Outbound packets reserve header space up front and write the header last, once the
//! final id and flags are known.

use std::fmt;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::core::buffer::{PacketReader, PacketWriter};
use crate::error::constants;
use crate::error::{ProtocolError, Result};

/// Fixed wire header size: id + type + flags.
pub const HEADER_SIZE: usize = 4;

/// Fragment header size: group id + index + total + size.
pub const FRAGMENT_HEADER_SIZE: usize = 6;

/// Space reserved in front of every outbound payload.
pub const RESERVED_SIZE: usize = HEADER_SIZE + FRAGMENT_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest = 0,
    ConnectionApproved = 1,
    ConnectionDenied = 2,
    ConnectionReady = 3,
    Disconnected = 4,
    PingRequest = 5,
    PingResponse = 6,
    AckResponse = 7,
    MtuTest = 8,
    RemoteEvent = 9,
    RemoteFunction = 10,
    RemoteFunctionResponse = 11,
    Custom = 12,
}

impl PacketType {
    /// Types that are legal before a connection exists.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::ConnectionRequest
                | PacketType::ConnectionApproved
                | PacketType::ConnectionDenied
                | PacketType::ConnectionReady
        )
    }
}

/// Header flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const RELIABLE: PacketFlags = PacketFlags(0x01);
    pub const ORDERED: PacketFlags = PacketFlags(0x02);
    pub const ENCRYPTED: PacketFlags = PacketFlags(0x04);
    pub const COMPRESSED: PacketFlags = PacketFlags(0x08);
    pub const CHUNKED: PacketFlags = PacketFlags(0x10);
    pub const PARTIAL: PacketFlags = PacketFlags(0x20);

    const KNOWN: u8 = 0x3F;

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Rejects unknown bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::KNOWN == 0 {
            Some(PacketFlags(bits))
        } else {
            None
        }
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }

    pub fn for_delivery(method: DeliveryMethod) -> Self {
        match method {
            DeliveryMethod::Unreliable => PacketFlags::empty(),
            DeliveryMethod::Reliable => PacketFlags::RELIABLE,
            DeliveryMethod::ReliableOrdered => {
                PacketFlags(PacketFlags::RELIABLE.0 | PacketFlags::ORDERED.0)
            }
        }
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PacketFlags, &str); 6] = [
            (PacketFlags::RELIABLE, "RELIABLE"),
            (PacketFlags::ORDERED, "ORDERED"),
            (PacketFlags::ENCRYPTED, "ENCRYPTED"),
            (PacketFlags::COMPRESSED, "COMPRESSED"),
            (PacketFlags::CHUNKED, "CHUNKED"),
            (PacketFlags::PARTIAL, "PARTIAL"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "PacketFlags({})", set.join(" | "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMethod {
    /// Fire and forget. Small packets are batched into chunks.
    #[default]
    Unreliable,
    /// Acked and resent until acked, in any order.
    Reliable,
    /// Acked and resent; only the head of the queue is in flight.
    ReliableOrdered,
}

impl DeliveryMethod {
    pub fn from_flags(flags: PacketFlags) -> Self {
        if flags.contains(PacketFlags::ORDERED) {
            DeliveryMethod::ReliableOrdered
        } else if flags.contains(PacketFlags::RELIABLE) {
            DeliveryMethod::Reliable
        } else {
            DeliveryMethod::Unreliable
        }
    }

    pub fn is_reliable(self) -> bool {
        !matches!(self, DeliveryMethod::Unreliable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: u16,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
}

impl PacketHeader {
    /// Parses and validates the header at the start of a datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader(constants::ERR_HEADER_TOO_SHORT));
        }
        let mut reader = PacketReader::new(datagram);
        let id = reader.read_u16()?;
        let packet_type = PacketType::try_from(reader.read_u8()?)
            .map_err(|_| ProtocolError::InvalidHeader(constants::ERR_UNKNOWN_PACKET_TYPE))?;
        let flags = PacketFlags::from_bits(reader.read_u8()?)
            .ok_or(ProtocolError::InvalidHeader(constants::ERR_UNKNOWN_FLAGS))?;

        if flags.contains(PacketFlags::ORDERED) && !flags.contains(PacketFlags::RELIABLE) {
            return Err(ProtocolError::InvalidHeader(
                constants::ERR_ORDERED_NOT_RELIABLE,
            ));
        }
        if flags.contains(PacketFlags::CHUNKED) && flags.contains(PacketFlags::PARTIAL) {
            return Err(ProtocolError::InvalidHeader(constants::ERR_CHUNKED_AND_PARTIAL));
        }

        Ok(Self {
            id,
            packet_type,
            flags,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let id = self.id.to_le_bytes();
        [id[0], id[1], self.packet_type.into(), self.flags.bits()]
    }

    pub fn delivery(&self) -> DeliveryMethod {
        DeliveryMethod::from_flags(self.flags)
    }

    /// Builds a complete datagram from this header and a body.
    pub fn frame(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(body);
        out
    }
}

/// Clears the reliable and ordered bits of an encoded datagram in place.
pub(crate) fn clear_delivery_bits(datagram: &mut [u8]) {
    if let Some(flags) = datagram.get_mut(3) {
        *flags &= !(PacketFlags::RELIABLE.bits() | PacketFlags::ORDERED.bits());
    }
}

/// A packet being built for sending.
///
/// Derefs to [`PacketWriter`] so payload fields are written directly. The id and flags
/// are assigned when the packet is sent; `send_packet` consumes it so one packet object
/// can only go out once.
#[derive(Debug)]
pub struct OutboundPacket {
    writer: PacketWriter,
    packet_type: PacketType,
    delivery: DeliveryMethod,
    encrypt: bool,
    immediate: bool,
}

impl OutboundPacket {
    pub fn new(packet_type: PacketType, delivery: DeliveryMethod) -> Self {
        let mut writer = PacketWriter::with_capacity(64);
        writer.write_zeros(RESERVED_SIZE);
        Self {
            writer,
            packet_type,
            delivery,
            encrypt: false,
            immediate: false,
        }
    }

    /// Application data packet, delivered through `read_packet` on the peer.
    pub fn custom(delivery: DeliveryMethod) -> Self {
        Self::new(PacketType::Custom, delivery)
    }

    /// Requests encryption when a cipher is installed.
    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    /// Skips the chunk buffer for unreliable packets.
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn delivery(&self) -> DeliveryMethod {
        self.delivery
    }

    pub fn wants_encryption(&self) -> bool {
        self.encrypt
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn payload(&self) -> &[u8] {
        &self.writer.as_slice()[RESERVED_SIZE..]
    }

    /// Replaces the payload after a transform (compression, encryption).
    pub(crate) fn replace_payload(&mut self, payload: &[u8]) {
        self.writer.truncate(RESERVED_SIZE);
        self.writer.write_bytes(payload);
    }

    /// Writes the header into the reserved space and removes the unused padding.
    pub(crate) fn prepend_header(mut self, id: u16, flags: PacketFlags) -> Vec<u8> {
        let header = PacketHeader {
            id,
            packet_type: self.packet_type,
            flags,
        };
        let start = RESERVED_SIZE - HEADER_SIZE;
        self.writer.as_mut_slice()[start..RESERVED_SIZE].copy_from_slice(&header.encode());
        self.writer.advance_front(start);
        self.writer.into_vec()
    }
}

impl Deref for OutboundPacket {
    type Target = PacketWriter;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

impl DerefMut for OutboundPacket {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.writer
    }
}

/// A received application packet.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    header: PacketHeader,
    sender: SocketAddr,
    payload: Vec<u8>,
}

impl InboundPacket {
    pub(crate) fn new(header: PacketHeader, sender: SocketAddr, payload: Vec<u8>) -> Self {
        Self {
            header,
            sender,
            payload,
        }
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn flags(&self) -> PacketFlags {
        self.header.flags
    }

    pub fn sender(&self) -> SocketAddr {
        self.sender
    }

    /// Payload after decryption and decompression.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_prepend_header_strips_padding() {
        let mut packet = OutboundPacket::custom(DeliveryMethod::Reliable);
        packet.write_u16(0xBEEF);
        let datagram = packet.prepend_header(7, PacketFlags::RELIABLE);

        assert_eq!(datagram.len(), HEADER_SIZE + 2);
        let header = PacketHeader::parse(&datagram).unwrap();
        assert_eq!(header.id, 7);
        assert_eq!(header.packet_type, PacketType::Custom);
        assert_eq!(header.delivery(), DeliveryMethod::Reliable);
        assert_eq!(&datagram[HEADER_SIZE..], &[0xEF, 0xBE]);
    }

    #[test]
    fn test_header_rejects_short_datagram() {
        assert!(matches!(
            PacketHeader::parse(&[1, 2, 3]),
            Err(ProtocolError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        assert!(PacketHeader::parse(&[0, 0, 200, 0]).is_err());
    }

    #[test]
    fn test_header_rejects_unknown_flag_bits() {
        assert!(PacketHeader::parse(&[0, 0, 12, 0x40]).is_err());
        assert!(PacketHeader::parse(&[0, 0, 12, 0x80]).is_err());
    }

    #[test]
    fn test_header_rejects_ordered_without_reliable() {
        assert!(PacketHeader::parse(&[0, 0, 12, 0x02]).is_err());
        assert!(PacketHeader::parse(&[0, 0, 12, 0x03]).is_ok());
    }

    #[test]
    fn test_header_rejects_chunked_partial() {
        assert!(PacketHeader::parse(&[0, 0, 12, 0x30]).is_err());
    }

    #[test]
    fn test_replace_payload() {
        let mut packet = OutboundPacket::custom(DeliveryMethod::Unreliable);
        packet.write_bytes(&[1, 2, 3, 4]);
        packet.replace_payload(&[9]);
        assert_eq!(packet.payload(), &[9]);
    }

    #[test]
    fn test_clear_delivery_bits() {
        let mut datagram = PacketHeader {
            id: 1,
            packet_type: PacketType::Custom,
            flags: PacketFlags::for_delivery(DeliveryMethod::ReliableOrdered)
                | PacketFlags::COMPRESSED,
        }
        .frame(&[]);
        clear_delivery_bits(&mut datagram);
        let header = PacketHeader::parse(&datagram).unwrap();
        assert_eq!(header.flags, PacketFlags::COMPRESSED);
    }

    #[test]
    fn test_flags_debug() {
        let flags = PacketFlags::RELIABLE | PacketFlags::PARTIAL;
        assert_eq!(format!("{flags:?}"), "PacketFlags(RELIABLE | PARTIAL)");
    }
}
