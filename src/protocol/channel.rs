//! RPC channels: named remote events and remote functions.
//!
//! A channel is identified by `(ChannelKind, id)` and holds its own event and function
//! tables, so independent subsystems can register the same names without clashing.
//!
//! ```text
//! RemoteEvent:            [Kind(1)] [ChannelId(2)] [Name(str)] [Argc(1)] [Args]
//! RemoteFunction:         [Kind(1)] [ChannelId(2)] [Name(str)] [CallbackId(2)] [Argc(1)] [Args]
//! RemoteFunctionResponse: [Kind(1)] [ChannelId(2)] [CallbackId(2)] [Argc(1)] [Values]
//! ```
//!
//! Handlers run on the thread that calls `Messenger::update`.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::buffer::{PacketReader, PacketWriter};
use crate::core::packet::{DeliveryMethod, OutboundPacket, PacketType};
use crate::error::constants;
use crate::error::{ProtocolError, Result};
use crate::transport::connection::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ChannelKind {
    Normal = 0,
    State = 1,
    Core = 2,
}

/// A typed RPC argument or return value.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Bool(bool),
    U8(u8),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl RpcValue {
    const TAG_BOOL: u8 = 0;
    const TAG_U8: u8 = 1;
    const TAG_I32: u8 = 2;
    const TAG_U32: u8 = 3;
    const TAG_I64: u8 = 4;
    const TAG_U64: u8 = 5;
    const TAG_F32: u8 = 6;
    const TAG_F64: u8 = 7;
    const TAG_STRING: u8 = 8;
    const TAG_BYTES: u8 = 9;

    pub fn write(&self, writer: &mut PacketWriter) {
        match self {
            RpcValue::Bool(v) => {
                writer.write_u8(Self::TAG_BOOL);
                writer.write_bool(*v);
            }
            RpcValue::U8(v) => {
                writer.write_u8(Self::TAG_U8);
                writer.write_u8(*v);
            }
            RpcValue::I32(v) => {
                writer.write_u8(Self::TAG_I32);
                writer.write_i32(*v);
            }
            RpcValue::U32(v) => {
                writer.write_u8(Self::TAG_U32);
                writer.write_u32(*v);
            }
            RpcValue::I64(v) => {
                writer.write_u8(Self::TAG_I64);
                writer.write_i64(*v);
            }
            RpcValue::U64(v) => {
                writer.write_u8(Self::TAG_U64);
                writer.write_u64(*v);
            }
            RpcValue::F32(v) => {
                writer.write_u8(Self::TAG_F32);
                writer.write_f32(*v);
            }
            RpcValue::F64(v) => {
                writer.write_u8(Self::TAG_F64);
                writer.write_f64(*v);
            }
            RpcValue::String(v) => {
                writer.write_u8(Self::TAG_STRING);
                writer.write_string(v);
            }
            RpcValue::Bytes(v) => {
                writer.write_u8(Self::TAG_BYTES);
                writer.write_block(v);
            }
        }
    }

    pub fn read(reader: &mut PacketReader<'_>) -> Result<Self> {
        Ok(match reader.read_u8()? {
            Self::TAG_BOOL => RpcValue::Bool(reader.read_bool()?),
            Self::TAG_U8 => RpcValue::U8(reader.read_u8()?),
            Self::TAG_I32 => RpcValue::I32(reader.read_i32()?),
            Self::TAG_U32 => RpcValue::U32(reader.read_u32()?),
            Self::TAG_I64 => RpcValue::I64(reader.read_i64()?),
            Self::TAG_U64 => RpcValue::U64(reader.read_u64()?),
            Self::TAG_F32 => RpcValue::F32(reader.read_f32()?),
            Self::TAG_F64 => RpcValue::F64(reader.read_f64()?),
            Self::TAG_STRING => RpcValue::String(reader.read_string()?),
            Self::TAG_BYTES => RpcValue::Bytes(reader.read_block()?.to_vec()),
            tag => return Err(ProtocolError::Custom(format!("unknown rpc value tag {tag}"))),
        })
    }

    /// Reads `argc` values.
    pub fn read_all(reader: &mut PacketReader<'_>, argc: u8) -> Result<Vec<Self>> {
        (0..argc).map(|_| Self::read(reader)).collect()
    }

    /// Integer view of any integer variant.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            RpcValue::U8(v) => Some(v.into()),
            RpcValue::I32(v) => Some(v.into()),
            RpcValue::U32(v) => Some(v.into()),
            RpcValue::I64(v) => Some(v),
            RpcValue::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! rpc_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for RpcValue {
            fn from(v: $ty) -> Self {
                RpcValue::$variant(v.into())
            }
        })*
    };
}

rpc_from!(
    bool => Bool,
    u8 => U8,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
);

/// Event handler: sender, argument cursor, argument count.
pub type EventHandler = Arc<dyn Fn(&Arc<Connection>, &mut PacketReader<'_>, u8) + Send + Sync>;

/// Function handler: like an event handler, returns the values sent back to the caller.
pub type FunctionHandler =
    Arc<dyn Fn(&Arc<Connection>, &mut PacketReader<'_>, u8) -> Vec<RpcValue> + Send + Sync>;

/// Callback for one function call: responder, return value cursor, value count.
pub type ResponseHandler = Box<dyn FnOnce(&Arc<Connection>, &mut PacketReader<'_>, u8) + Send>;

struct PendingCall {
    // FnOnce boxes are not Sync; the mutex makes the pending table shareable
    callback: Mutex<ResponseHandler>,
    issued: Instant,
}

pub struct Channel {
    kind: ChannelKind,
    id: u16,
    events: DashMap<String, EventHandler>,
    functions: DashMap<String, FunctionHandler>,
    pending: DashMap<u16, PendingCall>,
    next_callback: AtomicU16,
}

impl Channel {
    pub fn new(kind: ChannelKind, id: u16) -> Self {
        Self {
            kind,
            id,
            events: DashMap::new(),
            functions: DashMap::new(),
            pending: DashMap::new(),
            next_callback: AtomicU16::new(0),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn add_remote_event<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Arc<Connection>, &mut PacketReader<'_>, u8) + Send + Sync + 'static,
    {
        self.events.insert(name.to_string(), Arc::new(handler));
    }

    pub fn add_remote_function<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Arc<Connection>, &mut PacketReader<'_>, u8) -> Vec<RpcValue> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(handler));
    }

    pub fn remove_remote_event(&self, name: &str) -> bool {
        self.events.remove(name).is_some()
    }

    pub fn remove_remote_function(&self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    fn envelope(&self, packet_type: PacketType) -> OutboundPacket {
        let mut packet = OutboundPacket::new(packet_type, DeliveryMethod::ReliableOrdered);
        packet.write_u8(self.kind.into());
        packet.write_u16(self.id);
        packet
    }

    fn write_args(packet: &mut OutboundPacket, args: &[RpcValue]) -> Result<()> {
        let argc = u8::try_from(args.len())
            .map_err(|_| ProtocolError::Custom("too many rpc arguments".to_string()))?;
        packet.write_u8(argc);
        for arg in args {
            arg.write(packet);
        }
        Ok(())
    }

    /// Fires a named event on the remote side of `connection`.
    pub fn fire_event(&self, name: &str, connection: &Connection, args: &[RpcValue]) -> Result<()> {
        let mut packet = self.envelope(PacketType::RemoteEvent);
        packet.write_string(name);
        Self::write_args(&mut packet, args)?;
        connection.send_packet(packet)
    }

    /// Calls a named function on the remote side. `callback` runs with its return values.
    ///
    /// Returns the callback id allocated for the call.
    pub fn call_function<F>(
        &self,
        name: &str,
        connection: &Connection,
        callback: F,
        args: &[RpcValue],
    ) -> Result<u16>
    where
        F: FnOnce(&Arc<Connection>, &mut PacketReader<'_>, u8) + Send + 'static,
    {
        let callback_id = self.register_callback(Box::new(callback), Instant::now());

        let mut packet = self.envelope(PacketType::RemoteFunction);
        packet.write_string(name);
        packet.write_u16(callback_id);
        if let Err(e) = Self::write_args(&mut packet, args)
            .and_then(|()| connection.send_packet(packet))
        {
            self.pending.remove(&callback_id);
            return Err(e);
        }
        Ok(callback_id)
    }

    /// Allocates a callback id that does not collide with a call still in flight.
    fn register_callback(&self, callback: ResponseHandler, now: Instant) -> u16 {
        let pending = PendingCall {
            callback: Mutex::new(callback),
            issued: now,
        };
        loop {
            let id = self.next_callback.fetch_add(1, Ordering::Relaxed);
            match self.pending.entry(id) {
                Entry::Vacant(vacant) => {
                    vacant.insert(pending);
                    return id;
                }
                // still in flight, try the next id
                Entry::Occupied(_) => {}
            }
        }
    }

    pub(crate) fn handle_event(&self, sender: &Arc<Connection>, reader: &mut PacketReader<'_>) -> Result<()> {
        let name = reader.read_string()?;
        let argc = reader.read_u8()?;
        let handler = self.events.get(&name).map(|h| h.value().clone());
        match handler {
            Some(handler) => handler(sender, reader, argc),
            None => warn!(
                channel = self.id,
                event = %name,
                peer = %sender.remote_addr(),
                "{}",
                constants::WARN_UNKNOWN_EVENT
            ),
        }
        Ok(())
    }

    pub(crate) fn handle_function(&self, sender: &Arc<Connection>, reader: &mut PacketReader<'_>) -> Result<()> {
        let name = reader.read_string()?;
        let callback_id = reader.read_u16()?;
        let argc = reader.read_u8()?;
        let handler = self.functions.get(&name).map(|h| h.value().clone());
        let Some(handler) = handler else {
            warn!(
                channel = self.id,
                function = %name,
                peer = %sender.remote_addr(),
                "{}",
                constants::WARN_UNKNOWN_FUNCTION
            );
            return Ok(());
        };

        let values = handler(sender, reader, argc);
        let mut response = self.envelope(PacketType::RemoteFunctionResponse);
        response.write_u16(callback_id);
        Self::write_args(&mut response, &values)?;
        sender.send_packet(response)
    }

    pub(crate) fn handle_response(&self, sender: &Arc<Connection>, reader: &mut PacketReader<'_>) -> Result<()> {
        let callback_id = reader.read_u16()?;
        let argc = reader.read_u8()?;
        match self.pending.remove(&callback_id) {
            Some((_, call)) => (call.callback.into_inner())(sender, reader, argc),
            None => warn!(
                channel = self.id,
                callback_id,
                peer = %sender.remote_addr(),
                "{}",
                constants::WARN_UNKNOWN_CALLBACK
            ),
        }
        Ok(())
    }

    /// Drops calls that have waited longer than `timeout` for a response.
    pub fn expire_calls(&self, now: Instant, timeout: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, call| now.saturating_duration_since(call.issued) < timeout);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!(channel = self.id, expired, "Function calls timed out");
        }
        expired
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("events", &self.events.len())
            .field("functions", &self.functions.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_value_codec() {
        let values = vec![
            RpcValue::Bool(true),
            RpcValue::I32(-3),
            RpcValue::U64(1 << 40),
            RpcValue::F32(1.5),
            RpcValue::from("name"),
            RpcValue::Bytes(vec![1, 2]),
        ];
        let mut writer = PacketWriter::new();
        for value in &values {
            value.write(&mut writer);
        }
        let mut reader = PacketReader::new(writer.as_slice());
        assert_eq!(RpcValue::read_all(&mut reader, 6).unwrap(), values);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_unknown_tag() {
        assert!(RpcValue::read(&mut PacketReader::new(&[42, 0])).is_err());
    }

    #[test]
    fn test_integer_view() {
        assert_eq!(RpcValue::U8(3).as_i64(), Some(3));
        assert_eq!(RpcValue::U64(u64::MAX).as_i64(), None);
        assert_eq!(RpcValue::Bool(true).as_i64(), None);
    }

    #[test]
    fn test_callback_ids_skip_in_flight() {
        let channel = Channel::new(ChannelKind::Normal, 0);
        let now = Instant::now();
        let first = channel.register_callback(Box::new(|_, _, _| {}), now);
        assert_eq!(first, 0);

        // wrap the allocator around onto the in-flight id
        channel.next_callback.store(0, Ordering::Relaxed);
        let second = channel.register_callback(Box::new(|_, _, _| {}), now);
        assert_eq!(second, 1);
        assert_eq!(channel.pending_calls(), 2);
    }

    #[test]
    fn test_expire_calls() {
        let channel = Channel::new(ChannelKind::State, 4);
        let start = Instant::now();
        channel.register_callback(Box::new(|_, _, _| {}), start);
        assert_eq!(channel.expire_calls(start, Duration::from_secs(1)), 0);
        assert_eq!(
            channel.expire_calls(start + Duration::from_secs(2), Duration::from_secs(1)),
            1
        );
        assert_eq!(channel.pending_calls(), 0);
    }
}
