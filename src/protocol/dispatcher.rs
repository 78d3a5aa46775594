use crate::core::buffer::PacketReader;
use crate::core::packet::PacketType;
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::{Channel, ChannelKind};
use crate::transport::connection::Connection;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Channel table routing inbound RPC packets by `(kind, id)`.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<(ChannelKind, u16), Arc<Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel, creating it on first use.
    pub fn channel(&self, kind: ChannelKind, id: u16) -> Arc<Channel> {
        self.channels
            .entry((kind, id))
            .or_insert_with(|| Arc::new(Channel::new(kind, id)))
            .clone()
    }

    pub fn get(&self, kind: ChannelKind, id: u16) -> Option<Arc<Channel>> {
        self.channels.get(&(kind, id)).map(|c| c.value().clone())
    }

    pub fn remove(&self, kind: ChannelKind, id: u16) -> bool {
        self.channels.remove(&(kind, id)).is_some()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Routes one RPC packet body to its channel.
    pub fn dispatch(
        &self,
        sender: &Arc<Connection>,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<()> {
        let mut reader = PacketReader::new(payload);
        let kind = ChannelKind::try_from(reader.read_u8()?)
            .map_err(|_| ProtocolError::UnknownChannel)?;
        let id = reader.read_u16()?;

        let Some(channel) = self.get(kind, id) else {
            warn!(?kind, id, peer = %sender.remote_addr(), "RPC for unregistered channel");
            return Err(ProtocolError::UnknownChannel);
        };

        match packet_type {
            PacketType::RemoteEvent => channel.handle_event(sender, &mut reader),
            PacketType::RemoteFunction => channel.handle_function(sender, &mut reader),
            PacketType::RemoteFunctionResponse => channel.handle_response(sender, &mut reader),
            other => Err(ProtocolError::Custom(format!(
                "{other:?} is not an RPC packet"
            ))),
        }
    }

    /// Drops pending function calls older than `timeout` on every channel.
    pub fn expire_calls(&self, now: Instant, timeout: Duration) -> usize {
        let channels: Vec<Arc<Channel>> =
            self.channels.iter().map(|c| c.value().clone()).collect();
        channels
            .iter()
            .map(|channel| channel.expire_calls(now, timeout))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_created_once() {
        let registry = ChannelRegistry::new();
        let a = registry.channel(ChannelKind::Normal, 1);
        let b = registry.channel(ChannelKind::Normal, 1);
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.channel(ChannelKind::Core, 1);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lookup_and_remove() {
        let registry = ChannelRegistry::new();
        assert!(registry.get(ChannelKind::State, 9).is_none());
        registry.channel(ChannelKind::State, 9);
        assert!(registry.get(ChannelKind::State, 9).is_some());
        assert!(registry.remove(ChannelKind::State, 9));
        assert!(registry.is_empty());
    }
}
