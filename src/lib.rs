//! # udp-messenger
//!
//! Reliable messaging over raw UDP, with a channel-based RPC layer on top.
//!
//! ## Features
//! - Three delivery methods: unreliable, reliable, reliable-ordered
//! - Acks and resends driven by a per-connection heartbeat
//! - Chunking of small unreliable packets into one datagram
//! - Fragmentation and reassembly of packets larger than the path MTU
//! - MTU discovery and a ping-driven send throttle
//! - Duplicate suppression of resent packets
//! - Two-phase connect handshake with optional password and approval hook
//! - Flood mitigation for endpoints sending malformed traffic
//! - Optional compression (LZ4/Zstd) and encryption (XChaCha20-Poly1305)
//! - Remote events and remote functions multiplexed over channels
//!
//! ## Quick start
//! ```rust,no_run
//! use udp_messenger::{Client, ClientRole, DeliveryMethod, NetworkConfig, OutboundPacket};
//!
//! # fn main() -> udp_messenger::Result<()> {
//! let client = Client::new(NetworkConfig::default(), ClientRole::new());
//! client.start("0.0.0.0:0".parse().unwrap())?;
//! let server = client.connect("127.0.0.1:7777".parse().unwrap(), Some("secret"))?;
//!
//! let mut packet = OutboundPacket::custom(DeliveryMethod::ReliableOrdered);
//! packet.write_string("hello");
//! server.send_packet(packet)?;
//!
//! loop {
//!     client.update();
//!     while let Some(packet) = client.read_packet() {
//!         let mut reader = packet.reader();
//!         println!("{}", reader.read_string()?);
//!     }
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//! Each messenger runs one network thread. The application thread reads packets with
//! `read_packet()` and runs RPC handlers and lifecycle callbacks with `update()`.

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use crate::core::packet::{DeliveryMethod, InboundPacket, OutboundPacket, PacketType};
pub use error::{ProtocolError, Result};
pub use protocol::channel::{Channel, ChannelKind, RpcValue};
pub use protocol::handshake::{ClientRole, DenialReason, HandshakeRole, ServerRole};
pub use transport::client::{Client, Server};
pub use transport::connection::Connection;
pub use transport::messenger::{Messenger, MessengerEvent};
