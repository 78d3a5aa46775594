//! Socket plumbing shared by the messenger and its connections.
//!
//! - [`DatagramSink`]: where encoded datagrams go. [`UdpOutlet`] writes to the real socket;
//!   tests can record instead.
//! - [`Transmitter`]: per-messenger send state (packet id allocator, payload transforms,
//!   metrics) in front of the sink.
//! - [`LinkSimulator`]: optional inbound latency, jitter and loss for testing.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, trace};

use crate::config::SimulationConfig;
use crate::core::packet::{
    DeliveryMethod, OutboundPacket, PacketFlags, PacketHeader, PacketType,
};
use crate::error::constants;
use crate::error::{ProtocolError, Result};
use crate::utils::compression::{self, Compressor};
use crate::utils::crypto::Cipher;
use crate::utils::metrics::Metrics;

/// Destination for outbound datagrams.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;
}

/// Sink writing to a bound UDP socket.
#[derive(Debug, Clone)]
pub struct UdpOutlet {
    socket: Arc<UdpSocket>,
}

impl UdpOutlet {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl DatagramSink for UdpOutlet {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let sent = self.socket.send_to(datagram, to)?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram truncated by socket",
            ));
        }
        Ok(())
    }
}

/// Optional payload transforms.
#[derive(Clone, Default)]
pub struct Transforms {
    pub compressor: Option<Arc<dyn Compressor>>,
    pub compression_threshold: usize,
    pub cipher: Option<Arc<dyn Cipher>>,
}

impl std::fmt::Debug for Transforms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transforms")
            .field("compressor", &self.compressor.is_some())
            .field("compression_threshold", &self.compression_threshold)
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

/// Send-side state shared by the messenger and every connection.
pub struct Transmitter {
    sink: Arc<dyn DatagramSink>,
    next_id: AtomicU16,
    transforms: Transforms,
    max_packet_size: usize,
    metrics: Arc<Metrics>,
}

impl Transmitter {
    pub fn new(
        sink: Arc<dyn DatagramSink>,
        transforms: Transforms,
        max_packet_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sink,
            next_id: AtomicU16::new(0),
            transforms,
            max_packet_size,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Next outbound packet id; wraps at `u16::MAX`.
    pub fn next_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Encodes a connectionless packet under the next messenger-wide id.
    ///
    /// Returns the id and the complete datagram.
    pub fn encode(&self, packet: OutboundPacket) -> Result<(u16, Vec<u8>)> {
        let id = self.next_id();
        Ok((id, self.encode_as(id, packet)?))
    }

    /// Applies compression and encryption and writes the header with `id`.
    pub fn encode_as(&self, id: u16, mut packet: OutboundPacket) -> Result<Vec<u8>> {
        if packet.payload().len() > self.max_packet_size {
            return Err(ProtocolError::OversizedPacket(packet.payload().len()));
        }

        let mut flags = PacketFlags::for_delivery(packet.delivery());

        if let Some(compressor) = &self.transforms.compressor {
            if let Some(compressed) = compression::maybe_compress(
                packet.payload(),
                compressor.as_ref(),
                self.transforms.compression_threshold,
            )? {
                packet.replace_payload(&compressed);
                flags.insert(PacketFlags::COMPRESSED);
            }
        }

        if packet.wants_encryption() {
            if let Some(cipher) = &self.transforms.cipher {
                let sealed = cipher.encrypt(packet.payload())?;
                packet.replace_payload(&sealed);
                flags.insert(PacketFlags::ENCRYPTED);
            }
        }

        Ok(packet.prepend_header(id, flags))
    }

    /// Reverses encryption and compression on an inbound payload.
    pub fn decode_payload<'a>(&self, flags: PacketFlags, payload: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        let mut data = Cow::Borrowed(payload);

        if flags.contains(PacketFlags::ENCRYPTED) {
            let cipher = self
                .transforms
                .cipher
                .as_ref()
                .ok_or(ProtocolError::Custom(constants::ERR_NO_CIPHER.to_string()))?;
            data = Cow::Owned(cipher.decrypt(&data)?);
        }

        if flags.contains(PacketFlags::COMPRESSED) {
            let compressor = self
                .transforms
                .compressor
                .as_ref()
                .ok_or(ProtocolError::Custom(constants::ERR_NO_COMPRESSOR.to_string()))?;
            data = Cow::Owned(compressor.decompress(&data, self.max_packet_size)?);
        }

        Ok(data)
    }

    /// Writes one datagram to the sink.
    pub fn send(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        match self.sink.send_datagram(to, datagram) {
            Ok(()) => {
                trace!(peer = %to, size = datagram.len(), "Datagram sent");
                self.metrics.datagram_sent(datagram.len());
                Ok(())
            }
            Err(e) => {
                self.metrics.send_error();
                Err(e)
            }
        }
    }

    /// Encodes and sends a packet outside of any connection (no reliability, no chunking).
    pub fn send_connectionless(&self, to: SocketAddr, packet: OutboundPacket) -> Result<u16> {
        let (id, datagram) = self.encode(packet)?;
        self.send(to, &datagram)?;
        Ok(id)
    }

    /// Acknowledges a reliable packet. `id` is the ack's own id.
    pub fn send_ack(&self, to: SocketAddr, id: u16, acked: u16) {
        let header = PacketHeader {
            id,
            packet_type: PacketType::AckResponse,
            flags: PacketFlags::for_delivery(DeliveryMethod::Unreliable),
        };
        if let Err(e) = self.send(to, &header.frame(&acked.to_le_bytes())) {
            error!(peer = %to, error = %e, "Failed to send ack");
        }
    }
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("transforms", &self.transforms)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

/// Simulated link conditions for inbound datagrams.
#[derive(Debug)]
pub struct LinkSimulator {
    config: SimulationConfig,
    delayed: VecDeque<(Instant, SocketAddr, Vec<u8>)>,
}

impl LinkSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            delayed: VecDeque::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.config.simulate_latency || self.config.simulate_loss
    }

    pub fn pending(&self) -> usize {
        self.delayed.len()
    }

    /// Accepts a received datagram; it may be dropped or held back.
    pub fn admit(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) {
        let mut rng = rand::rng();
        if self.config.simulate_loss && rng.random::<f32>() < self.config.loss_rate {
            trace!(peer = %from, "Simulated loss");
            return;
        }

        let mut delay = Duration::ZERO;
        if self.config.simulate_latency {
            delay = self.config.latency;
            let jitter_ms = self.config.jitter.as_millis() as u64;
            if jitter_ms > 0 {
                delay += Duration::from_millis(rng.random_range(0..=jitter_ms));
            }
        }
        let release_at = now + delay;

        // keep release order sorted; jitter may reorder datagrams
        let position = self
            .delayed
            .iter()
            .rposition(|(at, _, _)| *at <= release_at)
            .map_or(0, |p| p + 1);
        self.delayed
            .insert(position, (release_at, from, datagram.to_vec()));
    }

    /// Datagrams whose delay has elapsed.
    pub fn release(&mut self, now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some((at, _, _)) = self.delayed.front() {
            if *at > now {
                break;
            }
            if let Some((_, from, datagram)) = self.delayed.pop_front() {
                out.push((from, datagram));
            }
        }
        out
    }
}
