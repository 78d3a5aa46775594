//! # Messenger
//!
//! The socket engine. One `Messenger` owns one UDP socket, the table of live connections
//! and a background network thread.
//!
//! ## Network thread
//! Each loop iteration:
//! 1. drain the socket (optionally through the [`LinkSimulator`])
//! 2. run every datagram through the admission pipeline
//! 3. heartbeat every connection and sweep closed ones
//! 4. maintain the flood guard and the handshake role
//!
//! The loop sleeps 1ms when the socket had nothing to read.
//!
//! ## Admission pipeline
//! ```text
//! ignored? -> header valid? -> reliable? ack -> duplicate? drop
//!   -> decrypt -> decompress -> partial? reassemble -> chunked? explode
//!   -> handshake packets to the role, everything else to its connection
//! ```
//! Malformed datagrams are logged, counted and reported to the flood guard.
//!
//! ## Application thread
//! Inbound application packets, RPC deliveries and lifecycle events are queued by the
//! network thread. [`Messenger::read_packet`] pops application packets and
//! [`Messenger::update`] runs RPC handlers and event callbacks on the caller's thread.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{NetworkConfig, MAX_DATAGRAM_SIZE};
use crate::core::buffer::PacketReader;
use crate::core::chunk::decode_chunk;
use crate::core::packet::{InboundPacket, OutboundPacket, PacketFlags, PacketHeader, PacketType, HEADER_SIZE};
use crate::error::constants;
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::{Channel, ChannelKind};
use crate::protocol::dispatcher::ChannelRegistry;
use crate::protocol::handshake::{ConnectionRequest, DenialReason, HandshakeContext, HandshakeRole};
use crate::transport::connection::Connection;
use crate::transport::socket::{DatagramSink, LinkSimulator, Transforms, Transmitter, UdpOutlet};
use crate::utils::compression::Compressor;
use crate::utils::crypto::Cipher;
use crate::utils::flood_guard::FloodGuard;
use crate::utils::metrics::Metrics;

/// Datagrams read per loop iteration before heartbeats run.
const RECV_BATCH: usize = 256;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Nesting allowed below a top-level datagram (one chunk or one reassembled packet).
const MAX_NESTING: u8 = 1;

/// Lifecycle notifications, delivered by [`Messenger::update`] or [`Messenger::poll_event`].
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    Connected(Arc<Connection>),
    Disconnected {
        endpoint: SocketAddr,
        reason: String,
        /// `true` when the peer went silent past the connection timeout
        lost_connection: bool,
    },
    MtuSet {
        endpoint: SocketAddr,
        mtu: usize,
    },
}

/// An RPC packet waiting for `update()`.
#[derive(Debug)]
pub(crate) struct RpcDelivery {
    pub(crate) connection: Arc<Connection>,
    pub(crate) packet_type: PacketType,
    pub(crate) payload: Vec<u8>,
}

/// State shared between the network thread and the application thread.
pub(crate) struct Hub {
    config: Arc<NetworkConfig>,
    tx: Arc<Transmitter>,
    connections: DashMap<SocketAddr, Arc<Connection>>,
    flood: FloodGuard,
    metrics: Arc<Metrics>,
    events: flume::Sender<MessengerEvent>,
    rpc: flume::Sender<RpcDelivery>,
    inbound: flume::Sender<InboundPacket>,
}

impl Hub {
    pub(crate) fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn send_connectionless(&self, to: SocketAddr, packet: OutboundPacket) -> Result<()> {
        self.tx.send_connectionless(to, packet).map(|_| ())
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn connection(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections.get(addr).map(|c| c.value().clone())
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    pub(crate) fn open_connection(&self, addr: SocketAddr) -> Arc<Connection> {
        if let Some(existing) = self.connection(&addr) {
            if existing.is_connected() {
                return existing;
            }
        }
        let connection = Arc::new(Connection::new(
            addr,
            Arc::clone(&self.config),
            Arc::clone(&self.tx),
            self.events.clone(),
        ));
        if self.connections.insert(addr, Arc::clone(&connection)).is_some() {
            self.metrics.connection_closed();
        }
        self.metrics.connection_opened();
        let _ = self.events.send(MessengerEvent::Connected(Arc::clone(&connection)));
        connection
    }

    /// Removes the connection for `addr` once it is closed.
    fn sweep(&self, addr: &SocketAddr) {
        if self
            .connections
            .remove_if(addr, |_, c| !c.is_connected())
            .is_some()
        {
            debug!(peer = %addr, "Connection removed");
            self.metrics.connection_closed();
        }
    }
}

/// Everything the network thread needs: the hub plus the injected handshake role.
pub(crate) struct Core<R: HandshakeRole> {
    pub(crate) hub: Hub,
    role: Arc<R>,
}

impl<R: HandshakeRole> Core<R> {
    /// Entry point for one received datagram.
    pub(crate) fn process_datagram(&self, from: SocketAddr, data: &[u8], now: Instant) {
        self.hub.metrics.datagram_received(data.len());
        if self.hub.flood.is_ignored(&from, now) {
            self.hub.metrics.ignored();
            trace!(peer = %from, "Datagram from ignored endpoint dropped");
            return;
        }

        if let Err(e) = self.admit(from, data, now, 0) {
            warn!(peer = %from, error = %e, size = data.len(), "{}", constants::WARN_MALFORMED);
            self.hub.metrics.malformed();
            self.hub.flood.report(from, now);
        }
    }

    fn admit(&self, from: SocketAddr, data: &[u8], now: Instant, depth: u8) -> Result<()> {
        if depth > MAX_NESTING {
            return Err(ProtocolError::InvalidHeader(constants::ERR_NESTED_TOO_DEEP));
        }
        let header = PacketHeader::parse(data)?;
        let connection = self.hub.connection(&from);

        // no ack for a packet that will be dropped, so the sender keeps resending it
        // until the handshake has created the connection
        if header.flags.contains(PacketFlags::RELIABLE) {
            match &connection {
                Some(connection) => connection.send_ack(header.id),
                None if header.packet_type.is_handshake() => {
                    self.hub.tx.send_ack(from, self.hub.tx.next_id(), header.id)
                }
                None => {}
            }
        }

        if let Some(connection) = &connection {
            if depth == 0 {
                connection.mark_received(now);
                connection.stats().physical_received(data.len());
            }
            // connectionless handshake packets carry messenger-wide ids, outside the
            // connection's sequence; they are idempotent anyway
            if !header.packet_type.is_handshake() && connection.is_duplicate(header.id, now) {
                self.hub.metrics.duplicate();
                trace!(peer = %from, id = header.id, "Duplicate packet dropped");
                return Ok(());
            }
        }

        let payload = self
            .hub
            .tx
            .decode_payload(header.flags, &data[HEADER_SIZE..])?;

        if header.flags.contains(PacketFlags::PARTIAL) {
            let Some(connection) = &connection else {
                debug!(peer = %from, "Fragment without connection dropped");
                return Ok(());
            };
            if let Some(inner) = connection.accept_fragment(&payload, now)? {
                return self.admit(from, &inner, now, depth + 1);
            }
            return Ok(());
        }

        if header.flags.contains(PacketFlags::CHUNKED) {
            for entry in decode_chunk(&payload)? {
                if let Err(e) = self.admit(from, entry, now, depth + 1) {
                    warn!(peer = %from, error = %e, size = entry.len(), "Dropping malformed chunk entry");
                    self.hub.metrics.malformed();
                    self.hub.flood.report(from, now);
                }
            }
            return Ok(());
        }

        if header.packet_type.is_handshake() {
            return self.handshake(from, header.packet_type, &payload);
        }

        let Some(connection) = connection else {
            debug!(peer = %from, packet_type = ?header.packet_type, "Packet without connection dropped");
            return Ok(());
        };
        let mut reader = PacketReader::new(&payload);

        match header.packet_type {
            PacketType::AckResponse => connection.handle_ack(reader.read_u16()?, now),
            PacketType::PingRequest => connection.handle_ping_request(reader.read_u32()?),
            PacketType::PingResponse => connection.handle_ping_response(reader.read_u32()?, now),
            PacketType::MtuTest => connection.handle_mtu_test(&mut reader, now)?,
            PacketType::Disconnected => {
                let reason = reader.read_string()?;
                connection.close_remote(&reason);
                self.hub.sweep(&from);
            }
            PacketType::RemoteEvent
            | PacketType::RemoteFunction
            | PacketType::RemoteFunctionResponse => {
                connection.stats().logical_received();
                let _ = self.hub.rpc.send(RpcDelivery {
                    connection,
                    packet_type: header.packet_type,
                    payload: payload.into_owned(),
                });
            }
            PacketType::Custom => {
                connection.stats().logical_received();
                let _ = self
                    .hub
                    .inbound
                    .send(InboundPacket::new(header, from, payload.into_owned()));
            }
            PacketType::ConnectionRequest
            | PacketType::ConnectionApproved
            | PacketType::ConnectionDenied
            | PacketType::ConnectionReady => {}
        }
        Ok(())
    }

    fn handshake(&self, from: SocketAddr, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let ctx = HandshakeContext::new(&self.hub);
        let mut reader = PacketReader::new(payload);
        match packet_type {
            PacketType::ConnectionRequest => {
                let request = ConnectionRequest::read(&mut reader)?;
                self.role.handle_request(&ctx, from, request);
            }
            PacketType::ConnectionApproved => self.role.handle_approved(&ctx, from),
            PacketType::ConnectionDenied => {
                let reason = DenialReason::read(&mut reader)?;
                self.role.handle_denied(&ctx, from, reason);
            }
            PacketType::ConnectionReady => self.role.handle_ready(&ctx, from),
            other => {
                debug!(peer = %from, packet_type = ?other, "Not a handshake packet");
            }
        }
        Ok(())
    }

    /// Periodic work: connection heartbeats, sweeping, flood and role maintenance.
    pub(crate) fn tick(&self, now: Instant) {
        for connection in self.hub.connections() {
            connection.heartbeat(now);
            if !connection.is_connected() {
                self.hub.sweep(&connection.remote_addr());
            }
        }
        self.hub.flood.maintain(now);
        self.role.maintain(&HandshakeContext::new(&self.hub), now);
    }

    pub(crate) fn role(&self) -> &Arc<R> {
        &self.role
    }
}

type ConnectedCallback = Box<dyn Fn(&Arc<Connection>) + Send>;
type DisconnectedCallback = Box<dyn Fn(SocketAddr, &str, bool) + Send>;
type MtuSetCallback = Box<dyn Fn(SocketAddr, usize) + Send>;

#[derive(Default)]
struct Callbacks {
    connected: Vec<ConnectedCallback>,
    disconnected: Vec<DisconnectedCallback>,
    mtu_set: Vec<MtuSetCallback>,
}

struct Running<R: HandshakeRole> {
    core: Arc<Core<R>>,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// A UDP messenger whose handshake behaviour is supplied by `R`.
///
/// See [`Client`](crate::transport::client::Client) and
/// [`Server`](crate::transport::client::Server).
pub struct Messenger<R: HandshakeRole> {
    config: Arc<NetworkConfig>,
    role: Arc<R>,
    transforms: Transforms,
    channels: ChannelRegistry,
    metrics: Arc<Metrics>,
    events: (flume::Sender<MessengerEvent>, flume::Receiver<MessengerEvent>),
    rpc: (flume::Sender<RpcDelivery>, flume::Receiver<RpcDelivery>),
    inbound: (flume::Sender<InboundPacket>, flume::Receiver<InboundPacket>),
    callbacks: Mutex<Callbacks>,
    running: Mutex<Option<Running<R>>>,
}

impl<R: HandshakeRole> Messenger<R> {
    pub fn new(config: NetworkConfig, role: R) -> Self {
        let compressor: Option<Arc<dyn Compressor>> = if config.transport.compression_enabled {
            Some(Arc::from(config.transport.compression_kind.compressor()))
        } else {
            None
        };
        let transforms = Transforms {
            compressor,
            compression_threshold: config.transport.compression_threshold_bytes,
            cipher: None,
        };
        Self {
            config: Arc::new(config),
            role: Arc::new(role),
            transforms,
            channels: ChannelRegistry::new(),
            metrics: Arc::new(Metrics::new()),
            events: flume::unbounded(),
            rpc: flume::unbounded(),
            inbound: flume::unbounded(),
            callbacks: Mutex::new(Callbacks::default()),
            running: Mutex::new(None),
        }
    }

    /// Installs the cipher used for packets marked `encrypted()`. Both peers need the same key.
    pub fn with_cipher(mut self, cipher: impl Cipher + 'static) -> Self {
        self.transforms.cipher = Some(Arc::new(cipher));
        self
    }

    /// Installs a compressor, overriding the configured one.
    pub fn with_compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.transforms.compressor = Some(Arc::new(compressor));
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Binds the socket and starts the network thread.
    ///
    /// Returns the bound address (useful when binding port 0).
    #[instrument(level = "debug", skip(self))]
    pub fn start(&self, bind: SocketAddr) -> Result<SocketAddr> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ProtocolError::AlreadyRunning);
        }

        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let core = Arc::new(self.build_core(Arc::new(UdpOutlet::new(Arc::clone(&socket)))));
        let stop = Arc::new(AtomicBool::new(false));
        let simulator = LinkSimulator::new(self.config.simulation.clone());

        let thread = {
            let core = Arc::clone(&core);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("{}-net", self.config.logging.app_name))
                .spawn(move || network_loop(core, socket, stop, simulator))?
        };

        info!(%local_addr, "Messenger started");
        *running = Some(Running {
            core,
            local_addr,
            stop,
            thread: Some(thread),
        });
        Ok(local_addr)
    }

    /// Runs the messenger over an arbitrary sink without a network thread.
    ///
    /// The caller feeds datagrams through `Core::process_datagram` and drives `Core::tick`.
    pub(crate) fn attach(&self, sink: Arc<dyn DatagramSink>, local_addr: SocketAddr) -> Result<Arc<Core<R>>> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ProtocolError::AlreadyRunning);
        }
        let core = Arc::new(self.build_core(sink));
        *running = Some(Running {
            core: Arc::clone(&core),
            local_addr,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        });
        Ok(core)
    }

    fn build_core(&self, sink: Arc<dyn DatagramSink>) -> Core<R> {
        let tx = Arc::new(Transmitter::new(
            sink,
            self.transforms.clone(),
            self.config.transport.max_packet_size,
            Arc::clone(&self.metrics),
        ));
        Core {
            hub: Hub {
                config: Arc::clone(&self.config),
                tx,
                connections: DashMap::new(),
                flood: FloodGuard::new(self.config.flood.clone()),
                metrics: Arc::clone(&self.metrics),
                events: self.events.0.clone(),
                rpc: self.rpc.0.clone(),
                inbound: self.inbound.0.clone(),
            },
            role: Arc::clone(&self.role),
        }
    }

    pub(crate) fn core(&self) -> Result<Arc<Core<R>>> {
        self.running
            .lock()
            .as_ref()
            .map(|running| Arc::clone(&running.core))
            .ok_or(ProtocolError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    /// Disconnects every peer with `reason` and stops the network thread.
    ///
    /// Disconnect events stay queued for the next `update()`.
    #[instrument(level = "debug", skip(self))]
    pub fn shutdown(&self, reason: &str) {
        let Some(mut running) = self.running.lock().take() else {
            return;
        };
        for connection in running.core.hub.connections() {
            connection.disconnect(reason);
            running.core.hub.sweep(&connection.remote_addr());
        }
        running.stop.store(true, Ordering::Release);
        if let Some(thread) = running.thread.take() {
            if thread.join().is_err() {
                error!("Network thread panicked");
            }
        }
        self.metrics.log_metrics();
        info!(local_addr = %running.local_addr, "Messenger stopped");
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.core()
            .map(|core| core.hub.connections())
            .unwrap_or_default()
    }

    pub fn connection(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.core().ok().and_then(|core| core.hub.connection(addr))
    }

    pub fn connection_count(&self) -> usize {
        self.core().map_or(0, |core| core.hub.connection_count())
    }

    /// Sends a packet to a connected peer.
    pub fn send_to(&self, addr: &SocketAddr, packet: OutboundPacket) -> Result<()> {
        self.connection(addr)
            .ok_or(ProtocolError::ConnectionClosed)?
            .send_packet(packet)
    }

    /// Next received application (`Custom`) packet, if any.
    pub fn read_packet(&self) -> Option<InboundPacket> {
        self.inbound.1.try_recv().ok()
    }

    /// Returns the RPC channel, creating it on first use.
    pub fn channel(&self, kind: ChannelKind, id: u16) -> Arc<Channel> {
        self.channels.channel(kind, id)
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn on_connected<F>(&self, callback: F)
    where
        F: Fn(&Arc<Connection>) + Send + 'static,
    {
        self.callbacks.lock().connected.push(Box::new(callback));
    }

    /// `callback(endpoint, reason, lost_connection)`
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: Fn(SocketAddr, &str, bool) + Send + 'static,
    {
        self.callbacks.lock().disconnected.push(Box::new(callback));
    }

    pub fn on_mtu_set<F>(&self, callback: F)
    where
        F: Fn(SocketAddr, usize) + Send + 'static,
    {
        self.callbacks.lock().mtu_set.push(Box::new(callback));
    }

    /// Takes the next lifecycle event without running callbacks.
    pub fn poll_event(&self) -> Option<MessengerEvent> {
        self.events.1.try_recv().ok()
    }

    /// Runs queued RPC handlers and lifecycle callbacks on the calling thread.
    pub fn update(&self) {
        while let Ok(delivery) = self.rpc.1.try_recv() {
            if let Err(e) = self.channels.dispatch(
                &delivery.connection,
                delivery.packet_type,
                &delivery.payload,
            ) {
                warn!(
                    peer = %delivery.connection.remote_addr(),
                    packet_type = ?delivery.packet_type,
                    error = %e,
                    "Failed to dispatch RPC packet"
                );
            }
        }

        self.channels
            .expire_calls(Instant::now(), self.config.connection.function_call_timeout);

        while let Ok(event) = self.events.1.try_recv() {
            self.fire(&event);
        }
    }

    fn fire(&self, event: &MessengerEvent) {
        let callbacks = self.callbacks.lock();
        match event {
            MessengerEvent::Connected(connection) => {
                for callback in &callbacks.connected {
                    callback(connection);
                }
            }
            MessengerEvent::Disconnected {
                endpoint,
                reason,
                lost_connection,
            } => {
                for callback in &callbacks.disconnected {
                    callback(*endpoint, reason, *lost_connection);
                }
            }
            MessengerEvent::MtuSet { endpoint, mtu } => {
                for callback in &callbacks.mtu_set {
                    callback(*endpoint, *mtu);
                }
            }
        }
    }
}

impl<R: HandshakeRole> Drop for Messenger<R> {
    fn drop(&mut self) {
        self.shutdown("messenger dropped");
    }
}

impl<R: HandshakeRole + std::fmt::Debug> std::fmt::Debug for Messenger<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("role", &self.role)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .field("channels", &self.channels.len())
            .finish()
    }
}

fn network_loop<R: HandshakeRole>(
    core: Arc<Core<R>>,
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    mut simulator: LinkSimulator,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let simulate = simulator.is_active();
    debug!(simulate, "Network thread running");

    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        let mut received = 0usize;

        while received < RECV_BATCH {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    received += 1;
                    trace!(peer = %from, size = len, "Datagram received");
                    if simulate {
                        simulator.admit(from, &buf[..len], now);
                    } else {
                        core.process_datagram(from, &buf[..len], now);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send, reported on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    error!(error = %e, "Socket receive failed");
                    break;
                }
            }
        }

        if simulate {
            for (from, datagram) in simulator.release(now) {
                core.process_datagram(from, &datagram, now);
            }
        }

        core.tick(Instant::now());

        if received == 0 {
            thread::sleep(IDLE_SLEEP);
        }
    }
    debug!("Network thread exiting");
}
