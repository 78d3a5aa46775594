//! Connection handshake.
//!
//! ```text
//! client                         server
//!   | -- ConnectionRequest -------> |  capacity, password, approval hook
//!   | <------- ConnectionApproved - |  endpoint becomes provisional
//!   | -- ConnectionReady (rel) ---> |  provisional -> Connection, "connected"
//! ```
//!
//! A denial answers `ConnectionDenied{reason}` instead of approving. The client opens its
//! `Connection` as soon as it is approved; the server only promotes the endpoint once the
//! second round trip (`ConnectionReady`) arrives, so a spoofed request alone never creates
//! server-side state beyond a short-lived provisional entry.
//!
//! **Role injection**
//! The messenger is generic over a [`HandshakeRole`]. [`ClientRole`] and [`ServerRole`]
//! hold the state machine for their side; the messenger calls into them through a
//! [`HandshakeContext`] that exposes only what a handshake needs.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{NetworkConfig, ServerConfig};
use crate::core::buffer::{PacketReader, PacketWriter};
use crate::core::packet::{DeliveryMethod, OutboundPacket, PacketType};
use crate::error::{ProtocolError, Result};
use crate::transport::connection::Connection;
use crate::transport::messenger::Hub;

/// Why a server refused a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    ServerFull,
    InvalidPassword,
    /// Refused by the application's approval hook.
    Rejected(String),
}

impl DenialReason {
    const SERVER_FULL: u8 = 0;
    const INVALID_PASSWORD: u8 = 1;
    const REJECTED: u8 = 2;

    pub fn write(&self, writer: &mut PacketWriter) {
        match self {
            DenialReason::ServerFull => writer.write_u8(Self::SERVER_FULL),
            DenialReason::InvalidPassword => writer.write_u8(Self::INVALID_PASSWORD),
            DenialReason::Rejected(text) => {
                writer.write_u8(Self::REJECTED);
                writer.write_string(text);
            }
        }
    }

    pub fn read(reader: &mut PacketReader<'_>) -> Result<Self> {
        match reader.read_u8()? {
            Self::SERVER_FULL => Ok(DenialReason::ServerFull),
            Self::INVALID_PASSWORD => Ok(DenialReason::InvalidPassword),
            Self::REJECTED => Ok(DenialReason::Rejected(reader.read_string()?)),
            _ => Err(ProtocolError::Custom("unknown denial reason".to_string())),
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::ServerFull => f.write_str("server full"),
            DenialReason::InvalidPassword => f.write_str("invalid password"),
            DenialReason::Rejected(text) => write!(f, "rejected: {text}"),
        }
    }
}

/// Body of a `ConnectionRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionRequest {
    pub password: Option<String>,
    /// Opaque application data handed to the approval hook.
    pub hail: Vec<u8>,
}

impl ConnectionRequest {
    pub fn write(&self, writer: &mut PacketWriter) {
        match &self.password {
            Some(password) => {
                writer.write_bool(true);
                writer.write_string(password);
            }
            None => writer.write_bool(false),
        }
        writer.write_block(&self.hail);
    }

    pub fn read(reader: &mut PacketReader<'_>) -> Result<Self> {
        let password = if reader.read_bool()? {
            Some(reader.read_string()?)
        } else {
            None
        };
        let hail = reader.read_block()?.to_vec();
        Ok(Self { password, hail })
    }

    pub fn to_packet(&self) -> OutboundPacket {
        let mut packet =
            OutboundPacket::new(PacketType::ConnectionRequest, DeliveryMethod::Unreliable)
                .immediate();
        self.write(&mut packet);
        packet
    }
}

/// What a handshake role may do to the messenger.
pub struct HandshakeContext<'a> {
    pub(crate) hub: &'a Hub,
}

impl<'a> HandshakeContext<'a> {
    pub(crate) fn new(hub: &'a Hub) -> Self {
        Self { hub }
    }

    pub fn config(&self) -> &NetworkConfig {
        self.hub.config()
    }

    /// Sends a connectionless packet.
    pub fn send(&self, to: SocketAddr, packet: OutboundPacket) -> Result<()> {
        self.hub.send_connectionless(to, packet)
    }

    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }

    pub fn connection(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.hub.connection(addr)
    }

    /// Creates and tracks a connection to `addr` and queues the connected event.
    pub fn open_connection(&self, addr: SocketAddr) -> Arc<Connection> {
        self.hub.open_connection(addr)
    }
}

/// Role-specific handshake behaviour injected into the messenger.
pub trait HandshakeRole: Send + Sync + 'static {
    fn handle_request(&self, ctx: &HandshakeContext<'_>, from: SocketAddr, request: ConnectionRequest);

    fn handle_approved(&self, ctx: &HandshakeContext<'_>, from: SocketAddr);

    fn handle_denied(&self, ctx: &HandshakeContext<'_>, from: SocketAddr, reason: DenialReason);

    fn handle_ready(&self, ctx: &HandshakeContext<'_>, from: SocketAddr);

    /// Periodic upkeep on the network thread.
    fn maintain(&self, _ctx: &HandshakeContext<'_>, _now: Instant) {}
}

// =================== Client ===================

/// Result of one connect attempt, handed from the network thread to the caller.
pub(crate) type ConnectOutcome = std::result::Result<Arc<Connection>, DenialReason>;

#[derive(Debug)]
enum ClientState {
    Idle,
    Connecting {
        target: SocketAddr,
        outcome: flume::Sender<ConnectOutcome>,
    },
    Connected(SocketAddr),
}

#[derive(Debug)]
pub struct ClientRole {
    state: Mutex<ClientState>,
}

impl ClientRole {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClientState::Idle),
        }
    }

    /// Enters the connecting state. `is_connected` tells whether an earlier server
    /// connection is still alive.
    pub(crate) fn begin(
        &self,
        target: SocketAddr,
        is_connected: impl Fn(&SocketAddr) -> bool,
    ) -> Result<flume::Receiver<ConnectOutcome>> {
        let mut state = self.state.lock();
        match &*state {
            ClientState::Connecting { .. } => return Err(ProtocolError::AlreadyConnecting),
            ClientState::Connected(addr) if is_connected(addr) => {
                return Err(ProtocolError::AlreadyConnected)
            }
            _ => {}
        }
        let (outcome, receiver) = flume::bounded(1);
        *state = ClientState::Connecting { target, outcome };
        Ok(receiver)
    }

    /// Leaves the connecting state after a denial or timeout.
    pub(crate) fn abort(&self) {
        let mut state = self.state.lock();
        if matches!(&*state, ClientState::Connecting { .. }) {
            *state = ClientState::Idle;
        }
    }

    pub fn server(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            ClientState::Connected(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn is_connecting(&self) -> bool {
        matches!(&*self.state.lock(), ClientState::Connecting { .. })
    }
}

impl Default for ClientRole {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeRole for ClientRole {
    fn handle_request(&self, _ctx: &HandshakeContext<'_>, from: SocketAddr, _request: ConnectionRequest) {
        debug!(peer = %from, "Client ignoring connection request");
    }

    #[instrument(level = "debug", skip(self, ctx))]
    fn handle_approved(&self, ctx: &HandshakeContext<'_>, from: SocketAddr) {
        let mut state = self.state.lock();
        let outcome = match &*state {
            ClientState::Connecting { target, outcome } if *target == from => outcome.clone(),
            _ => {
                debug!(peer = %from, "Unexpected approval ignored");
                return;
            }
        };

        let connection = ctx.open_connection(from);
        let ready = OutboundPacket::new(PacketType::ConnectionReady, DeliveryMethod::Reliable);
        if let Err(e) = connection.send_packet(ready) {
            warn!(peer = %from, error = %e, "Failed to send connection ready");
        }
        *state = ClientState::Connected(from);
        info!(peer = %from, "Connection approved");
        let _ = outcome.try_send(Ok(connection));
    }

    fn handle_denied(&self, _ctx: &HandshakeContext<'_>, from: SocketAddr, reason: DenialReason) {
        let mut state = self.state.lock();
        if let ClientState::Connecting { target, outcome } = &*state {
            if *target == from {
                info!(peer = %from, %reason, "Connection denied");
                let _ = outcome.try_send(Err(reason));
                *state = ClientState::Idle;
            }
        }
    }

    fn handle_ready(&self, _ctx: &HandshakeContext<'_>, from: SocketAddr) {
        debug!(peer = %from, "Client ignoring connection ready");
    }

    fn maintain(&self, ctx: &HandshakeContext<'_>, _now: Instant) {
        let mut state = self.state.lock();
        if let ClientState::Connected(addr) = &*state {
            if ctx.connection(addr).is_none() {
                *state = ClientState::Idle;
            }
        }
    }
}

// =================== Server ===================

type ApprovalFn =
    dyn Fn(SocketAddr, &ConnectionRequest) -> std::result::Result<(), String> + Send + Sync;

pub struct ServerRole {
    password: Option<String>,
    max_connections: usize,
    provisional_timeout: Duration,
    /// Approved endpoints waiting for their `ConnectionReady`
    provisional: DashMap<SocketAddr, Instant>,
    approval: Option<Box<ApprovalFn>>,
}

impl ServerRole {
    pub fn new(config: &NetworkConfig) -> Self {
        Self::from_parts(&config.server, config.connection.connection_timeout)
    }

    pub fn from_parts(server: &ServerConfig, provisional_timeout: Duration) -> Self {
        Self {
            password: server.password.clone(),
            max_connections: server.max_connections,
            provisional_timeout,
            provisional: DashMap::new(),
            approval: None,
        }
    }

    /// Installs a hook that can refuse a request with a custom reason.
    pub fn with_approval<F>(mut self, hook: F) -> Self
    where
        F: Fn(SocketAddr, &ConnectionRequest) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        self.approval = Some(Box::new(hook));
        self
    }

    pub fn provisional_count(&self) -> usize {
        self.provisional.len()
    }

    fn check(&self, ctx: &HandshakeContext<'_>, from: SocketAddr, request: &ConnectionRequest) -> std::result::Result<(), DenialReason> {
        if ctx.connection_count() + self.provisional.len() >= self.max_connections {
            return Err(DenialReason::ServerFull);
        }
        if let Some(expected) = &self.password {
            if request.password.as_deref() != Some(expected.as_str()) {
                return Err(DenialReason::InvalidPassword);
            }
        }
        if let Some(hook) = &self.approval {
            hook(from, request).map_err(DenialReason::Rejected)?;
        }
        Ok(())
    }

    fn approve(&self, ctx: &HandshakeContext<'_>, to: SocketAddr) {
        let packet =
            OutboundPacket::new(PacketType::ConnectionApproved, DeliveryMethod::Unreliable)
                .immediate();
        if let Err(e) = ctx.send(to, packet) {
            warn!(peer = %to, error = %e, "Failed to send approval");
        }
    }
}

impl fmt::Debug for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRole")
            .field("max_connections", &self.max_connections)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("provisional", &self.provisional.len())
            .field("approval", &self.approval.is_some())
            .finish()
    }
}

impl HandshakeRole for ServerRole {
    #[instrument(level = "debug", skip(self, ctx, request))]
    fn handle_request(&self, ctx: &HandshakeContext<'_>, from: SocketAddr, request: ConnectionRequest) {
        if ctx.connection(&from).is_some() {
            debug!(peer = %from, "Request from connected endpoint ignored");
            return;
        }
        if self.provisional.contains_key(&from) {
            // our approval was lost, say it again
            self.approve(ctx, from);
            return;
        }

        match self.check(ctx, from, &request) {
            Ok(()) => {
                self.provisional.insert(from, Instant::now());
                debug!(peer = %from, "Connection approved, awaiting ready");
                self.approve(ctx, from);
            }
            Err(reason) => {
                info!(peer = %from, %reason, "Connection denied");
                let mut packet =
                    OutboundPacket::new(PacketType::ConnectionDenied, DeliveryMethod::Unreliable)
                        .immediate();
                reason.write(&mut packet);
                if let Err(e) = ctx.send(from, packet) {
                    warn!(peer = %from, error = %e, "Failed to send denial");
                }
            }
        }
    }

    fn handle_approved(&self, _ctx: &HandshakeContext<'_>, from: SocketAddr) {
        debug!(peer = %from, "Server ignoring approval");
    }

    fn handle_denied(&self, _ctx: &HandshakeContext<'_>, from: SocketAddr, _reason: DenialReason) {
        debug!(peer = %from, "Server ignoring denial");
    }

    fn handle_ready(&self, ctx: &HandshakeContext<'_>, from: SocketAddr) {
        if self.provisional.remove(&from).is_some() {
            ctx.open_connection(from);
            info!(peer = %from, "Client connected");
        } else {
            debug!(peer = %from, "Ready from unknown or connected endpoint ignored");
        }
    }

    fn maintain(&self, _ctx: &HandshakeContext<'_>, now: Instant) {
        self.provisional.retain(|addr, approved_at| {
            let keep = now.saturating_duration_since(*approved_at) < self.provisional_timeout;
            if !keep {
                debug!(peer = %addr, "Provisional connection expired");
            }
            keep
        });
    }
}
