//! Role-specific messenger APIs.
//!
//! [`Client`] connects to exactly one server; [`Server`] listens and accepts many clients.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{ClientRole, ConnectionRequest, ServerRole};
use crate::transport::connection::Connection;
use crate::transport::messenger::Messenger;

pub type Client = Messenger<ClientRole>;
pub type Server = Messenger<ServerRole>;

impl Messenger<ClientRole> {
    /// Connects to `endpoint`, blocking the calling thread until approved, denied or out
    /// of attempts.
    ///
    /// # Errors
    /// - `ConnectionDenied(reason)` when the server refuses
    /// - `Timeout` after `max_connection_attempts` unanswered requests
    /// - `AlreadyConnecting` / `AlreadyConnected` on misuse
    /// - `NotRunning` before `start`
    pub fn connect(&self, endpoint: SocketAddr, password: Option<&str>) -> Result<Arc<Connection>> {
        self.connect_with_hail(endpoint, password, &[])
    }

    /// Like [`connect`](Self::connect), with opaque `hail` bytes for the server's approval hook.
    #[instrument(level = "debug", skip(self, password, hail))]
    pub fn connect_with_hail(
        &self,
        endpoint: SocketAddr,
        password: Option<&str>,
        hail: &[u8],
    ) -> Result<Arc<Connection>> {
        let core = self.core()?;
        let outcome = core
            .role()
            .begin(endpoint, |addr| core.hub.connection(addr).is_some())?;

        let request = ConnectionRequest {
            password: password.map(str::to_string),
            hail: hail.to_vec(),
        };
        let attempts = self.config().client.max_connection_attempts.max(1);
        let timeout = self.config().client.connection_attempt_timeout;

        for attempt in 1..=attempts {
            debug!(%endpoint, attempt, "Sending connection request");
            if let Err(e) = core.hub.send_connectionless(endpoint, request.to_packet()) {
                core.role().abort();
                return Err(e);
            }
            match outcome.recv_timeout(timeout) {
                Ok(Ok(connection)) => {
                    info!(%endpoint, attempt, "Connected");
                    return Ok(connection);
                }
                Ok(Err(reason)) => return Err(ProtocolError::ConnectionDenied(reason)),
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }

        core.role().abort();
        warn!(%endpoint, attempts, "Connection attempts exhausted");
        Err(ProtocolError::Timeout)
    }

    /// The connection to the server, while connected.
    pub fn server_connection(&self) -> Option<Arc<Connection>> {
        self.role()
            .server()
            .and_then(|addr| self.connection(&addr))
            .filter(|connection| connection.is_connected())
    }

    /// Disconnects from the server. Returns `false` if not connected.
    pub fn disconnect(&self, reason: &str) -> bool {
        self.server_connection()
            .is_some_and(|connection| connection.disconnect(reason))
    }
}

impl Messenger<ServerRole> {
    /// Starts on the configured `server.address`.
    pub fn listen(&self) -> Result<SocketAddr> {
        let address = self.config().server.address.parse().map_err(|_| {
            ProtocolError::ConfigError(format!(
                "Invalid server address: {}",
                self.config().server.address
            ))
        })?;
        self.start(address)
    }
}
