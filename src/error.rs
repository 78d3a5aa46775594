//! # Error Types
//!
//! Error handling for the messenger and everything layered on it.
//!
//! This module defines all error variants that can surface from local operations,
//! from socket I/O failures to handshake denials and programmer misuse.
//!
//! ## Error Categories
//! - **Malformed Input**: buffer overruns, invalid headers, bad fragments
//! - **Transforms**: encryption/decryption and compression/decompression failures
//! - **Handshake**: denial, timeout, connecting twice
//! - **Local Misuse**: sending on a closed connection, starting a running messenger
//!
//! Malformed input coming from the network is never returned to the caller. The network
//! thread logs it, counts it and feeds the flood guard instead. These variants surface
//! through the pure codec APIs and through the tests.
//!
//! ## Example Usage
//! ```rust
//! use udp_messenger::core::buffer::PacketReader;
//! use udp_messenger::error::ProtocolError;
//!
//! let mut reader = PacketReader::new(&[1u8]);
//! match reader.read_u16() {
//!     Err(ProtocolError::BufferOverrun { needed, remaining }) => {
//!         assert_eq!((needed, remaining), (2, 1));
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::protocol::handshake::DenialReason;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common log lines.
pub mod constants {
    /// Header validation
    pub const ERR_HEADER_TOO_SHORT: &str = "Datagram shorter than packet header";
    pub const ERR_UNKNOWN_PACKET_TYPE: &str = "Unknown packet type";
    pub const ERR_UNKNOWN_FLAGS: &str = "Unknown flag bits set";
    pub const ERR_ORDERED_NOT_RELIABLE: &str = "Ordered flag without reliable flag";
    pub const ERR_CHUNKED_AND_PARTIAL: &str = "Chunked and partial flags are exclusive";
    pub const ERR_NESTED_TOO_DEEP: &str = "Chunk or fragment nested inside another";

    /// Fragment validation
    pub const ERR_FRAGMENT_INDEX: &str = "Fragment index out of range";
    pub const ERR_FRAGMENT_TOTAL: &str = "Fragment total mismatch for group";
    pub const ERR_FRAGMENT_EMPTY: &str = "Fragment total is zero";
    pub const ERR_FRAGMENT_SIZE: &str = "Fragment size exceeds datagram";
    pub const ERR_TOO_MANY_FRAGMENTS: &str = "Packet needs more than 255 fragments";

    /// Connection errors
    pub const ERR_CONNECTION_TIMEOUT: &str = "Connection timed out (no activity)";

    /// Protocol anomalies (logged, never fatal)
    pub const WARN_UNKNOWN_EVENT: &str = "Received remote event with no registered handler";
    pub const WARN_UNKNOWN_FUNCTION: &str = "Received remote function call with no registered handler";
    pub const WARN_UNKNOWN_CALLBACK: &str = "Received function response with no pending callback";
    pub const WARN_NON_HEAD_ACK: &str = "Ack for ordered packet that is not head of line";
    pub const WARN_UNKNOWN_ACK: &str = "Ack for unknown packet id";
    pub const WARN_MALFORMED: &str = "Dropping malformed datagram";

    /// Transform errors
    pub const ERR_NO_CIPHER: &str = "Encrypted packet but no cipher installed";
    pub const ERR_NO_COMPRESSOR: &str = "Compressed packet but no compressor installed";
}

// ProtocolError is the primary error type for all messenger operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Buffer overrun: needed {needed} bytes, {remaining} remaining")]
    BufferOverrun { needed: usize, remaining: usize },

    #[error("Invalid packet header: {0}")]
    InvalidHeader(&'static str),

    #[error("Invalid UTF-8 string in packet")]
    InvalidString,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Invalid fragment: {0}")]
    InvalidFragment(&'static str),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Connection denied: {0}")]
    ConnectionDenied(DenialReason),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("Messenger is not running")]
    NotRunning,

    #[error("Messenger is already running")]
    AlreadyRunning,

    #[error("Unknown RPC channel")]
    UnknownChannel,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
