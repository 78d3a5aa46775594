//! # Utility Modules
//!
//! Supporting utilities used by the transport.
//!
//! ## Components
//! - **Compression**: `Compressor` trait with LZ4 and Zstd, size-limited decompression
//! - **Crypto**: `Cipher` trait with XChaCha20-Poly1305
//! - **Replay Cache**: bounded window of handled packet ids for duplicate suppression
//! - **Flood Guard**: watch/ignore tables for endpoints sending malformed traffic
//! - **Metrics**: messenger-wide counters and per-connection statistics
//! - **Logging**: `tracing-subscriber` setup from `LoggingConfig`
//!
//! ## Security
//! - Cryptographically secure RNG for nonces and keys (getrandom)
//! - Decompression bomb protection (bounded by the max packet size)

pub mod compression;
pub mod crypto;
pub mod flood_guard;
pub mod logging;
pub mod metrics;
pub mod replay_cache;

pub use compression::{CompressionKind, Compressor};
pub use crypto::{ChaChaCipher, Cipher};
pub use flood_guard::FloodGuard;
pub use metrics::{ConnectionStats, Metrics, MetricsSnapshot, StatsSnapshot};
pub use replay_cache::ReplayWindow;
