//! # Transport Layer
//!
//! The UDP socket engine and everything bound to a single remote endpoint.
//!
//! - [`socket`]: datagram sink seam, send-side transforms, link simulator
//! - [`connection`]: per-peer reliability, chunking, fragmentation and heartbeat
//! - [`messenger`]: socket thread, admission pipeline, events
//! - [`client`]: `Client`/`Server` entry points

pub mod client;
pub mod connection;
pub mod messenger;
pub mod socket;
