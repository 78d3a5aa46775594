//! # Protocol Layer
//!
//! Per-connection protocol state machines and the RPC layer.
//!
//! - [`reliability`]: resend queues for reliable and reliable-ordered delivery
//! - [`flow_control`]: MTU discovery and the ping-driven send throttle
//! - [`handshake`]: connect/approve/deny/ready, injected into the messenger as a role
//! - [`channel`] and [`dispatcher`]: named remote events and functions

pub mod channel;
pub mod dispatcher;
pub mod flow_control;
pub mod handshake;
pub mod reliability;
