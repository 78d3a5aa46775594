//! # Core Wire Components
//!
//! Low-level packet handling: the byte codec, the packet header and the two framing
//! layers built on it.
//!
//! ## Components
//! - **Buffer**: `PacketWriter` / `PacketReader` primitives (little-endian, varints, strings)
//! - **Packet**: header, types, flags, delivery methods and the outbound/inbound views
//! - **Chunk**: batching many small datagrams into one
//! - **Fragment**: splitting one large datagram into many and putting it back together
//!
//! ## Wire Format
//! ```text
//! [Id(2)] [Type(1)] [Flags(1)] [Payload(N)]
//! ```
//!
//! ## Safety
//! - Every read is bounds-checked and fails with `BufferOverrun`
//! - Counts and sizes read from the wire are validated before they drive allocation

pub mod buffer;
pub mod chunk;
pub mod fragment;
pub mod packet;
