//! # eio-core
//!
//! Wire-level vocabulary shared by every eio crate.
//!
//! - **Packets**: [`Packet`] and [`PacketType`] with the single-packet codec
//! - **Payloads**: length-prefixed multiplexing of packet sequences
//! - **Handshake**: [`TransportKind`], the `open` packet body, client-facing error codes
//! - **IDs**: [`SessionId`] minted from OS randomness
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod handshake;
pub mod ids;
pub mod logging;
pub mod packet;
pub mod payload;

pub use errors::{DecodeError, ErrorCode, ErrorResponse};
pub use handshake::{HandshakeData, TransportKind, UnknownTransport};
pub use ids::SessionId;
pub use packet::{Packet, PacketOptions, PacketType, decode_packet, decode_packet_bytes, encode_packet};
pub use payload::{decode_payload, decode_payload_bytes, encode_payload};
