//! Single-packet model and codec.
//!
//! A packet encodes as its type digit followed by the payload text
//! (`4hello`). Payloads that are not UTF-8 travel as base64 behind a `b`
//! marker (`b4AAEC`).

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use crate::errors::DecodeError;

/// Packet type. The discriminant is the wire digit; [`PacketType::Error`] is
/// internal-only and never decodes from the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Internal marker for an undecodable packet.
    Error = -1,
    /// Handshake data sent by the server.
    Open = 0,
    /// Request to close the transport.
    Close = 1,
    /// Liveness probe.
    Ping = 2,
    /// Reply to a ping.
    Pong = 3,
    /// Application data.
    Message = 4,
    /// Confirms a transport upgrade.
    Upgrade = 5,
    /// Does nothing; used to cycle a pending poll.
    Noop = 6,
}

impl PacketType {
    /// Numeric wire code.
    pub const fn code(self) -> i8 {
        self as i8
    }

    /// Parse a wire digit. Never yields [`PacketType::Error`].
    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Open),
            '1' => Some(Self::Close),
            '2' => Some(Self::Ping),
            '3' => Some(Self::Pong),
            '4' => Some(Self::Message),
            '5' => Some(Self::Upgrade),
            '6' => Some(Self::Noop),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Open => "open",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Message => "message",
            Self::Upgrade => "upgrade",
            Self::Noop => "noop",
        };
        f.write_str(name)
    }
}

/// Per-packet delivery flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PacketOptions {
    /// The packet may be compressed by the transport.
    pub compress: bool,
}

impl PacketOptions {
    /// Options with compression requested.
    pub const COMPRESS: Self = Self { compress: true };
}

/// One typed unit of control or application data. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    kind: PacketType,
    data: Bytes,
    options: PacketOptions,
}

impl Packet {
    /// Build a packet carrying `data`.
    pub fn new(kind: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
            options: PacketOptions::default(),
        }
    }

    /// Build a packet with no payload.
    pub fn empty(kind: PacketType) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Same packet with `options` applied.
    #[must_use]
    pub fn with_options(mut self, options: PacketOptions) -> Self {
        self.options = options;
        self
    }

    /// Packet type.
    pub fn kind(&self) -> PacketType {
        self.kind
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Delivery flags.
    pub fn options(&self) -> PacketOptions {
        self.options
    }

    /// Payload as text, if it is UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Whether this is a `ping` carrying exactly `payload`.
    pub fn is_ping_with(&self, payload: &str) -> bool {
        self.kind == PacketType::Ping && self.data.as_ref() == payload.as_bytes()
    }
}

/// Encode one packet to its text form.
pub fn encode_packet(packet: &Packet) -> String {
    let code = packet.kind.code();
    match std::str::from_utf8(&packet.data) {
        Ok(text) => format!("{code}{text}"),
        Err(_) => format!("b{code}{}", STANDARD.encode(&packet.data)),
    }
}

/// Decode one packet from its text form.
pub fn decode_packet(input: &str) -> Result<Packet, DecodeError> {
    if let Some(rest) = input.strip_prefix('b') {
        let (kind, body) = split_type(rest).ok_or(DecodeError::MissingType)?;
        let kind = kind?;
        let data = STANDARD.decode(body)?;
        return Ok(Packet::new(kind, data));
    }

    let (kind, body) = split_type(input).ok_or(DecodeError::EmptyPacket)?;
    Ok(Packet::new(kind?, Bytes::copy_from_slice(body.as_bytes())))
}

/// Decode one packet from raw bytes, which must be UTF-8 text.
pub fn decode_packet_bytes(input: &[u8]) -> Result<Packet, DecodeError> {
    decode_packet(std::str::from_utf8(input)?)
}

/// Split off the leading type digit. `None` when `input` is empty.
fn split_type(input: &str) -> Option<(Result<PacketType, DecodeError>, &str)> {
    let first = input.chars().next()?;
    let kind = PacketType::from_digit(first).ok_or(DecodeError::InvalidType(first));
    Some((kind, &input[first.len_utf8()..]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
