//! Codec failures and the client-facing handshake error vocabulary.
//!
//! - [`DecodeError`]: why a packet or payload could not be decoded
//! - [`ErrorCode`]: numeric codes returned to clients when a request is rejected
//! - [`ErrorResponse`]: the `{code, message}` JSON body carrying an [`ErrorCode`]

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// DecodeError
// ─────────────────────────────────────────────────────────────────────────────

/// A packet or payload failed to decode.
///
/// Payload decoding is all-or-nothing: any of these on any frame rejects the
/// whole payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The packet text was empty.
    #[error("empty packet")]
    EmptyPacket,
    /// A `b` marker was not followed by a type digit.
    #[error("missing packet type after binary marker")]
    MissingType,
    /// The type character is not one of `0`–`6`.
    #[error("invalid packet type {0:?}")]
    InvalidType(char),
    /// The base64 body of a `b`-prefixed packet is malformed.
    #[error("invalid base64 packet body: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The payload was empty.
    #[error("empty payload")]
    EmptyPayload,
    /// A length field was empty, non-numeric, or never terminated by `:`.
    #[error("invalid payload length field {0:?}")]
    InvalidLength(String),
    /// Fewer characters remained than a length field announced.
    #[error("payload frame truncated: expected {expected} characters, found {found}")]
    Truncated {
        /// Announced frame length.
        expected: usize,
        /// Characters actually available.
        found: usize,
    },
    /// The input bytes are not UTF-8 text.
    #[error("input is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// ErrorCode / ErrorResponse
// ─────────────────────────────────────────────────────────────────────────────

/// Reasons a request is rejected before it reaches a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Transport missing, unrecognized, or disabled.
    UnknownTransport = 0,
    /// The `sid` names no live session.
    UnknownSid = 1,
    /// A handshake used a method other than `GET`.
    BadHandshakeMethod = 2,
    /// The request contradicts the session's established transport.
    BadRequest = 3,
}

impl ErrorCode {
    /// Numeric code sent on the wire.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Human-readable message sent alongside the code.
    pub const fn message(self) -> &'static str {
        match self {
            Self::UnknownTransport => "Transport unknown",
            Self::UnknownSid => "Session ID unknown",
            Self::BadHandshakeMethod => "Bad handshake method",
            Self::BadRequest => "Bad request",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for ErrorCode {}

/// JSON body of a rejected request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Numeric [`ErrorCode`].
    pub code: u8,
    /// Message matching the code.
    pub message: String,
}

impl From<ErrorCode> for ErrorResponse {
    fn from(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_owned(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
