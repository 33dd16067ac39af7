//! Length-prefixed payload codec.
//!
//! A payload is a run of `<n>:<packet>` frames where `n` counts characters of
//! the encoded packet. Decoding is all-or-nothing: one bad frame rejects the
//! whole payload.

use crate::constants::EMPTY_PAYLOAD;
use crate::errors::DecodeError;
use crate::packet::{Packet, decode_packet, encode_packet};

/// Encode `packets` into one payload. An empty slice encodes to `0:`.
pub fn encode_payload(packets: &[Packet]) -> String {
    if packets.is_empty() {
        return EMPTY_PAYLOAD.to_owned();
    }

    let mut out = String::new();
    for packet in packets {
        let encoded = encode_packet(packet);
        out.push_str(&encoded.chars().count().to_string());
        out.push(':');
        out.push_str(&encoded);
    }
    out
}

/// Decode a payload into its packets, in wire order.
///
/// Zero-length frames contribute no packet.
pub fn decode_payload(input: &str) -> Result<Vec<Packet>, DecodeError> {
    if input.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    let mut packets = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| DecodeError::InvalidLength(rest.to_owned()))?;
        let length_field = &rest[..colon];
        if length_field.is_empty() || !length_field.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DecodeError::InvalidLength(length_field.to_owned()));
        }
        let expected: usize = length_field
            .parse()
            .map_err(|_| DecodeError::InvalidLength(length_field.to_owned()))?;

        let body = &rest[colon + 1..];
        let end = byte_offset_of_char(body, expected).ok_or_else(|| DecodeError::Truncated {
            expected,
            found: body.chars().count(),
        })?;

        if expected > 0 {
            packets.push(decode_packet(&body[..end])?);
        }
        rest = &body[end..];
    }

    Ok(packets)
}

/// Decode a payload from raw bytes, which must be UTF-8 text.
pub fn decode_payload_bytes(input: &[u8]) -> Result<Vec<Packet>, DecodeError> {
    decode_payload(std::str::from_utf8(input)?)
}

/// Byte offset just past the first `n` characters of `s`, or `None` if `s`
/// holds fewer than `n`.
fn byte_offset_of_char(s: &str, n: usize) -> Option<usize> {
    if n == 0 {
        return Some(0);
    }
    s.char_indices()
        .nth(n - 1)
        .map(|(idx, c)| idx + c.len_utf8())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
