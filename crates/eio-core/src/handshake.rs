//! Transport names and the `open` packet body.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::packet::{Packet, PacketType};

/// A physical transport, as named by the `transport` query parameter.
///
/// JSONP is a polling strategy, not a separate kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// HTTP long-polling (XHR or JSONP).
    Polling,
    /// Framed full-duplex socket.
    Websocket,
}

impl TransportKind {
    /// Every known transport, in upgrade order.
    pub const ALL: [Self; 2] = [Self::Polling, Self::Websocket];

    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Websocket => "websocket",
        }
    }

    /// Transports a session on this kind may upgrade to.
    pub fn upgrades_to(self) -> &'static [Self] {
        match self {
            Self::Polling => &[Self::Websocket],
            Self::Websocket => &[],
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `transport` query parameter named no known transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transport: {0}")]
pub struct UnknownTransport(pub String);

impl FromStr for TransportKind {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(Self::Polling),
            "websocket" => Ok(Self::Websocket),
            other => Err(UnknownTransport(other.to_owned())),
        }
    }
}

/// Body of the `open` packet sent once per session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    /// Session id the client must echo as `sid`.
    pub sid: String,
    /// Transports the client may upgrade to.
    pub upgrades: Vec<TransportKind>,
    /// Milliseconds between client pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits past the interval before giving up.
    pub ping_timeout: u64,
}

impl HandshakeData {
    /// Encode as an `open` packet.
    pub fn to_packet(&self) -> Result<Packet, serde_json::Error> {
        Ok(Packet::new(PacketType::Open, serde_json::to_vec(self)?))
    }
}
