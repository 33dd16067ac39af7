//! Physical transports and the contract they share.
//!
//! A transport moves packets over one physical connection and reports what
//! happens to it as [`TransportEvent`]s posted into its session's inbox. The
//! session routes by [`TransportId`], so events from a transport it no longer
//! tracks are dropped at the door.
//!
//! - [`polling`]: HTTP long-polling, with [`jsonp`] as an encoding strategy
//! - [`websocket`]: one packet per text frame over a [`FramedSink`]

pub mod jsonp;
pub mod polling;
pub mod websocket;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use eio_core::{Packet, TransportKind};
use tokio::sync::mpsc;

use crate::session::SessionEvent;

pub use polling::{PollResponse, PollingMode, PollingTransport};
pub use websocket::{FramedSink, SinkError, WebSocketTransport};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one transport instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

impl TransportId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Transport lifecycle. Forward-only; `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    /// Carrying traffic.
    Open,
    /// Close requested, not yet complete.
    Closing,
    /// Done.
    Closed,
}

/// Why a transport or session closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// No packet arrived within `pingInterval + pingTimeout`.
    PingTimeout,
    /// The peer sent an undecodable packet.
    ParseError,
    /// The transport reported an error.
    TransportError,
    /// The underlying connection went away.
    TransportClose,
    /// The server closed the session.
    ForcedClose,
}

impl CloseReason {
    /// Lowercase wire-style name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PingTimeout => "ping timeout",
            Self::ParseError => "parse error",
            Self::TransportError => "transport error",
            Self::TransportClose => "transport close",
            Self::ForcedClose => "forced close",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a transport reports to its session.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A decoded inbound packet.
    Packet(Packet),
    /// The transport became writable.
    Drain,
    /// A transport-level failure.
    Error(String),
    /// The transport reached `Closed`.
    Close {
        /// Why it closed.
        reason: CloseReason,
        /// Extra detail, if any.
        description: Option<String>,
    },
    /// A requested close finished.
    CloseComplete,
}

/// Something the outside world delivers to a transport.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportInput {
    /// One inbound text frame from a framed socket.
    Frame(String),
    /// The framed socket closed underneath the transport.
    SocketClosed,
    /// A deferred polling close ran out of time.
    CloseTimeout(u64),
}

/// Posts a transport's events to its session, tagged with its id.
///
/// Events go to a queue the session drains before it takes the next inbox
/// event, so a transport's reaction to a step is handled within that step.
/// Timers report through the inbox like any outside input.
#[derive(Clone, Debug)]
pub struct EventSink {
    id: TransportId,
    events: mpsc::UnboundedSender<SessionEvent>,
    inbox: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Sink for transport `id`.
    pub(crate) fn new(
        id: TransportId,
        events: mpsc::UnboundedSender<SessionEvent>,
        inbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self { id, events, inbox }
    }

    /// Id of the owning transport.
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Report `event` to the session. Dropped if the session is gone.
    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(SessionEvent::Transport { id: self.id, event });
    }

    /// The session inbox, for timers that report back.
    pub(crate) fn inbox(&self) -> &mpsc::UnboundedSender<SessionEvent> {
        &self.inbox
    }
}

/// State every transport carries.
#[derive(Debug)]
pub(crate) struct TransportCore {
    pub(crate) sink: EventSink,
    pub(crate) state: TransportState,
    pub(crate) discarded: bool,
    pub(crate) writable: bool,
    pub(crate) supports_binary: bool,
}

impl TransportCore {
    pub(crate) fn new(sink: EventSink, supports_binary: bool) -> Self {
        Self {
            sink,
            state: TransportState::Open,
            discarded: false,
            writable: false,
            supports_binary,
        }
    }

    /// Move to `Closing`. Returns `false` if a close already started.
    pub(crate) fn begin_close(&mut self) -> bool {
        if self.state != TransportState::Open {
            return false;
        }
        self.state = TransportState::Closing;
        true
    }
}

/// One of the concrete transports.
#[derive(Debug)]
pub enum Transport {
    /// HTTP long-polling.
    Polling(PollingTransport),
    /// Framed full-duplex socket.
    WebSocket(WebSocketTransport),
}

impl Transport {
    fn core(&self) -> &TransportCore {
        match self {
            Self::Polling(t) => &t.core,
            Self::WebSocket(t) => &t.core,
        }
    }

    fn core_mut(&mut self) -> &mut TransportCore {
        match self {
            Self::Polling(t) => &mut t.core,
            Self::WebSocket(t) => &mut t.core,
        }
    }

    /// Routing id.
    pub fn id(&self) -> TransportId {
        self.core().sink.id()
    }

    /// Wire name of this transport.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Polling(_) => TransportKind::Polling,
            Self::WebSocket(_) => TransportKind::Websocket,
        }
    }

    /// Lifecycle state.
    pub fn state(&self) -> TransportState {
        self.core().state
    }

    /// Whether a `send` would reach the peer now.
    pub fn writable(&self) -> bool {
        self.core().writable
    }

    /// Whether each packet travels in its own frame.
    pub fn supports_framing(&self) -> bool {
        matches!(self, Self::WebSocket(_))
    }

    /// Whether this transport can be the target of an upgrade.
    pub fn handles_upgrades(&self) -> bool {
        matches!(self, Self::WebSocket(_))
    }

    /// Transports a session on this one may upgrade to.
    pub fn upgrades_to(&self) -> &'static [TransportKind] {
        self.kind().upgrades_to()
    }

    /// Whether the client accepts binary frames. Recorded only.
    pub fn supports_binary(&self) -> bool {
        self.core().supports_binary
    }

    /// Mark as abandoned so a close need not wait for the peer.
    pub fn discard(&mut self) {
        self.core_mut().discarded = true;
    }

    /// Write `packets` to the peer.
    pub fn send(&mut self, packets: Vec<Packet>) {
        match self {
            Self::Polling(t) => t.send(packets),
            Self::WebSocket(t) => t.send(packets),
        }
    }

    /// Start closing. Idempotent once not `Open`.
    pub fn close(&mut self) {
        match self {
            Self::Polling(t) => t.close(),
            Self::WebSocket(t) => t.close(),
        }
    }

    /// Deliver outside input.
    pub fn on_input(&mut self, input: TransportInput) {
        match self {
            Self::Polling(t) => t.on_input(input),
            Self::WebSocket(t) => t.on_input(input),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
