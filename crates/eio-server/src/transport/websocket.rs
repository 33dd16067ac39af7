//! Framed full-duplex transport: one packet per text frame.

use std::fmt;

use eio_core::{Packet, decode_packet, encode_packet};
use tracing::{debug, warn};

use super::{CloseReason, EventSink, TransportCore, TransportEvent, TransportInput, TransportState};

/// A frame could not be handed to the socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The socket is already gone.
    #[error("socket closed")]
    Closed,
}

/// Outbound half of a framed socket.
///
/// Inbound frames and the peer's close travel the other way, as
/// [`TransportInput`]s posted by whoever reads the socket.
pub trait FramedSink: Send + 'static {
    /// Queue one text frame.
    fn send_text(&mut self, text: String) -> Result<(), SinkError>;

    /// Close the socket. Further sends fail.
    fn close(&mut self);
}

/// Transport over a [`FramedSink`].
pub struct WebSocketTransport {
    pub(crate) core: TransportCore,
    socket: Box<dyn FramedSink>,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Wrap `socket`. Framed transports start writable.
    pub fn new(sink: EventSink, socket: Box<dyn FramedSink>, supports_binary: bool) -> Self {
        let mut core = TransportCore::new(sink, supports_binary);
        core.writable = true;
        Self { core, socket }
    }

    /// Write each packet as its own frame.
    pub fn send(&mut self, packets: Vec<Packet>) {
        for packet in packets {
            let text = encode_packet(&packet);
            self.core.writable = false;
            if let Err(e) = self.socket.send_text(text) {
                warn!(transport = %self.core.sink.id(), error = %e, "frame write failed");
                self.core.sink.emit(TransportEvent::Error("write error".into()));
                continue;
            }
            self.core.writable = true;
            self.core.sink.emit(TransportEvent::Drain);
        }
    }

    /// Close the socket. Idempotent once not `Open`.
    pub fn close(&mut self) {
        if !self.core.begin_close() {
            return;
        }
        debug!(transport = %self.core.sink.id(), "closing");
        self.socket.close();
        self.core.sink.emit(TransportEvent::CloseComplete);
        self.on_close();
    }

    /// Deliver a frame or the peer's close.
    pub fn on_input(&mut self, input: TransportInput) {
        match input {
            TransportInput::Frame(text) => {
                if self.core.state == TransportState::Closed {
                    return;
                }
                match decode_packet(&text) {
                    Ok(packet) => self.core.sink.emit(TransportEvent::Packet(packet)),
                    Err(e) => warn!(error = %e, "dropping undecodable frame"),
                }
            }
            TransportInput::SocketClosed => self.on_close(),
            TransportInput::CloseTimeout(_) => {}
        }
    }

    fn on_close(&mut self) {
        if self.core.state == TransportState::Closed {
            return;
        }
        self.core.state = TransportState::Closed;
        self.core.sink.emit(TransportEvent::Close {
            reason: CloseReason::TransportClose,
            description: None,
        });
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{FramedSink, SinkError};

    /// What a [`MockSink`] saw.
    #[derive(Debug, Default)]
    pub(crate) struct Recorded {
        pub(crate) frames: Vec<String>,
        pub(crate) closed: bool,
        pub(crate) fail_writes: bool,
    }

    /// Sink that records frames for inspection.
    #[derive(Clone, Default)]
    pub(crate) struct MockSink(pub(crate) Arc<Mutex<Recorded>>);

    impl MockSink {
        pub(crate) fn frames(&self) -> Vec<String> {
            self.0.lock().frames.clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.0.lock().closed
        }
    }

    impl FramedSink for MockSink {
        fn send_text(&mut self, text: String) -> Result<(), SinkError> {
            let mut recorded = self.0.lock();
            if recorded.closed || recorded.fail_writes {
                return Err(SinkError::Closed);
            }
            recorded.frames.push(text);
            Ok(())
        }

        fn close(&mut self) {
            self.0.lock().closed = true;
        }
    }
}
