//! HTTP long-polling transport.
//!
//! The client keeps at most one poll (GET) parked on the server and sends
//! data with separate POSTs. A parked poll is the only way to reach the
//! client, so the transport is writable exactly while one is held.

use std::time::Duration;

use axum::http::StatusCode;
use bytes::Bytes;
use eio_core::{Packet, PacketOptions, PacketType, decode_payload, encode_payload};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::jsonp;
use super::{EventSink, TransportCore, TransportEvent, TransportInput, TransportState, CloseReason};
use crate::session::SessionEvent;
use crate::timer::Timer;

const CONTENT_TYPE_PAYLOAD: &str = "text/plain; charset=UTF-8";
const CONTENT_TYPE_JSONP: &str = "text/javascript; charset=UTF-8";
// text/html keeps some user agents from offering the body as a download
const CONTENT_TYPE_ACK: &str = "text/html";

/// Body and status for one polling HTTP response, before headers are added.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// `Content-Type`, when there is a body.
    pub content_type: Option<&'static str>,
    /// Response body.
    pub body: Bytes,
}

impl PollResponse {
    fn payload(body: String, content_type: &'static str) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some(content_type),
            body: Bytes::from(body),
        }
    }

    /// `200 ok` acknowledging a data request.
    pub fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some(CONTENT_TYPE_ACK),
            body: Bytes::from_static(b"ok"),
        }
    }

    /// Bare `500`, used for overlapping requests and aborted ones.
    pub fn internal_error() -> Self {
        Self::status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Bare response with `status`.
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::new(),
        }
    }
}

/// How payloads are framed on the HTTP body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollingMode {
    /// Plain payloads for `XMLHttpRequest` clients.
    Xhr,
    /// Script-tag polling; responses call `___eio[callback]`.
    Jsonp {
        /// Digits-only callback index.
        callback: String,
    },
}

impl PollingMode {
    /// JSONP when the `j` query parameter is present, XHR otherwise.
    pub fn from_query(j: Option<&str>) -> Self {
        match j {
            Some(raw) => Self::Jsonp {
                callback: jsonp::sanitize_callback(raw),
            },
            None => Self::Xhr,
        }
    }

    /// Whether this is the JSONP strategy.
    pub fn is_jsonp(&self) -> bool {
        matches!(self, Self::Jsonp { .. })
    }
}

/// Long-polling transport.
#[derive(Debug)]
pub struct PollingTransport {
    pub(crate) core: TransportCore,
    mode: PollingMode,
    pending_poll: Option<oneshot::Sender<PollResponse>>,
    data_in_flight: bool,
    close_pending: bool,
    close_timer: Timer,
    close_timeout: Duration,
}

impl PollingTransport {
    /// New transport reporting through `sink`. A deferred close gives up
    /// after `close_timeout`.
    pub fn new(sink: EventSink, mode: PollingMode, supports_binary: bool, close_timeout: Duration) -> Self {
        Self {
            core: TransportCore::new(sink, supports_binary),
            mode,
            pending_poll: None,
            data_in_flight: false,
            close_pending: false,
            close_timer: Timer::new(),
            close_timeout,
        }
    }

    /// Framing strategy.
    pub fn mode(&self) -> &PollingMode {
        &self.mode
    }

    /// Park a poll. Its response arrives on `respond` once a payload is
    /// written, or the sender is dropped with the transport.
    pub(crate) fn on_poll(&mut self, respond: oneshot::Sender<PollResponse>) {
        if self.core.state == TransportState::Closed {
            let _ = respond.send(PollResponse::internal_error());
            return;
        }

        if let Some(pending) = &self.pending_poll {
            if !pending.is_closed() {
                warn!(transport = %self.core.sink.id(), "poll overlap from client");
                let _ = respond.send(PollResponse::internal_error());
                self.core.sink.emit(TransportEvent::Error("overlap from client".into()));
                return;
            }
            debug!(transport = %self.core.sink.id(), "replacing abandoned poll");
        }

        self.pending_poll = Some(respond);
        self.core.writable = true;
        self.core.sink.emit(TransportEvent::Drain);

        if self.core.writable && self.close_pending {
            debug!("triggering empty send to append close packet");
            self.send(vec![Packet::empty(PacketType::Noop)]);
        }
    }

    /// Claim the single data slot before the body is read.
    pub(crate) fn begin_data(&mut self) -> Result<(), PollResponse> {
        if self.data_in_flight {
            warn!(transport = %self.core.sink.id(), "data request overlap from client");
            self.core
                .sink
                .emit(TransportEvent::Error("data request overlap from client".into()));
            return Err(PollResponse::internal_error());
        }
        self.data_in_flight = true;
        Ok(())
    }

    /// Release a claimed data slot whose body never arrived.
    pub(crate) fn abort_data(&mut self) {
        self.data_in_flight = false;
    }

    /// Decode and dispatch a data request body.
    pub(crate) fn finish_data(&mut self, body: &[u8]) -> PollResponse {
        self.data_in_flight = false;
        if self.core.state == TransportState::Closed {
            debug!("data request arrived after close");
            return PollResponse::internal_error();
        }

        let text = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "dropping non-UTF-8 payload");
                return PollResponse::ok();
            }
        };
        let decoded = match &self.mode {
            PollingMode::Xhr => decode_payload(text),
            PollingMode::Jsonp { .. } => decode_payload(&jsonp::unescape_body(text)),
        };

        match decoded {
            Ok(packets) => {
                for packet in packets {
                    if packet.kind() == PacketType::Close {
                        debug!("got close packet from client");
                        self.on_close();
                        break;
                    }
                    self.core.sink.emit(TransportEvent::Packet(packet));
                }
            }
            Err(e) => warn!(error = %e, "dropping undecodable payload"),
        }

        PollResponse::ok()
    }

    /// Answer the parked poll with `packets`.
    pub fn send(&mut self, mut packets: Vec<Packet>) {
        self.core.writable = false;

        let closing = std::mem::take(&mut self.close_pending);
        if closing {
            debug!("appending close packet to payload");
            packets.push(Packet::empty(PacketType::Close));
        }

        self.write(&encode_payload(&packets));

        if closing {
            self.finish_close();
        }
    }

    fn write(&mut self, payload: &str) {
        let Some(respond) = self.pending_poll.take() else {
            debug!("no pending poll, dropping payload");
            return;
        };
        let response = match &self.mode {
            PollingMode::Xhr => PollResponse::payload(payload.to_owned(), CONTENT_TYPE_PAYLOAD),
            PollingMode::Jsonp { callback } => {
                PollResponse::payload(jsonp::wrap_payload(callback, payload), CONTENT_TYPE_JSONP)
            }
        };
        if respond.send(response).is_err() {
            debug!("poll went away before its payload was written");
        }
    }

    /// Start closing. Idempotent once not `Open`.
    pub fn close(&mut self) {
        if !self.core.begin_close() {
            return;
        }
        debug!(transport = %self.core.sink.id(), "closing");

        if self.core.writable {
            debug!("transport writable, closing right away");
            self.send(vec![
                Packet::empty(PacketType::Close).with_options(PacketOptions::COMPRESS),
            ]);
            self.finish_close();
        } else if self.core.discarded {
            debug!("transport discarded, closing right away");
            self.finish_close();
        } else {
            debug!("transport not writable, buffering orderly close");
            self.close_pending = true;
            let id = self.core.sink.id();
            self.close_timer
                .arm(self.close_timeout, self.core.sink.inbox(), move |generation| {
                    SessionEvent::Input {
                        id,
                        input: TransportInput::CloseTimeout(generation),
                    }
                });
        }
    }

    /// Deliver outside input.
    pub fn on_input(&mut self, input: TransportInput) {
        match input {
            TransportInput::CloseTimeout(generation) if self.close_timer.is_current(generation) => {
                debug!("deferred close timed out");
                self.close_pending = false;
                self.finish_close();
            }
            TransportInput::CloseTimeout(_) => {}
            TransportInput::Frame(_) | TransportInput::SocketClosed => {
                debug!("polling transport ignores socket input");
            }
        }
    }

    fn finish_close(&mut self) {
        self.close_timer.cancel();
        self.core.sink.emit(TransportEvent::CloseComplete);
        self.on_close();
    }

    fn on_close(&mut self) {
        if self.core.state == TransportState::Closed {
            return;
        }
        self.close_pending = false;
        self.close_timer.cancel();
        if self.core.writable {
            self.send(vec![Packet::empty(PacketType::Noop)]);
        }
        self.core.state = TransportState::Closed;
        self.core.sink.emit(TransportEvent::Close {
            reason: CloseReason::TransportClose,
            description: None,
        });
    }
}
