//! Per-connection session state machine.
//!
//! A session owns one active transport, an outbound buffer, and the
//! heartbeat. It runs as its own task: transports, timers, HTTP handlers and
//! socket readers post [`SessionEvent`]s into its inbox, and every step runs
//! to completion before the next event is taken. Applications hold a
//! [`Socket`] and read [`SocketEvent`]s.

mod upgrade;

use std::collections::VecDeque;
use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use dashmap::DashMap;
use eio_core::{HandshakeData, Packet, PacketOptions, PacketType, SessionId, TransportKind};
use eio_settings::EngineSettings;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::timer::Timer;
use crate::transport::{
    CloseReason, EventSink, PollResponse, Transport, TransportEvent, TransportId, TransportInput,
};

/// Session lifecycle. Forward-only; `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    /// Created, handshake not yet sent.
    Opening,
    /// Exchanging packets.
    Open,
    /// Close requested; waiting for the buffer or transport.
    Closing,
    /// Done.
    Closed,
}

/// Something that happened on a session, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// Application data from the client.
    Message(Bytes),
    /// The client pinged.
    Heartbeat,
    /// The session moved to a new transport.
    Upgrade(TransportKind),
    /// The outbound buffer was handed to the transport.
    Drain,
    /// The session closed. Always the last event.
    Close {
        /// Why.
        reason: CloseReason,
        /// Extra detail, if any.
        description: Option<String>,
    },
}

/// A freshly handshaken session, as handed to the application.
#[derive(Debug)]
pub struct Connection {
    /// Handle for sending and closing.
    pub socket: Socket,
    /// Everything the session reports.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Which timer an [`SessionEvent::Timer`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Heartbeat,
    UpgradeTimeout,
    UpgradeNudge,
}

/// Everything a session task reacts to.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Send {
        packet: Packet,
        ack: Option<oneshot::Sender<()>>,
    },
    Close,
    Transport {
        id: TransportId,
        event: TransportEvent,
    },
    Input {
        id: TransportId,
        input: TransportInput,
    },
    Timer {
        kind: TimerKind,
        generation: u64,
    },
    Poll {
        respond: oneshot::Sender<PollResponse>,
    },
    DataBegin {
        respond: oneshot::Sender<Result<TransportId, PollResponse>>,
    },
    DataFinish {
        id: TransportId,
        body: Bytes,
        respond: oneshot::Sender<PollResponse>,
    },
    DataAbort {
        id: TransportId,
    },
    Upgrade(Transport),
}

/// What request routing needs to know about a session without asking it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SessionSnapshot {
    pub(crate) ready_state: ReadyState,
    pub(crate) transport: TransportKind,
    pub(crate) upgrading: bool,
    pub(crate) upgraded: bool,
}

/// Sessions by id.
pub(crate) type SessionMap = Arc<DashMap<SessionId, Socket>>;

// ─────────────────────────────────────────────────────────────────────────────
// Socket
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to a live session.
#[derive(Clone, Debug)]
pub struct Socket {
    id: SessionId,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    transport_events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl Socket {
    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Queue a message for the client.
    pub fn send(&self, data: impl Into<Bytes>) {
        self.send_with_options(data, PacketOptions::default());
    }

    /// Queue a message with delivery flags.
    pub fn send_with_options(&self, data: impl Into<Bytes>, options: PacketOptions) {
        let packet = Packet::new(PacketType::Message, data).with_options(options);
        self.post(SessionEvent::Send { packet, ack: None });
    }

    /// Queue a message. The receiver resolves once the transport drains
    /// after writing it, and errors if the session closes first.
    pub fn send_with_ack(&self, data: impl Into<Bytes>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let packet = Packet::new(PacketType::Message, data);
        self.post(SessionEvent::Send {
            packet,
            ack: Some(tx),
        });
        rx
    }

    /// Close the session once buffered packets are written.
    pub fn close(&self) {
        self.post(SessionEvent::Close);
    }

    /// Current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        self.snapshot.read().ready_state
    }

    /// Kind of the active transport.
    pub fn transport(&self) -> TransportKind {
        self.snapshot.read().transport
    }

    /// Whether the session has moved to a new transport.
    pub fn is_upgraded(&self) -> bool {
        self.snapshot.read().upgraded
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        *self.snapshot.read()
    }

    /// Event sink for a transport about to join this session.
    pub(crate) fn sink(&self, id: TransportId) -> EventSink {
        EventSink::new(id, self.transport_events.clone(), self.inbox.clone())
    }

    /// Inlet feeding transport `id` of this session.
    pub(crate) fn inlet(&self, id: TransportId) -> FrameInlet {
        FrameInlet {
            id,
            inbox: self.inbox.clone(),
        }
    }

    pub(crate) fn post(&self, event: SessionEvent) {
        if self.inbox.send(event).is_err() {
            debug!(sid = %self.id, "session already finished");
        }
    }

    /// Park a poll on the active transport until it has something to say.
    pub(crate) async fn poll(&self) -> PollResponse {
        let (tx, rx) = oneshot::channel();
        self.post(SessionEvent::Poll { respond: tx });
        rx.await.unwrap_or_else(|_| PollResponse::internal_error())
    }

    /// Claim the data slot of the active polling transport.
    pub(crate) async fn begin_data(&self) -> Result<DataClaim, PollResponse> {
        let (tx, rx) = oneshot::channel();
        self.post(SessionEvent::DataBegin { respond: tx });
        let id = rx.await.unwrap_or_else(|_| Err(PollResponse::internal_error()))?;
        Ok(DataClaim {
            socket: self.clone(),
            id,
            armed: true,
        })
    }
}

/// A claimed data slot. Dropping it without [`DataClaim::finish`] releases
/// the slot, so a request abandoned mid-upload does not block the next one.
#[derive(Debug)]
pub(crate) struct DataClaim {
    socket: Socket,
    id: TransportId,
    armed: bool,
}

impl DataClaim {
    /// Deliver the body for this slot.
    pub(crate) async fn finish(mut self, body: Bytes) -> PollResponse {
        self.armed = false;
        let (tx, rx) = oneshot::channel();
        self.socket.post(SessionEvent::DataFinish {
            id: self.id,
            body,
            respond: tx,
        });
        rx.await.unwrap_or_else(|_| PollResponse::internal_error())
    }
}

impl Drop for DataClaim {
    fn drop(&mut self) {
        if self.armed {
            self.socket.post(SessionEvent::DataAbort { id: self.id });
        }
    }
}

/// Feeds a framed socket's inbound traffic to its transport.
#[derive(Clone, Debug)]
pub struct FrameInlet {
    id: TransportId,
    inbox: mpsc::UnboundedSender<SessionEvent>,
}

impl FrameInlet {
    /// Transport this inlet feeds.
    pub fn transport_id(&self) -> TransportId {
        self.id
    }

    /// One inbound text frame.
    pub fn frame(&self, text: String) {
        self.input(TransportInput::Frame(text));
    }

    /// The peer closed the socket.
    pub fn closed(&self) {
        self.input(TransportInput::SocketClosed);
    }

    fn input(&self, input: TransportInput) {
        let _ = self.inbox.send(SessionEvent::Input { id: self.id, input });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session task
// ─────────────────────────────────────────────────────────────────────────────

/// Start a session on the transport built by `transport`, opened and
/// registered in `sessions`.
pub(crate) fn start<F>(
    id: SessionId,
    engine: Arc<EngineSettings>,
    sessions: SessionMap,
    transport: F,
) -> (Connection, TransportId)
where
    F: FnOnce(EventSink) -> Transport,
{
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let transport = transport(EventSink::new(
        TransportId::next(),
        transport_tx.clone(),
        inbox_tx.clone(),
    ));
    let transport_id = transport.id();
    let snapshot = Arc::new(RwLock::new(SessionSnapshot {
        ready_state: ReadyState::Opening,
        transport: transport.kind(),
        upgrading: false,
        upgraded: false,
    }));

    let socket = Socket {
        id: id.clone(),
        inbox: inbox_tx.clone(),
        transport_events: transport_tx,
        snapshot: snapshot.clone(),
    };
    let _ = sessions.insert(id.clone(), socket.clone());

    let mut session = Session {
        id,
        engine,
        state: ReadyState::Opening,
        transport,
        candidate: None,
        upgraded: false,
        write_buffer: Vec::new(),
        packet_acks: Vec::new(),
        sent_acks: VecDeque::new(),
        close_after_flush: false,
        heartbeat: Timer::new(),
        upgrade_timeout: Timer::new(),
        nudge: Timer::new(),
        inbox: inbox_tx,
        transport_events: transport_rx,
        events: events_tx,
        snapshot,
        sessions,
    };
    session.open();
    session.settle();
    let _ = tokio::spawn(session.run(inbox_rx));

    (
        Connection {
            socket,
            events: events_rx,
        },
        transport_id,
    )
}

pub(crate) struct Session {
    id: SessionId,
    engine: Arc<EngineSettings>,
    state: ReadyState,
    transport: Transport,
    candidate: Option<Transport>,
    upgraded: bool,
    write_buffer: Vec<Packet>,
    packet_acks: Vec<oneshot::Sender<()>>,
    sent_acks: VecDeque<Vec<oneshot::Sender<()>>>,
    close_after_flush: bool,
    heartbeat: Timer,
    upgrade_timeout: Timer,
    nudge: Timer,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    transport_events: mpsc::UnboundedReceiver<SessionEvent>,
    events: mpsc::UnboundedSender<SocketEvent>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    sessions: SessionMap,
}

impl Session {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = inbox.recv().await {
            self.handle(event);
            self.settle();
            if self.state == ReadyState::Closed {
                break;
            }
        }
        debug!(sid = %self.id, "session task finished");
    }

    /// Handle everything transports reported during the last step.
    fn settle(&mut self) {
        while let Ok(event) = self.transport_events.try_recv() {
            self.handle(event);
        }
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Send { packet, ack } => self.send_packet(packet, ack),
            SessionEvent::Close => self.close(),
            SessionEvent::Transport { id, event } => self.on_transport_event(id, event),
            SessionEvent::Input { id, input } => match self.transport_mut(id) {
                Some(transport) => transport.on_input(input),
                None => debug!(sid = %self.id, transport = %id, "input for untracked transport"),
            },
            SessionEvent::Timer { kind, generation } => self.on_timer(kind, generation),
            SessionEvent::Poll { respond } => match &mut self.transport {
                Transport::Polling(t) => t.on_poll(respond),
                Transport::WebSocket(_) => {
                    let _ = respond.send(PollResponse::status(StatusCode::BAD_REQUEST));
                }
            },
            SessionEvent::DataBegin { respond } => {
                let id = self.transport.id();
                let result = match &mut self.transport {
                    Transport::Polling(t) => t.begin_data().map(|()| id),
                    Transport::WebSocket(_) => Err(PollResponse::status(StatusCode::BAD_REQUEST)),
                };
                let _ = respond.send(result);
            }
            SessionEvent::DataFinish { id, body, respond } => {
                let active = self.transport.id();
                let response = match &mut self.transport {
                    Transport::Polling(t) if id == active => t.finish_data(&body),
                    _ => {
                        debug!(sid = %self.id, transport = %id, "data for superseded transport");
                        PollResponse::internal_error()
                    }
                };
                let _ = respond.send(response);
            }
            SessionEvent::DataAbort { id } => {
                let active = self.transport.id();
                if let Transport::Polling(t) = &mut self.transport {
                    if id == active {
                        t.abort_data();
                    }
                }
            }
            SessionEvent::Upgrade(candidate) => self.maybe_upgrade(candidate),
        }
    }

    fn transport_mut(&mut self, id: TransportId) -> Option<&mut Transport> {
        if self.transport.id() == id {
            return Some(&mut self.transport);
        }
        self.candidate.as_mut().filter(|c| c.id() == id)
    }

    fn on_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        if id == self.transport.id() {
            self.on_active_event(event);
        } else if self.candidate.as_ref().is_some_and(|c| c.id() == id) {
            self.on_candidate_event(event);
        } else if let TransportEvent::Error(e) = event {
            error!(sid = %self.id, transport = %id, error = %e, "error triggered by discarded transport");
        }
    }

    fn on_active_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Packet(packet) => self.on_packet(packet),
            TransportEvent::Drain => self.on_drain(),
            TransportEvent::Error(description) => {
                debug!(sid = %self.id, error = %description, "transport error");
                self.on_close(CloseReason::TransportError, Some(description));
            }
            TransportEvent::Close { .. } => self.on_close(CloseReason::TransportClose, None),
            TransportEvent::CloseComplete => {
                if self.state == ReadyState::Closing {
                    self.on_close(CloseReason::ForcedClose, None);
                }
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        match kind {
            TimerKind::Heartbeat if self.heartbeat.is_current(generation) => {
                debug!(sid = %self.id, "ping timeout");
                self.on_close(CloseReason::PingTimeout, None);
            }
            TimerKind::UpgradeTimeout if self.upgrade_timeout.is_current(generation) => {
                self.on_upgrade_timeout();
            }
            TimerKind::UpgradeNudge if self.nudge.is_current(generation) => self.on_nudge(),
            _ => {}
        }
    }

    fn open(&mut self) {
        self.state = ReadyState::Open;

        let kind = self.transport.kind();
        let handshake = HandshakeData {
            sid: self.id.to_string(),
            upgrades: self.engine.upgrades_for(kind),
            ping_interval: self.engine.ping_interval_ms,
            ping_timeout: self.engine.ping_timeout_ms,
        };
        match handshake.to_packet() {
            Ok(packet) => self.send_packet(packet, None),
            Err(e) => warn!(sid = %self.id, error = %e, "failed to encode handshake"),
        }

        self.publish();
        info!(sid = %self.id, transport = %kind, "session opened");
        self.arm_heartbeat();
    }

    fn on_packet(&mut self, packet: Packet) {
        if self.state != ReadyState::Open {
            debug!(sid = %self.id, "packet received with closed socket");
            return;
        }

        debug!(sid = %self.id, kind = %packet.kind(), "packet");
        self.arm_heartbeat();

        match packet.kind() {
            PacketType::Ping => {
                debug!(sid = %self.id, "got ping");
                self.send_packet(Packet::empty(PacketType::Pong), None);
                self.emit(SocketEvent::Heartbeat);
            }
            PacketType::Error => self.on_close(CloseReason::ParseError, None),
            PacketType::Message => self.emit(SocketEvent::Message(packet.data().clone())),
            _ => {}
        }
    }

    fn arm_heartbeat(&mut self) {
        self.heartbeat
            .arm(self.engine.heartbeat_timeout(), &self.inbox, |generation| {
                SessionEvent::Timer {
                    kind: TimerKind::Heartbeat,
                    generation,
                }
            });
    }

    fn send_packet(&mut self, packet: Packet, ack: Option<oneshot::Sender<()>>) {
        if matches!(self.state, ReadyState::Closing | ReadyState::Closed) {
            debug!(sid = %self.id, kind = %packet.kind(), "dropping packet, session closing");
            return;
        }

        self.write_buffer.push(packet);
        if let Some(ack) = ack {
            self.packet_acks.push(ack);
        }
        self.flush();
    }

    fn flush(&mut self) {
        if self.state == ReadyState::Closed
            || !self.transport.writable()
            || self.write_buffer.is_empty()
        {
            return;
        }

        debug!(sid = %self.id, count = self.write_buffer.len(), "flushing buffer to transport");
        let packets = std::mem::take(&mut self.write_buffer);
        let acks = std::mem::take(&mut self.packet_acks);
        if self.transport.supports_framing() {
            self.sent_acks.extend(acks.into_iter().map(|ack| vec![ack]));
        } else {
            self.sent_acks.push_back(acks);
        }
        self.transport.send(packets);
        self.emit(SocketEvent::Drain);

        if std::mem::take(&mut self.close_after_flush) {
            self.close_transport();
        }
    }

    fn on_drain(&mut self) {
        self.flush();
        if let Some(acks) = self.sent_acks.pop_front() {
            for ack in acks {
                let _ = ack.send(());
            }
        }
    }

    fn close(&mut self) {
        if self.state != ReadyState::Open {
            return;
        }
        self.state = ReadyState::Closing;
        self.publish();

        if self.write_buffer.is_empty() {
            self.close_transport();
        } else {
            debug!(sid = %self.id, "close deferred until buffer drains");
            self.close_after_flush = true;
        }
    }

    fn close_transport(&mut self) {
        self.transport.discard();
        self.transport.close();
    }

    fn on_close(&mut self, reason: CloseReason, description: Option<String>) {
        if self.state == ReadyState::Closed {
            return;
        }
        self.state = ReadyState::Closed;

        self.heartbeat.cancel();
        self.cleanup_upgrade();
        self.packet_acks.clear();
        self.sent_acks.clear();

        if let Some(mut candidate) = self.candidate.take() {
            debug!(sid = %self.id, "aborting upgrade, session closed");
            candidate.close();
        }
        self.transport.close();
        self.write_buffer.clear();
        self.publish();
        let _ = self.sessions.remove(&self.id);

        info!(sid = %self.id, reason = %reason, "session closed");
        self.emit(SocketEvent::Close {
            reason,
            description,
        });
    }

    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        *self.snapshot.write() = SessionSnapshot {
            ready_state: self.state,
            transport: self.transport.kind(),
            upgrading: self.candidate.is_some(),
            upgraded: self.upgraded,
        };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
