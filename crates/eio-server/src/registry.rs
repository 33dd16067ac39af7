//! Live sessions by id, request validation, and handshakes.

use std::sync::Arc;

use axum::http::Method;
use eio_core::{ErrorCode, SessionId, TransportKind};
use eio_settings::EngineSettings;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{self, Connection, FrameInlet, ReadyState, SessionEvent, SessionMap, Socket};
use crate::transport::{
    EventSink, FramedSink, PollingMode, PollingTransport, Transport, TransportId, WebSocketTransport,
};

/// The parts of an inbound request that decide where it goes.
#[derive(Clone, Copy, Debug)]
pub struct RequestInfo<'a> {
    /// `transport` query parameter.
    pub transport: Option<&'a str>,
    /// `sid` query parameter.
    pub sid: Option<&'a str>,
    /// HTTP method.
    pub method: &'a Method,
    /// Whether the request asks for a WebSocket upgrade.
    pub upgrade: bool,
}

/// Where a validated request goes.
#[derive(Debug)]
pub enum Route {
    /// No `sid`: open a new session on this transport.
    Handshake(TransportKind),
    /// Traffic for, or an upgrade of, a live session.
    Existing {
        /// The session.
        socket: Socket,
        /// Transport the request named.
        transport: TransportKind,
    },
}

struct Inner {
    engine: Arc<EngineSettings>,
    sessions: SessionMap,
    connections: mpsc::UnboundedSender<Connection>,
}

/// Owns every live session. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.inner.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// New registry. Each handshake yields a [`Connection`] on the returned
    /// receiver.
    pub fn new(engine: EngineSettings) -> (Self, mpsc::UnboundedReceiver<Connection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(Inner {
                engine: Arc::new(engine),
                sessions: SessionMap::default(),
                connections: tx,
            }),
        };
        (registry, rx)
    }

    /// Engine settings every session runs with.
    pub fn engine(&self) -> &EngineSettings {
        &self.inner.engine
    }

    /// Validate a request and decide where it goes. Never mutates state.
    pub fn verify(&self, request: &RequestInfo<'_>) -> Result<Route, ErrorCode> {
        let kind = request
            .transport
            .and_then(|t| t.parse::<TransportKind>().ok())
            .filter(|k| self.inner.engine.allows(*k))
            .ok_or(ErrorCode::UnknownTransport)?;

        if let Some(sid) = request.sid {
            let socket = self.get(sid).ok_or(ErrorCode::UnknownSid)?;
            if !request.upgrade && socket.transport() != kind {
                warn!(sid, requested = %kind, "bad request: unexpected transport without upgrade");
                return Err(ErrorCode::BadRequest);
            }
            return Ok(Route::Existing {
                socket,
                transport: kind,
            });
        }

        if request.method != Method::GET {
            return Err(ErrorCode::BadHandshakeMethod);
        }
        Ok(Route::Handshake(kind))
    }

    /// Handshake a long-polling client.
    pub fn open_polling(&self, mode: PollingMode, supports_binary: bool) -> Socket {
        let close_timeout = self.inner.engine.close_timeout();
        let (socket, _) = self.open(move |sink| {
            Transport::Polling(PollingTransport::new(sink, mode, supports_binary, close_timeout))
        });
        socket
    }

    /// Handshake a client that connected straight over a framed socket.
    pub fn open_framed(&self, sink: Box<dyn FramedSink>, supports_binary: bool) -> (Socket, FrameInlet) {
        let (socket, id) = self.open(move |events| {
            Transport::WebSocket(WebSocketTransport::new(events, sink, supports_binary))
        });
        let inlet = socket.inlet(id);
        (socket, inlet)
    }

    /// Offer a framed socket as the upgrade target of `socket`. Closes the
    /// socket and returns `None` when the session cannot upgrade.
    pub fn upgrade_framed(
        &self,
        socket: &Socket,
        mut sink: Box<dyn FramedSink>,
        supports_binary: bool,
    ) -> Option<FrameInlet> {
        let snapshot = socket.snapshot();
        let can_upgrade = self.inner.engine.allow_upgrades
            && snapshot.transport.upgrades_to().contains(&TransportKind::Websocket);
        if snapshot.upgrading
            || snapshot.upgraded
            || snapshot.ready_state == ReadyState::Closed
            || !can_upgrade
        {
            debug!(
                sid = %socket.id(),
                upgrading = snapshot.upgrading,
                upgraded = snapshot.upgraded,
                "refusing upgrade attempt"
            );
            sink.close();
            return None;
        }

        debug!(sid = %socket.id(), "upgrading existing transport");
        let id = TransportId::next();
        let transport = Transport::WebSocket(WebSocketTransport::new(socket.sink(id), sink, supports_binary));
        socket.post(SessionEvent::Upgrade(transport));
        Some(socket.inlet(id))
    }

    /// Close every session.
    pub fn close_all(&self) {
        let sockets: Vec<Socket> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        debug!(count = sockets.len(), "closing all open clients");
        for socket in sockets {
            socket.close();
        }
    }

    /// Look up a live session.
    pub fn get(&self, sid: &str) -> Option<Socket> {
        self.inner.sessions.get(sid).map(|entry| entry.value().clone())
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    fn open<F>(&self, transport: F) -> (Socket, TransportId)
    where
        F: FnOnce(EventSink) -> Transport,
    {
        let mut id = SessionId::generate();
        while self.inner.sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        let (connection, transport_id) = session::start(
            id,
            self.inner.engine.clone(),
            self.inner.sessions.clone(),
            transport,
        );
        let socket = connection.socket.clone();
        if self.inner.connections.send(connection).is_err() {
            debug!(sid = %socket.id(), "no one is accepting connections");
        }
        (socket, transport_id)
    }
}
