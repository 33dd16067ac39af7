//! Axum adapter: maps engine requests onto the registry and transports.
//!
//! One handler serves the mount path for `GET`, `POST` and `OPTIONS`. A `GET`
//! carrying WebSocket upgrade headers is a framed handshake or an upgrade
//! attempt; everything else is long-polling traffic.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use eio_core::{ErrorCode, ErrorResponse, TransportKind};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::registry::{RequestInfo, Route, SessionRegistry};
use crate::session::{FrameInlet, Socket};
use crate::transport::{FramedSink, PollResponse, PollingMode, SinkError};

const X_XSS_PROTECTION: HeaderName = HeaderName::from_static("x-xss-protection");

/// How long a cancelled socket may spend flushing its close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Query parameters the engine understands.
#[derive(Debug, Default, Deserialize)]
pub struct EngineQuery {
    /// Requested transport.
    pub transport: Option<String>,
    /// Session id, absent on handshake.
    pub sid: Option<String>,
    /// Present when the client cannot take binary data.
    pub b64: Option<String>,
    /// JSONP callback index.
    pub j: Option<String>,
}

impl EngineQuery {
    fn supports_binary(&self) -> bool {
        self.b64.is_none()
    }

    fn is_jsonp(&self) -> bool {
        self.j.is_some()
    }
}

/// Router serving the engine at `path`.
pub fn router(registry: SessionRegistry, path: &str) -> Router {
    Router::new()
        .route(path, get(handle).post(handle).options(handle))
        .with_state(registry)
}

#[instrument(skip_all, fields(method = %method))]
async fn handle(
    State(registry): State<SessionRegistry>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<EngineQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    body: Body,
) -> Response {
    let request = RequestInfo {
        transport: query.transport.as_deref(),
        sid: query.sid.as_deref(),
        method: &method,
        upgrade: ws.is_ok(),
    };
    let route = match registry.verify(&request) {
        Ok(route) => route,
        Err(code) => {
            debug!(code = code.code(), "rejecting request");
            return error_response(code, &headers);
        }
    };

    match (ws, route) {
        (Ok(ws), Route::Handshake(TransportKind::Websocket)) => {
            let supports_binary = query.supports_binary();
            ws.on_upgrade(move |socket| async move {
                let (sink, rx, cancel) = AxumSink::channel();
                let (_, inlet) = registry.open_framed(Box::new(sink), supports_binary);
                pump(socket, rx, cancel, Some(inlet)).await;
            })
        }
        (
            Ok(ws),
            Route::Existing {
                socket,
                transport: TransportKind::Websocket,
            },
        ) => {
            let supports_binary = query.supports_binary();
            ws.on_upgrade(move |ws_socket| async move {
                let (sink, rx, cancel) = AxumSink::channel();
                let inlet = registry.upgrade_framed(&socket, Box::new(sink), supports_binary);
                pump(ws_socket, rx, cancel, inlet).await;
            })
        }
        (Ok(_), _) => error_response(ErrorCode::BadRequest, &headers),
        (Err(_), Route::Handshake(TransportKind::Polling)) => {
            let socket = registry.open_polling(PollingMode::from_query(query.j.as_deref()), query.supports_binary());
            let poll = socket.poll().await;
            let mut response = polling_response(poll, &headers, !query.is_jsonp());
            if let Some(name) = registry.engine().cookie_name() {
                set_cookie(&mut response, name, &socket);
            }
            response
        }
        (Err(_), Route::Existing { socket, .. }) if socket.transport() == TransportKind::Polling => {
            polling_request(&registry, &method, &headers, &query, &socket, body).await
        }
        (Err(_), _) => error_response(ErrorCode::BadRequest, &headers),
    }
}

async fn polling_request(
    registry: &SessionRegistry,
    method: &Method,
    headers: &HeaderMap,
    query: &EngineQuery,
    socket: &Socket,
    body: Body,
) -> Response {
    let xhr = !query.is_jsonp();
    if *method == Method::OPTIONS {
        if !xhr {
            return polling_response(PollResponse::internal_error(), headers, xhr);
        }
        let mut response = polling_response(PollResponse::status(StatusCode::OK), headers, xhr);
        let _ = response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
        return response;
    }

    if *method == Method::GET {
        return polling_response(socket.poll().await, headers, xhr);
    }

    // dropping the claim, here or with this future, releases the slot
    let claim = match socket.begin_data().await {
        Ok(claim) => claim,
        Err(response) => return polling_response(response, headers, xhr),
    };
    let limit = registry.engine().max_http_buffer_size;
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => polling_response(claim.finish(bytes).await, headers, xhr),
        Err(e) => {
            warn!(sid = %socket.id(), limit, error = %e, "data request rejected");
            drop(claim);
            polling_response(PollResponse::status(StatusCode::PAYLOAD_TOO_LARGE), headers, xhr)
        }
    }
}

/// Turn a transport's answer into an HTTP response with the polling headers.
fn polling_response(poll: PollResponse, request: &HeaderMap, xhr: bool) -> Response {
    let mut response = (poll.status, poll.body).into_response();
    let headers = response.headers_mut();
    match poll.content_type {
        Some(content_type) => {
            let _ = headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        None => {
            let _ = headers.remove(header::CONTENT_TYPE);
        }
    }
    if xhr {
        cors(headers, request);
    }
    if is_legacy_ie(request) {
        let _ = headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("0"));
    }
    response
}

fn error_response(code: ErrorCode, request: &HeaderMap) -> Response {
    let body = ErrorResponse::from(code);
    let mut response = (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
    cors(response.headers_mut(), request);
    response
}

fn cors(headers: &mut HeaderMap, request: &HeaderMap) {
    match request.get(header::ORIGIN) {
        Some(origin) => {
            let _ = headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            let _ = headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        None => {
            let _ = headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }
    }
}

fn is_legacy_ie(request: &HeaderMap) -> bool {
    request
        .get(header::USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .is_some_and(|ua| ua.contains(";MSIE") || ua.contains("Trident/"))
}

fn set_cookie(response: &mut Response, name: &str, socket: &Socket) {
    match HeaderValue::from_str(&format!("{name}={}", socket.id())) {
        Ok(value) => {
            let _ = response.headers_mut().insert(header::SET_COOKIE, value);
        }
        Err(e) => warn!(cookie = name, error = %e, "cookie name is not a valid header value"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// [`FramedSink`] feeding an axum WebSocket's writer task.
///
/// Closing or dropping the sink cancels the socket's reader, so a silent
/// peer cannot keep it parked once the transport is gone.
struct AxumSink {
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    closed: bool,
}

impl AxumSink {
    fn channel() -> (Self, mpsc::UnboundedReceiver<Message>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink = Self {
            tx,
            cancel: cancel.clone(),
            closed: false,
        };
        (sink, rx, cancel)
    }
}

impl FramedSink for AxumSink {
    fn send_text(&mut self, text: String) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| SinkError::Closed)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.tx.send(Message::Close(None));
            self.cancel.cancel();
        }
    }
}

impl Drop for AxumSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run one WebSocket: outbound frames from `outbound`, inbound frames into
/// `inlet`, until the peer goes away or `cancel` fires. Without an inlet only
/// the outbound queue is drained.
async fn pump(
    ws: WebSocket,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    inlet: Option<FrameInlet>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let Some(inlet) = inlet else {
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
        return;
    };

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = ws_rx.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => inlet.frame(text.as_str().to_owned()),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => inlet.frame(text),
                Err(_) => debug!(len = data.len(), "dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_)) | Err(_)) | None => break,
        }
    }

    debug!(transport = %inlet.transport_id(), cancelled = cancel.is_cancelled(), "websocket reader finished");
    inlet.closed();
    // a cancelled socket gets a moment to flush its close frame
    if !cancel.is_cancelled() || tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}
