//! End-to-end tests: HTTP polling through the router, WebSocket through a
//! real listener.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use eio_core::{PacketType, decode_payload};
use eio_server::{CloseReason, Connection, EioServer, SocketEvent};
use eio_settings::EioSettings;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn test_settings() -> EioSettings {
    let mut settings = EioSettings::default();
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    settings
}

async fn send(app: Router, method: Method, uri: &str, body: impl Into<Body>) -> Response {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap();
    app.oneshot(req).await.unwrap()
}

async fn body_text(resp: Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Polling handshake; returns the open packet's JSON.
async fn handshake(server: &EioServer) -> Value {
    let resp = send(server.router(), Method::GET, "/engine.io?transport=polling", Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let packets = decode_payload(&body_text(resp).await).unwrap();
    assert_eq!(packets[0].kind(), PacketType::Open);
    serde_json::from_slice(packets[0].data()).unwrap()
}

async fn accept(server: &EioServer) -> Connection {
    timeout(TIMEOUT, server.accept()).await.unwrap().unwrap()
}

async fn next_non_drain(connection: &mut Connection) -> SocketEvent {
    loop {
        let event = timeout(TIMEOUT, connection.events.recv())
            .await
            .unwrap()
            .unwrap();
        if event != SocketEvent::Drain {
            return event;
        }
    }
}

async fn next_text(ws: &mut WsStream) -> String {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = msg {
            return text.as_str().to_owned();
        }
    }
}

// ── Polling ──

#[tokio::test]
async fn polling_handshake_response() {
    let server = EioServer::new(&test_settings());
    let resp = send(server.router(), Method::GET, "/engine.io?transport=polling", Body::empty()).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain; charset=UTF-8");
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap().to_owned();

    let packets = decode_payload(&body_text(resp).await).unwrap();
    let open: Value = serde_json::from_slice(packets[0].data()).unwrap();
    assert_eq!(cookie, format!("io={}", open["sid"].as_str().unwrap()));
    assert_eq!(open["upgrades"], json!(["websocket"]));
    assert_eq!(open["pingInterval"], 25000);
    assert_eq!(open["pingTimeout"], 60000);
}

#[tokio::test]
async fn cookie_can_be_disabled() {
    let mut settings = test_settings();
    settings.engine.cookie = None;
    let server = EioServer::new(&settings);
    let resp = send(server.router(), Method::GET, "/engine.io?transport=polling", Body::empty()).await;
    assert!(resp.headers().get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn jsonp_handshake_is_wrapped() {
    let server = EioServer::new(&test_settings());
    let resp = send(server.router(), Method::GET, "/engine.io?transport=polling&j=3", Body::empty()).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/javascript; charset=UTF-8");
    assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    let body = body_text(resp).await;
    assert!(body.starts_with("___eio[3](\""));
    assert!(body.ends_with("\");"));
}

#[tokio::test]
async fn rejected_requests_carry_error_codes() {
    let server = EioServer::new(&test_settings());
    let cases = [
        (Method::GET, "/engine.io?transport=carrier-pigeon", 0, "Transport unknown"),
        (Method::GET, "/engine.io", 0, "Transport unknown"),
        (Method::GET, "/engine.io?transport=polling&sid=missing", 1, "Session ID unknown"),
        (Method::POST, "/engine.io?transport=polling", 2, "Bad handshake method"),
    ];
    for (method, uri, code, message) in cases {
        let resp = send(server.router(), method, uri, Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        let body: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body, json!({ "code": code, "message": message }), "{uri}");
    }
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn plain_http_on_websocket_transport_is_bad_request() {
    let server = EioServer::new(&test_settings());
    let resp = send(server.router(), Method::GET, "/engine.io?transport=websocket", Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(body["code"], 3);
}

#[tokio::test]
async fn messages_flow_both_ways() {
    let server = EioServer::new(&test_settings());
    let sid = handshake(&server).await["sid"].as_str().unwrap().to_owned();
    let mut connection = accept(&server).await;
    let uri = format!("/engine.io?transport=polling&sid={sid}");

    let resp = send(server.router(), Method::POST, &uri, "6:4hello").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "ok");
    assert_eq!(
        next_non_drain(&mut connection).await,
        SocketEvent::Message(Bytes::from_static(b"hello"))
    );

    connection.socket.send("back");
    let resp = send(server.router(), Method::GET, &uri, Body::empty()).await;
    assert_eq!(body_text(resp).await, "5:4back");
}

#[tokio::test]
async fn options_preflight_echoes_origin() {
    let server = EioServer::new(&test_settings());
    let sid = handshake(&server).await["sid"].as_str().unwrap().to_owned();

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri(format!("/engine.io?transport=polling&sid={sid}"))
        .header(header::ORIGIN, "http://app.example")
        .body(Body::empty())
        .unwrap();
    let resp = server.router().oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://app.example");
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
}

#[tokio::test]
async fn legacy_ie_gets_xss_header() {
    let server = EioServer::new(&test_settings());
    let req = Request::builder()
        .uri("/engine.io?transport=polling")
        .header(header::USER_AGENT, "Mozilla/5.0 (Windows NT 6.1; Trident/7.0; rv:11.0)")
        .body(Body::empty())
        .unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    assert_eq!(resp.headers()["x-xss-protection"], "0");
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut settings = test_settings();
    settings.engine.max_http_buffer_size = 16;
    let server = EioServer::new(&settings);
    let sid = handshake(&server).await["sid"].as_str().unwrap().to_owned();
    let uri = format!("/engine.io?transport=polling&sid={sid}");

    let resp = send(server.router(), Method::POST, &uri, "x".repeat(64)).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // the data slot is released again
    let resp = send(server.router(), Method::POST, &uri, "2:4a").await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn abandoned_upload_releases_data_slot() {
    let server = EioServer::new(&test_settings());
    let sid = handshake(&server).await["sid"].as_str().unwrap().to_owned();
    let mut connection = accept(&server).await;
    let uri = format!("/engine.io?transport=polling&sid={sid}");

    // a body that never finishes uploading
    let stalled = futures::stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"2:4")) })
        .chain(futures::stream::pending());
    let upload = tokio::spawn({
        let (app, uri) = (server.router(), uri.clone());
        async move { send(app, Method::POST, &uri, Body::from_stream(stalled)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    upload.abort();
    let _ = upload.await;

    let resp = send(server.router(), Method::POST, &uri, "2:4x").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        next_non_drain(&mut connection).await,
        SocketEvent::Message(Bytes::from_static(b"x"))
    );
    assert!(server.registry().get(connection.socket.id()).is_some());
}

#[tokio::test]
async fn client_close_packet_ends_session() {
    let server = EioServer::new(&test_settings());
    let sid = handshake(&server).await["sid"].as_str().unwrap().to_owned();
    let mut connection = accept(&server).await;

    let uri = format!("/engine.io?transport=polling&sid={sid}");
    let _ = send(server.router(), Method::POST, &uri, "1:1").await;

    assert!(matches!(
        next_non_drain(&mut connection).await,
        SocketEvent::Close {
            reason: CloseReason::TransportClose,
            ..
        }
    ));
    assert!(server.registry().is_empty());
}

// ── WebSocket ──

#[tokio::test]
async fn websocket_handshake_and_echo() {
    let server = EioServer::new(&test_settings());
    let (addr, handle) = server.listen().await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}/engine.io?transport=websocket"))
        .await
        .unwrap();
    let open = next_text(&mut ws).await;
    assert!(open.starts_with('0'));
    let open: Value = serde_json::from_str(&open[1..]).unwrap();
    assert_eq!(open["upgrades"], json!([]));

    let mut connection = accept(&server).await;
    assert_eq!(connection.socket.id().as_str(), open["sid"].as_str().unwrap());

    ws.send(Message::Text("4hello".into())).await.unwrap();
    assert_eq!(
        next_non_drain(&mut connection).await,
        SocketEvent::Message(Bytes::from_static(b"hello"))
    );

    connection.socket.send("back");
    assert_eq!(next_text(&mut ws).await, "4back");

    ws.send(Message::Text("2".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "3");
    assert_eq!(next_non_drain(&mut connection).await, SocketEvent::Heartbeat);

    server.shutdown(handle).await;
}

#[tokio::test]
async fn websocket_disconnect_closes_session() {
    let server = EioServer::new(&test_settings());
    let (addr, handle) = server.listen().await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}/engine.io?transport=websocket"))
        .await
        .unwrap();
    let _open = next_text(&mut ws).await;
    let mut connection = accept(&server).await;

    ws.close(None).await.unwrap();
    assert!(matches!(
        next_non_drain(&mut connection).await,
        SocketEvent::Close {
            reason: CloseReason::TransportClose,
            ..
        }
    ));

    server.shutdown(handle).await;
}

#[tokio::test]
async fn silent_websocket_peer_is_released_on_ping_timeout() {
    let (logs, _guard) = eio_core::logging::capture_logs();
    let mut settings = test_settings();
    settings.engine.ping_interval_ms = 100;
    settings.engine.ping_timeout_ms = 100;
    let server = EioServer::new(&settings);
    let (addr, handle) = server.listen().await.unwrap();

    // the client reads the open packet and then goes quiet
    let (mut ws, _) = connect_async(format!("ws://{addr}/engine.io?transport=websocket"))
        .await
        .unwrap();
    let _open = next_text(&mut ws).await;
    let mut connection = accept(&server).await;

    assert!(matches!(
        next_non_drain(&mut connection).await,
        SocketEvent::Close {
            reason: CloseReason::PingTimeout,
            ..
        }
    ));
    assert!(server.registry().is_empty());

    timeout(TIMEOUT, async {
        while logs.find("websocket reader finished").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reader should stop once the transport closes");

    drop(ws);
    server.shutdown(handle).await;
}

#[tokio::test]
async fn polling_upgrades_to_websocket() {
    let server = EioServer::new(&test_settings());
    let (addr, handle) = server.listen().await.unwrap();

    let sid = handshake(&server).await["sid"].as_str().unwrap().to_owned();
    let mut connection = accept(&server).await;

    let (mut ws, _) = connect_async(format!(
        "ws://{addr}/engine.io?transport=websocket&sid={sid}"
    ))
    .await
    .unwrap();
    ws.send(Message::Text("2probe".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "3probe");

    ws.send(Message::Text("5".into())).await.unwrap();
    assert_eq!(
        next_non_drain(&mut connection).await,
        SocketEvent::Upgrade(eio_core::TransportKind::Websocket)
    );
    assert!(connection.socket.is_upgraded());

    connection.socket.send("fast");
    assert_eq!(next_text(&mut ws).await, "4fast");

    // polling requests for an upgraded session are refused
    let resp = send(
        server.router(),
        Method::GET,
        &format!("/engine.io?transport=polling&sid={sid}"),
        Body::empty(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    server.shutdown(handle).await;
}

#[tokio::test]
async fn second_upgrade_socket_is_closed() {
    let server = EioServer::new(&test_settings());
    let (addr, handle) = server.listen().await.unwrap();
    let sid = handshake(&server).await["sid"].as_str().unwrap().to_owned();
    let _connection = accept(&server).await;
    let url = format!("ws://{addr}/engine.io?transport=websocket&sid={sid}");

    let (mut first, _) = connect_async(&url).await.unwrap();
    first.send(Message::Text("2probe".into())).await.unwrap();
    assert_eq!(next_text(&mut first).await, "3probe");

    let (mut second, _) = connect_async(&url).await.unwrap();
    let msg = timeout(TIMEOUT, second.next()).await.unwrap();
    assert!(matches!(msg, Some(Ok(Message::Close(_))) | None | Some(Err(_))));

    server.shutdown(handle).await;
}
