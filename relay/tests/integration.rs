//! End-to-end exercise of the relay's axum app over a real loopback socket:
//! a fake tunnel client registers over `/tunnel`, then a plain HTTP/1.1
//! request is sent to the assigned subdomain and the fake client answers it.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use tunnel_shared::protocol::{
    self, ErrorPayload, HttpRequestPayload, HttpResponsePayload, MessageType, RegisterPayload,
    RegisteredPayload, ERROR_REGISTRATION_FAILED,
};
use tunnel_relay::hub::Hub;

async fn spawn_relay() -> std::net::SocketAddr {
    spawn_relay_with_hub(Hub::new("filegate.app".to_string())).await
}

async fn spawn_relay_with_hub(hub: Hub) -> std::net::SocketAddr {
    let (app, _state) = tunnel_relay::build_app_with_hub(hub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn register_fake_client(
    addr: std::net::SocketAddr,
) -> (
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    RegisteredPayload,
) {
    let url = format!("ws://{addr}/tunnel");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let register = protocol::encode(
        MessageType::Register,
        Some(&RegisterPayload {
            version: "1.0.0".to_string(),
        }),
    )
    .unwrap();
    ws.send(WsMessage::Text(register.into())).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let text = match reply {
        WsMessage::Text(text) => text,
        other => panic!("expected text frame, got {other:?}"),
    };
    let envelope = protocol::decode(&text).unwrap();
    assert_eq!(envelope.r#type, MessageType::Registered);
    let payload: RegisteredPayload = protocol::parse_payload(&envelope).unwrap();
    (ws, payload)
}

async fn send_raw_http_request(
    addr: std::net::SocketAddr,
    host: &str,
    path: &str,
) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();

    let text = String::from_utf8_lossy(&buf);
    let status_line = text.lines().next().unwrap_or("");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("0")
        .parse()
        .unwrap_or(0);

    let body_start = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let body = body_start.map(|p| buf[p..].to_vec()).unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn health_endpoint_reports_client_count() {
    let addr = spawn_relay().await;
    let (status, body) = send_raw_http_request(addr, "filegate.app", "/health").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["clients"], 0);

    let (_ws, registered) = register_fake_client(addr).await;
    assert!(!registered.subdomain.is_empty());

    let (status, body) = send_raw_http_request(addr, "filegate.app", "/health").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["clients"], 1);
}

#[tokio::test]
async fn unknown_subdomain_yields_404() {
    let addr = spawn_relay().await;
    let (status, _) = send_raw_http_request(addr, "nobody-here.filegate.app", "/").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn round_trips_a_request_through_a_registered_client() {
    let addr = spawn_relay().await;
    let (mut ws, registered) = register_fake_client(addr).await;
    let host = format!("{}.filegate.app", registered.subdomain);

    let responder = tokio::spawn(async move {
        let msg = ws.next().await.unwrap().unwrap();
        let text = match msg {
            WsMessage::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        };
        let envelope = protocol::decode(&text).unwrap();
        assert_eq!(envelope.r#type, MessageType::HttpRequest);
        let request: HttpRequestPayload = protocol::parse_payload(&envelope).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/greet");

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), vec!["text/plain".to_string()]);
        let response = protocol::encode(
            MessageType::HttpResponse,
            Some(&HttpResponsePayload {
                id: request.id,
                status_code: 200,
                headers,
                body: b"hello from the tunnel client".to_vec(),
            }),
        )
        .unwrap();
        ws.send(WsMessage::Text(response.into())).await.unwrap();
    });

    let (status, body) = send_raw_http_request(addr, &host, "/greet").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hello from the tunnel client");

    responder.await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_do_not_cross_talk() {
    let addr = spawn_relay().await;
    let (mut ws, registered) = register_fake_client(addr).await;
    let host = format!("{}.filegate.app", registered.subdomain);

    const COUNT: usize = 5;

    let responder = tokio::spawn(async move {
        for _ in 0..COUNT {
            let msg = ws.next().await.unwrap().unwrap();
            let text = match msg {
                WsMessage::Text(text) => text,
                other => panic!("expected text frame, got {other:?}"),
            };
            let envelope = protocol::decode(&text).unwrap();
            assert_eq!(envelope.r#type, MessageType::HttpRequest);
            let request: HttpRequestPayload = protocol::parse_payload(&envelope).unwrap();
            let reply_body = format!("reply-for:{}", request.path);
            let response = protocol::encode(
                MessageType::HttpResponse,
                Some(&HttpResponsePayload {
                    id: request.id,
                    status_code: 200,
                    headers: HashMap::new(),
                    body: reply_body.into_bytes(),
                }),
            )
            .unwrap();
            ws.send(WsMessage::Text(response.into())).await.unwrap();
        }
    });

    let requests: Vec<_> = (0..COUNT)
        .map(|i| {
            let host = host.clone();
            tokio::spawn(async move {
                let path = format!("/item-{i}");
                let (status, body) = send_raw_http_request(addr, &host, &path).await;
                (path, status, body)
            })
        })
        .collect();

    for task in requests {
        let (path, status, body) = task.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, format!("reply-for:{path}").into_bytes());
    }

    responder.await.unwrap();
}

#[tokio::test]
async fn client_disconnect_mid_request_yields_bad_gateway() {
    let addr = spawn_relay().await;
    let (mut ws, registered) = register_fake_client(addr).await;
    let host = format!("{}.filegate.app", registered.subdomain);

    // The client receives the request frame, then vanishes without ever
    // answering it.
    let vanisher = tokio::spawn(async move {
        let msg = ws.next().await.unwrap().unwrap();
        assert!(matches!(msg, WsMessage::Text(_)));
        ws.close(None).await.unwrap();
    });

    let (status, _) = send_raw_http_request(addr, &host, "/vanish").await;
    assert_eq!(status, 502);

    vanisher.await.unwrap();
}

#[tokio::test]
async fn registration_reports_exhaustion_when_subdomains_collide() {
    let hub = Hub::with_subdomain_source("filegate.app".to_string(), || "collision".to_string());
    let addr = spawn_relay_with_hub(hub).await;

    let (_first_ws, registered) = register_fake_client(addr).await;
    assert_eq!(registered.subdomain, "collision");

    // Every attempt in the second registration collides with the same
    // pinned candidate, exhausting MAX_SUBDOMAIN_ATTEMPTS; the relay must
    // report `registration_failed` instead of silently dropping the
    // connection.
    let url = format!("ws://{addr}/tunnel");
    let (mut second_ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let register = protocol::encode(
        MessageType::Register,
        Some(&RegisterPayload {
            version: "1.0.0".to_string(),
        }),
    )
    .unwrap();
    second_ws.send(WsMessage::Text(register.into())).await.unwrap();

    let reply = second_ws.next().await.unwrap().unwrap();
    let text = match reply {
        WsMessage::Text(text) => text,
        other => panic!("expected text frame, got {other:?}"),
    };
    let envelope = protocol::decode(&text).unwrap();
    assert_eq!(envelope.r#type, MessageType::Error);
    let payload: ErrorPayload = protocol::parse_payload(&envelope).unwrap();
    assert_eq!(payload.code, ERROR_REGISTRATION_FAILED);
}
