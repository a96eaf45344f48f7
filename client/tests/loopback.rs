//! Pairs a real `TunnelClient` against an in-process relay `Router`, driving
//! a public HTTP request end to end through a `LocalHandler`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use tunnel_client::tunnel::{HttpRequest, HttpResponse, LocalHandler, TunnelClient};

struct EchoHandler;

#[async_trait]
impl LocalHandler for EchoHandler {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        HttpResponse::new(200)
            .with_header("content-type", "text/plain")
            .with_body(format!("echo:{}", req.path))
    }
}

async fn spawn_relay() -> std::net::SocketAddr {
    let (app, _state) = tunnel_relay::build_app("filegate.app".to_string());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn send_raw_http_request(addr: std::net::SocketAddr, host: &str, path: &str) -> (u16, Vec<u8>) {
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
    (status, body_start.map(|p| buf[p..].to_vec()).unwrap_or_default())
}

#[tokio::test]
async fn public_request_reaches_the_local_handler() {
    let relay_addr = spawn_relay().await;
    let ws_url = format!("ws://{relay_addr}/tunnel");

    let client = Arc::new(TunnelClient::new(ws_url, Arc::new(EchoHandler)));
    let cancel = CancellationToken::new();

    let connect_cancel = cancel.clone();
    let connect_client = client.clone();
    let connect_task = tokio::spawn(async move {
        connect_client.connect(connect_cancel).await.unwrap();
    });

    let subdomain = loop {
        if let Some(url) = client.public_url().await {
            break url;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    let host = subdomain
        .trim_start_matches("https://")
        .to_string();

    let (status, body) = send_raw_http_request(relay_addr, &host, "/hello").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"echo:/hello");

    cancel.cancel();
    let _ = connect_task.await;
}

#[test]
fn http_response_builder_accumulates_headers() {
    let response = HttpResponse::new(204)
        .with_header("x-a", "1")
        .with_header("x-a", "2");
    assert_eq!(
        response.headers.get("x-a"),
        Some(&vec!["1".to_string(), "2".to_string()])
    );
}
