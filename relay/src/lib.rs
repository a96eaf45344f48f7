//! Relay library: the `Hub` client table and the axum app built around it.
//! Split out from the binary so integration tests can drive a real app
//! instance over a loopback `TcpListener`.

use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header::HOST, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub mod hub;

use hub::Hub;
use tunnel_shared::protocol::{
    self, ErrorPayload, HttpRequestPayload, HttpResponsePayload, MessageType, RegisterPayload,
    RegisteredPayload, ERROR_INVALID_REGISTRATION,
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DOMAIN: &str = "filegate.app";

/// Ceiling on how long the relay waits for the first (`register`) frame
/// after a tunnel client completes the WebSocket upgrade.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    hub: Hub,
    shutdown: CancellationToken,
}

/// Builds the relay's axum `Router` for `domain`, along with the state it
/// closes over (exposed so a caller can trigger graceful shutdown).
pub fn build_app(domain: String) -> (Router, AppState) {
    build_app_with_hub(Hub::new(domain))
}

/// Builds the relay's axum `Router` around an already-constructed `Hub`.
/// Exposed so tests can inject a `Hub::with_subdomain_source` stub to drive
/// deterministic subdomain-collision scenarios through a real socket.
pub fn build_app_with_hub(hub: Hub) -> (Router, AppState) {
    let state = AppState {
        hub,
        shutdown: CancellationToken::new(),
    };
    let app = Router::new()
        .route("/tunnel", get(tunnel_handler))
        .route("/health", get(health_handler))
        .fallback(any(proxy_handler))
        .with_state(state.clone());
    (app, state)
}

impl AppState {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let clients = state.hub.client_count().await;
    axum::Json(serde_json::json!({
        "status": "ok",
        "clients": clients,
    }))
}

async fn tunnel_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut write, mut read) = socket.split();

    // First frame must be a `register` message, read within
    // REGISTRATION_TIMEOUT; anything else is a malformed handshake and the
    // relay reports an `invalid_registration` error before closing.
    let register_text = match timeout(REGISTRATION_TIMEOUT, read.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        _ => {
            warn!("tunnel handshake failed: no registration frame");
            send_error_frame(
                &mut write,
                ERROR_INVALID_REGISTRATION,
                "expected a register frame within 10 seconds",
            )
            .await;
            return;
        }
    };

    let envelope = match protocol::decode(&register_text) {
        Ok(msg) if msg.r#type == MessageType::Register => msg,
        _ => {
            warn!("tunnel handshake failed: first frame was not `register`");
            send_error_frame(
                &mut write,
                ERROR_INVALID_REGISTRATION,
                "first frame must be a register message",
            )
            .await;
            return;
        }
    };
    let _register: RegisterPayload = match protocol::parse_payload(&envelope) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("tunnel handshake failed: bad register payload: {err}");
            send_error_frame(
                &mut write,
                ERROR_INVALID_REGISTRATION,
                &format!("bad register payload: {err}"),
            )
            .await;
            return;
        }
    };

    // `Hub::register` takes ownership of `write` and, on exhaustion, sends
    // its own `registration_failed` error frame before returning.
    let subdomain = match state.hub.register(write).await {
        Ok(subdomain) => subdomain,
        Err(err) => {
            warn!("registration failed: {err}");
            return;
        }
    };

    let client = match state.hub.get(&subdomain).await {
        Some(client) => client,
        None => return,
    };

    let full_url = format!("https://{subdomain}.{}", state.hub.domain());
    let registered = protocol::encode(
        MessageType::Registered,
        Some(&RegisteredPayload {
            subdomain: subdomain.clone(),
            full_url: full_url.clone(),
        }),
    );
    let registered = match registered {
        Ok(frame) => frame,
        Err(_) => {
            state.hub.unregister(&subdomain).await;
            return;
        }
    };
    if client.send_frame(registered).await.is_err() {
        state.hub.unregister(&subdomain).await;
        return;
    }

    info!("tunnel active: {full_url}");

    while let Some(msg) = read.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                let envelope = match protocol::decode(&text) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                match envelope.r#type {
                    MessageType::HttpResponse => {
                        if let Ok(payload) =
                            protocol::parse_payload::<HttpResponsePayload>(&envelope)
                        {
                            client.handle_response(payload).await;
                        }
                    }
                    MessageType::Ping => {
                        let _ = client.send_pong().await;
                    }
                    _ => {}
                }
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    state.hub.unregister(&subdomain).await;
    info!("tunnel closed: {subdomain}");
}

/// Extracts the subdomain label from a `Host` header, stripping a port if
/// present. Returns `None` when the host is exactly the base domain (the
/// relay's own landing page) or doesn't end in the base domain at all.
fn extract_subdomain(host: &str, domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    if host == domain {
        return None;
    }
    let suffix = format!(".{domain}");
    host.strip_suffix(&suffix).map(str::to_string)
}

async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let subdomain = match extract_subdomain(&host, state.hub.domain()) {
        Some(subdomain) => subdomain,
        None => {
            return Html("<html><body><h1>reverse tunnel relay</h1></body></html>").into_response();
        }
    };

    let client = match state.hub.get(&subdomain).await {
        Some(client) => client,
        None => {
            return (StatusCode::NOT_FOUND, "no tunnel for this subdomain").into_response();
        }
    };

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let mut headers = std::collections::HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(Vec::new)
                .push(value.to_string());
        }
    }

    let body = match axum::body::to_bytes(req.into_body(), 10 * 1024 * 1024).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let request_payload = HttpRequestPayload {
        id: Uuid::new_v4().to_string(),
        method,
        path,
        headers,
        body,
    };

    match client.send_request(request_payload, &state.shutdown).await {
        Ok(resp) => build_response(resp),
        Err(tunnel_shared::Error::RequestTimeout) => (
            StatusCode::GATEWAY_TIMEOUT,
            "tunnel client did not respond in time",
        )
            .into_response(),
        Err(err) => {
            warn!("proxy to {subdomain} failed: {err}");
            (StatusCode::BAD_GATEWAY, "tunnel client unavailable").into_response()
        }
    }
}

fn build_response(payload: HttpResponsePayload) -> Response {
    let status =
        StatusCode::from_u16(payload.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        for (name, values) in &payload.headers {
            for value in values {
                if let (Ok(name), Ok(value)) = (
                    axum::http::HeaderName::from_bytes(name.as_bytes()),
                    axum::http::HeaderValue::from_str(value),
                ) {
                    headers_mut.append(name, value);
                }
            }
        }
    }
    builder
        .body(Body::from(payload.body))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR).into_response())
}

fn error_frame(code: &str, message: &str) -> tunnel_shared::Result<String> {
    protocol::encode(
        MessageType::Error,
        Some(&ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        }),
    )
}

/// Sends an `error` frame (best-effort) and closes the socket. Used on
/// handshake failures, before the connection has a `Client` in the hub to
/// go through.
async fn send_error_frame(write: &mut SplitSink<WebSocket, WsMessage>, code: &str, message: &str) {
    if let Ok(frame) = error_frame(code, message) {
        let _ = write.send(WsMessage::Text(frame.into())).await;
    }
    let _ = write.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_extraction_strips_port() {
        assert_eq!(
            extract_subdomain("brave-tiger.filegate.app:443", "filegate.app"),
            Some("brave-tiger".to_string())
        );
    }

    #[test]
    fn bare_domain_has_no_subdomain() {
        assert_eq!(extract_subdomain("filegate.app", "filegate.app"), None);
    }

    #[test]
    fn foreign_host_has_no_subdomain() {
        assert_eq!(extract_subdomain("example.com", "filegate.app"), None);
    }

    #[test]
    fn nested_subdomain_keeps_full_label() {
        assert_eq!(
            extract_subdomain("a.b.filegate.app", "filegate.app"),
            Some("a.b".to_string())
        );
    }
}
