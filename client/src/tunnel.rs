//! The tunnel client: dials the relay, registers a subdomain, and forwards
//! `http_request` frames to a local `LocalHandler`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tunnel_shared::protocol::{
    self, ErrorPayload, HttpRequestPayload, HttpResponsePayload, MessageType, RegisterPayload,
    RegisteredPayload,
};
use tunnel_shared::{Error, Result};

const PROTOCOL_VERSION: &str = "1.0.0";
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_MULTIPLIER: u32 = 2;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A plain HTTP request as decoded from an `http_request` frame, handed to
/// a [`LocalHandler`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

/// A plain HTTP response a [`LocalHandler`] hands back.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }
}

/// The capability a tunnel client forwards public requests to. The Rust
/// analogue of an `http.Handler` invoked against an in-memory recorder: no
/// sockets, just a request in and a response out.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn handle(&self, req: HttpRequest) -> HttpResponse;
}

/// Observed connection lifecycle, exposed for logging and tests. Not used
/// to gate behavior: the read loop itself only exists once registration has
/// already succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Dialing,
    Registering,
    Registered,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WriteHalf = Arc<Mutex<SplitSink<Socket, WsMessage>>>;
type ReadHalf = SplitStream<Socket>;

/// Optional lifecycle callbacks, mirroring the original's `OnConnected` /
/// `OnDisconnected` / `OnReconnecting` hooks.
pub struct Callbacks {
    pub on_connected: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
    pub on_disconnected: Option<Box<dyn Fn(&Error) + Send + Sync>>,
    pub on_reconnecting: Option<Box<dyn Fn(u32) + Send + Sync>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_connected: None,
            on_disconnected: None,
            on_reconnecting: None,
        }
    }
}

/// Drives one logical tunnel: dial, register, forward, and reconnect with
/// backoff on failure.
pub struct TunnelClient {
    relay_url: String,
    handler: Arc<dyn LocalHandler>,
    callbacks: Callbacks,
    subdomain: Mutex<Option<String>>,
    full_url: Mutex<Option<String>>,
}

impl TunnelClient {
    pub fn new(relay_url: impl Into<String>, handler: Arc<dyn LocalHandler>) -> Self {
        Self {
            relay_url: relay_url.into(),
            handler,
            callbacks: Callbacks::default(),
            subdomain: Mutex::new(None),
            full_url: Mutex::new(None),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub async fn public_url(&self) -> Option<String> {
        self.full_url.lock().await.clone()
    }

    /// Connects, registers, serves, and reconnects with exponential backoff
    /// until `cancel` fires. Returns once cancellation is observed.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<()> {
        let mut delay = INITIAL_RECONNECT_DELAY;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.connect_once(&cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if let Some(cb) = &self.callbacks.on_disconnected {
                        cb(&err);
                    }
                    warn!("tunnel disconnected: {err}");
                }
            }

            if cancel.is_cancelled() {
                return Ok(());
            }

            attempt += 1;
            if let Some(cb) = &self.callbacks.on_reconnecting {
                cb(attempt);
            }
            info!("reconnecting in {:?} (attempt {attempt})", delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(()),
            }

            delay = std::cmp::min(delay * RECONNECT_MULTIPLIER, MAX_RECONNECT_DELAY);
        }
    }

    /// One dial-register-serve cycle. Returns `Ok(())` only on a clean close
    /// requested via `cancel`; any other disconnect is an `Err` so the
    /// caller reconnects.
    async fn connect_once(&self, cancel: &CancellationToken) -> Result<()> {
        info!("connecting to relay: {}", self.relay_url);
        let (stream, _) = connect_async(&self.relay_url)
            .await
            .map_err(|err| Error::Connection(err.to_string()))?;
        let (write, mut read) = stream.split();
        let write: WriteHalf = Arc::new(Mutex::new(write));

        send_register(&write).await?;
        let registered = tokio::time::timeout(REGISTRATION_TIMEOUT, wait_for_registered(&mut read))
            .await
            .map_err(|_| Error::RequestTimeout)??;

        *self.subdomain.lock().await = Some(registered.subdomain.clone());
        *self.full_url.lock().await = Some(registered.full_url.clone());
        if let Some(cb) = &self.callbacks.on_connected {
            cb(&registered.subdomain, &registered.full_url);
        }
        info!("tunnel registered: {}", registered.full_url);

        let ping_write = write.clone();
        let ping_cancel = cancel.clone();
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if send_ping(&ping_write).await.is_err() {
                            return;
                        }
                    }
                    _ = ping_cancel.cancelled() => return,
                }
            }
        });

        let result = self.read_loop(&mut read, &write, cancel).await;
        ping_task.abort();
        result
    }

    async fn read_loop(
        &self,
        read: &mut ReadHalf,
        write: &WriteHalf,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.dispatch(&text, write).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return Err(Error::ConnectionClosed),
                        Some(Err(err)) => return Err(Error::Connection(err.to_string())),
                        _ => {}
                    }
                }
                _ = cancel.cancelled() => {
                    let mut write = write.lock().await;
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, text: &str, write: &WriteHalf) {
        let envelope = match protocol::decode(text) {
            Ok(envelope) => envelope,
            Err(_) => return,
        };
        match envelope.r#type {
            MessageType::HttpRequest => {
                let payload: HttpRequestPayload = match protocol::parse_payload(&envelope) {
                    Ok(payload) => payload,
                    Err(_) => return,
                };
                let handler = self.handler.clone();
                let write = write.clone();
                tokio::spawn(async move {
                    handle_http_request(handler, payload, write).await;
                });
            }
            MessageType::Pong => {}
            MessageType::Error => {
                if let Ok(payload) = protocol::parse_payload::<ErrorPayload>(&envelope) {
                    warn!("relay reported error: {} ({})", payload.message, payload.code);
                }
            }
            _ => {}
        }
    }
}

async fn send_register(write: &WriteHalf) -> Result<()> {
    let frame = protocol::encode(
        MessageType::Register,
        Some(&RegisterPayload {
            version: PROTOCOL_VERSION.to_string(),
        }),
    )?;
    write
        .lock()
        .await
        .send(WsMessage::Text(frame.into()))
        .await
        .map_err(|err| Error::Connection(err.to_string()))
}

async fn send_ping(write: &WriteHalf) -> Result<()> {
    let frame = protocol::encode::<()>(MessageType::Ping, None)?;
    write
        .lock()
        .await
        .send(WsMessage::Text(frame.into()))
        .await
        .map_err(|err| Error::Connection(err.to_string()))
}

async fn wait_for_registered(read: &mut ReadHalf) -> Result<RegisteredPayload> {
    match read.next().await {
        Some(Ok(WsMessage::Text(text))) => {
            let envelope = protocol::decode(&text)?;
            match envelope.r#type {
                MessageType::Registered => protocol::parse_payload(&envelope),
                MessageType::Error => {
                    let payload: ErrorPayload = protocol::parse_payload(&envelope)?;
                    Err(Error::RegistrationFailed(payload.message))
                }
                other => Err(Error::Protocol(format!(
                    "unexpected message type during registration: {other:?}"
                ))),
            }
        }
        Some(Ok(_)) => Err(Error::Protocol("expected text frame during registration".into())),
        Some(Err(err)) => Err(Error::Connection(err.to_string())),
        None => Err(Error::ConnectionClosed),
    }
}

async fn handle_http_request(
    handler: Arc<dyn LocalHandler>,
    payload: HttpRequestPayload,
    write: WriteHalf,
) {
    let request = HttpRequest {
        method: payload.method,
        path: payload.path,
        headers: payload.headers,
        body: payload.body,
    };
    let response = handler.handle(request).await;

    let frame = match protocol::encode(
        MessageType::HttpResponse,
        Some(&HttpResponsePayload {
            id: payload.id,
            status_code: response.status_code,
            headers: response.headers,
            body: response.body,
        }),
    ) {
        Ok(frame) => frame,
        Err(_) => return,
    };

    let _ = write.lock().await.send(WsMessage::Text(frame.into())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_doubles_and_caps() {
        let mut delay = INITIAL_RECONNECT_DELAY;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];
        for expected_secs in expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = std::cmp::min(delay * RECONNECT_MULTIPLIER, MAX_RECONNECT_DELAY);
        }
    }

    #[test]
    fn connection_state_variants_are_distinct() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Dialing);
        assert_ne!(ConnectionState::Registering, ConnectionState::Registered);
    }
}
