//! The relay's client table: one entry per connected tunnel, keyed by
//! subdomain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tunnel_shared::protocol::{
    self, ErrorPayload, HttpRequestPayload, HttpResponsePayload, MessageType,
    ERROR_REGISTRATION_FAILED,
};
use tunnel_shared::words::generate_subdomain;
use tunnel_shared::{Error, Result};

/// How many times `Hub::register` will retry a freshly generated subdomain
/// before giving up.
pub const MAX_SUBDOMAIN_ATTEMPTS: usize = 10;

/// Ceiling on how long a write to a tunnel client's socket may block.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on how long the relay waits for a `http_response` before failing
/// a public request with 504.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type WriteHalf = Arc<Mutex<SplitSink<WebSocket, WsMessage>>>;
type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<HttpResponsePayload>>>>;

/// A single connected tunnel client.
///
/// The write half and the pending-request table are independently locked so
/// a caller waiting on a response never blocks a concurrent writer, and vice
/// versa. Lock order, when both are needed, is always pending before write.
#[derive(Clone)]
pub struct Client {
    pub subdomain: String,
    write: WriteHalf,
    pending: PendingTable,
}

impl Client {
    pub fn new(subdomain: String, write: SplitSink<WebSocket, WsMessage>) -> Self {
        Self {
            subdomain,
            write: Arc::new(Mutex::new(write)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send an `http_request` frame to the client and wait for its matching
    /// `http_response`, bounded by `REQUEST_TIMEOUT` and an optional
    /// cancellation signal (fires on relay shutdown; axum gives no
    /// per-request client-disconnect signal to thread in here today).
    pub async fn send_request(
        &self,
        req: HttpRequestPayload,
        cancel: &CancellationToken,
    ) -> Result<HttpResponsePayload> {
        let id = req.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let frame = protocol::encode(MessageType::HttpRequest, Some(&req))?;
        if let Err(err) = self.write_frame(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        tokio::select! {
            result = rx => result.map_err(|_| Error::ConnectionClosed),
            _ = tokio::time::sleep(REQUEST_TIMEOUT) => {
                self.pending.lock().await.remove(&id);
                Err(Error::RequestTimeout)
            }
            _ = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(Error::Cancelled)
            }
        }
    }

    /// Route a decoded `http_response` frame to whichever `send_request`
    /// call is waiting on its `id`. Silently drops responses with no
    /// matching pending request (already timed out, or a stray duplicate).
    pub async fn handle_response(&self, resp: HttpResponsePayload) {
        if let Some(tx) = self.pending.lock().await.remove(&resp.id) {
            let _ = tx.send(resp);
        }
    }

    pub async fn send_pong(&self) -> Result<()> {
        let frame = protocol::encode::<()>(MessageType::Pong, None)?;
        self.write_frame(frame).await
    }

    /// Sends an already-encoded frame, bounded by `WRITE_TIMEOUT`. Used for
    /// the one-off `registered` reply, which doesn't fit the request/response
    /// or pong shapes above.
    pub async fn send_frame(&self, frame: String) -> Result<()> {
        self.write_frame(frame).await
    }

    /// Sends a raw text frame, bounded by `WRITE_TIMEOUT`.
    async fn write_frame(&self, frame: String) -> Result<()> {
        let mut write = self.write.lock().await;
        match timeout(WRITE_TIMEOUT, write.send(WsMessage::Text(frame.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::WriteTimeout),
        }
    }

    /// Drains the pending table and closes the socket, used when the read
    /// loop for this client exits.
    pub async fn close(&self) {
        let mut pending = self.pending.lock().await;
        pending.clear();
        drop(pending);
        let mut write = self.write.lock().await;
        let _ = write.close().await;
    }
}

/// The relay's table of connected tunnel clients.
#[derive(Clone)]
pub struct Hub {
    clients: Arc<RwLock<HashMap<String, Client>>>,
    domain: String,
    subdomain_source: Arc<dyn Fn() -> String + Send + Sync>,
}

impl Hub {
    pub fn new(domain: String) -> Self {
        Self::with_subdomain_source(domain, generate_subdomain)
    }

    /// Builds a `Hub` that draws candidate subdomains from `source` instead
    /// of the default CSPRNG generator. Lets tests drive the collision-
    /// exhaustion path in `register` deterministically.
    pub fn with_subdomain_source(
        domain: String,
        source: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            domain,
            subdomain_source: Arc::new(source),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Picks a free subdomain (generating up to `MAX_SUBDOMAIN_ATTEMPTS`
    /// candidates) and registers `client` under it. Returns the subdomain
    /// assigned. On exhaustion, reports `registration_failed` to the client
    /// before returning the error.
    pub async fn register(&self, mut write: SplitSink<WebSocket, WsMessage>) -> Result<String> {
        let mut clients = self.clients.write().await;
        for _ in 0..MAX_SUBDOMAIN_ATTEMPTS {
            let candidate = (self.subdomain_source)();
            if !clients.contains_key(&candidate) {
                clients.insert(candidate.clone(), Client::new(candidate.clone(), write));
                return Ok(candidate);
            }
        }
        warn!(
            "exhausted {} subdomain attempts, all collided",
            MAX_SUBDOMAIN_ATTEMPTS
        );
        let message = "no free subdomain after maximum attempts";
        if let Ok(frame) = protocol::encode(
            MessageType::Error,
            Some(&ErrorPayload {
                code: ERROR_REGISTRATION_FAILED.to_string(),
                message: message.to_string(),
            }),
        ) {
            let _ = write.send(WsMessage::Text(frame.into())).await;
        }
        let _ = write.close().await;
        Err(Error::RegistrationFailed(message.into()))
    }

    pub async fn unregister(&self, subdomain: &str) {
        if let Some(client) = self.clients.write().await.remove(subdomain) {
            client.close().await;
        }
    }

    pub async fn get(&self, subdomain: &str) -> Option<Client> {
        self.clients.read().await.get(subdomain).cloned()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
