//! Error types shared by the relay and the tunnel client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    RequestTimeout,

    #[error("write timeout")]
    WriteTimeout,

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
