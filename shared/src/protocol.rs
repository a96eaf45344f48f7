//! Wire protocol for the reverse tunnel.
//!
//! Every frame is a UTF-8 JSON object with exactly two top-level fields,
//! `type` and `payload`; `payload`'s schema is selected by `type`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

use crate::error::{Error, Result};

pub const ERROR_INVALID_REGISTRATION: &str = "invalid_registration";
pub const ERROR_REGISTRATION_FAILED: &str = "registration_failed";

/// Discriminant carried by every frame.
///
/// Unknown strings decode into `Unknown(original)` rather than failing, so a
/// peer running a newer protocol version never breaks an older one
/// mid-stream; the original string is kept around for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Register,
    Registered,
    HttpRequest,
    HttpResponse,
    Ping,
    Pong,
    Error,
    Unknown(String),
}

impl MessageType {
    fn as_wire_str(&self) -> &str {
        match self {
            MessageType::Register => "register",
            MessageType::Registered => "registered",
            MessageType::HttpRequest => "http_request",
            MessageType::HttpResponse => "http_response",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::Unknown(raw) => raw,
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "register" => MessageType::Register,
            "registered" => MessageType::Registered,
            "http_request" => MessageType::HttpRequest,
            "http_response" => MessageType::HttpResponse,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "error" => MessageType::Error,
            _ => MessageType::Unknown(raw),
        })
    }
}

/// The envelope carried by every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub r#type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// `{version}` sent by the client when opening a tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub version: String,
}

/// `{subdomain, full_url}` sent by the relay on successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub subdomain: String,
    pub full_url: String,
}

/// A public HTTP request forwarded to the tunnel client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestPayload {
    pub id: String,
    pub method: String,
    /// Full request-URI, i.e. path and query string.
    pub path: String,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

/// The tunnel client's answer to a `HttpRequestPayload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponsePayload {
    pub id: String,
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

/// `{code, message}` sent by either side to report a protocol-level failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Encode a typed message into its wire form.
pub fn encode<T: Serialize>(msg_type: MessageType, payload: Option<&T>) -> Result<String> {
    let payload = payload.map(serde_json::to_value).transpose()?;
    let msg = Message {
        r#type: msg_type,
        payload,
    };
    Ok(serde_json::to_string(&msg)?)
}

/// Decode a raw frame into its envelope. Malformed JSON is the only failure
/// mode; the caller decides whether that's fatal (handshake) or skippable
/// (steady state).
pub fn decode(raw: &str) -> Result<Message> {
    serde_json::from_str(raw).map_err(Error::from)
}

/// Parse a decoded envelope's payload into the schema for its `type`.
pub fn parse_payload<T: DeserializeOwned>(msg: &Message) -> Result<T> {
    match &msg.payload {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Err(Error::Protocol("message has no payload".into())),
    }
}

/// Serializes `Vec<u8>` as a base64 string, matching the wire convention the
/// original Go implementation gets for free from `encoding/json`'s `[]byte`
/// handling.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
