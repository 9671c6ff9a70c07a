//! Wire messages and the JSON text frame codec.
//!
//! Shapes on the wire:
//!
//! - notification: `{ "method": "...", "params": {...}? }`
//! - request:      `{ "id": 1, "method": "...", "params": {...}? }`
//! - response:     `{ "id": 1, "result": ...? , "error": {"code", "message"}? }`
//! - heartbeat:    `{ "heartbeat": "ping" | "pong" }`

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Maximum text frame size (1 MiB). Larger frames are rejected before parsing.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Correlation id of a request/response pair. Peers may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::Text(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Heartbeat {
    Ping,
    Pong,
}

/// A single frame exchanged between two channel ends.
///
/// Variant order matters for untagged decoding: a frame carrying both `id`
/// and `method` is a request, `method` alone is a notification, `id` alone
/// is a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Heartbeat {
        heartbeat: Heartbeat,
    },
    Request {
        id: RequestId,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Notification {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
}

impl Message {
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn result(id: RequestId, result: Value) -> Self {
        Message::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Message::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn ping() -> Self {
        Message::Heartbeat {
            heartbeat: Heartbeat::Ping,
        }
    }

    pub fn pong() -> Self {
        Message::Heartbeat {
            heartbeat: Heartbeat::Pong,
        }
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Parameters for requests and notifications.
    pub fn params(&self) -> Option<&Value> {
        match self {
            Message::Request { params, .. } | Message::Notification { params, .. } => {
                params.as_ref()
            }
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Message::Heartbeat { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds {max_bytes} bytes (got {frame_bytes})")]
    FrameTooLarge {
        frame_bytes: usize,
        max_bytes: usize,
    },

    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Serialize a message into a text frame.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    let text = serde_json::to_string(message)?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            frame_bytes: text.len(),
            max_bytes: MAX_FRAME_BYTES,
        });
    }
    Ok(text)
}

/// Parse a text frame into a message.
pub fn decode(frame: &str) -> Result<Message, CodecError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            frame_bytes: frame.len(),
            max_bytes: MAX_FRAME_BYTES,
        });
    }
    Ok(serde_json::from_str(frame)?)
}
