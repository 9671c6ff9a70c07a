//! Error types for channels, transports and the wire-level RPC error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire error codes carried in `{id, error: {code, message}}`.
pub mod codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL: i64 = -32603;
}

/// Error payload of a response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("remote error {code}: {message}")]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("unhandled method: {method}"))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("invalid params: {detail}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, message)
    }
}

/// Errors surfaced to callers of `MessageChannel::request`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel closed")]
    Closed,

    #[error(transparent)]
    Remote(#[from] RpcError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ChannelError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
            Self::Remote(_) => "remote",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }

    /// True when the remote peer answered that it has no handler for the method.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Remote(e) if e.code == codes::METHOD_NOT_FOUND)
    }
}

/// Errors raised by transports and connectors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connector has no more links to hand out")]
    Exhausted,
}
