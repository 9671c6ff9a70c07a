//! Error types and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::preferences::PreferenceKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed connection name: {0}")]
    MalformedName(String),

    #[error("unknown connection source: {0}")]
    UnknownSource(String),

    #[error("unknown view: {0}")]
    UnknownView(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

impl ProtocolError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedName(_) => "malformed_name",
            Self::UnknownSource(_) => "unknown_source",
            Self::UnknownView(_) => "unknown_view",
            Self::UnknownMethod(_) => "unknown_method",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: PreferenceKey, value: String },

    #[error("unknown preference key: {0}")]
    UnknownKey(String),

    #[error("preference file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("preference file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl PreferenceError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Invalid { .. } => "invalid_preference",
            Self::UnknownKey(_) => "unknown_preference",
            Self::Io(_) => "preference_io",
            Self::Json(_) => "preference_json",
        }
    }
}

/// Errors returned by the hub's HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub coordinator is not running")]
    Stopped,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid zoom factor: {0}")]
    InvalidZoom(f64),
}

impl HubError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Stopped => "hub_stopped",
            Self::Protocol(e) => e.error_code(),
            Self::InvalidZoom(_) => "invalid_zoom",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            Self::Protocol(_) | Self::InvalidZoom(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// JSON body of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl From<&HubError> for ErrorResponse {
    fn from(err: &HubError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse::from(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(HubError::Stopped.error_code(), "hub_stopped");
        assert_eq!(
            HubError::from(ProtocolError::UnknownSource("AF_XX".into())).error_code(),
            "unknown_source"
        );
        assert_eq!(HubError::InvalidZoom(0.0).error_code(), "invalid_zoom");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(HubError::Stopped.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(HubError::InvalidZoom(-1.0).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_response_body() {
        let body = ErrorResponse::from(&HubError::InvalidZoom(0.0));
        assert_eq!(body.error, "invalid_zoom");
        assert_eq!(body.message, "invalid zoom factor: 0");
    }
}
