//! Error types for the remote authority client.

use dairysync_core::sync::{classify_http_status, DeliveryError, SyncRetryClass};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the remote authority
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the request never got an answer from the remote.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Http(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            _ => false,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(_) => SyncRetryClass::Retryable,
            Self::Json(_) => SyncRetryClass::Permanent,
            Self::InvalidRequest(_) => SyncRetryClass::Permanent,
        }
    }
}

impl From<RemoteError> for DeliveryError {
    fn from(err: RemoteError) -> Self {
        if err.is_unreachable() {
            return DeliveryError::network(err.to_string());
        }
        let code = match &err {
            RemoteError::Api { status, .. } => format!("http_{}", status),
            RemoteError::Http(_) => "http_transport".to_string(),
            RemoteError::Json(_) => "invalid_response".to_string(),
            RemoteError::InvalidRequest(_) => "invalid_request".to_string(),
        };
        DeliveryError {
            class: err.retry_class(),
            message: err.to_string(),
            code: Some(code),
        }
    }
}
