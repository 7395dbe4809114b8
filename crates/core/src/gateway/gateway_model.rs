//! Offline gateway models: requests, cached responses and queued writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};
use crate::sync::QueueEntryStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl GatewayMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMethod::Get => "GET",
            GatewayMethod::Post => "POST",
            GatewayMethod::Put => "PUT",
            GatewayMethod::Patch => "PATCH",
            GatewayMethod::Delete => "DELETE",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, GatewayMethod::Get)
    }
}

impl fmt::Display for GatewayMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayMethod {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(GatewayMethod::Get),
            "POST" => Ok(GatewayMethod::Post),
            "PUT" => Ok(GatewayMethod::Put),
            "PATCH" => Ok(GatewayMethod::Patch),
            "DELETE" => Ok(GatewayMethod::Delete),
            other => Err(Error::validation(format!("Unsupported method '{}'", other))),
        }
    }
}

/// A call to a server-only endpoint routed through the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRequest {
    pub method: GatewayMethod,
    /// Path relative to the remote base URL, including any query string.
    pub endpoint: String,
    #[serde(default)]
    pub body: Option<Value>,
}

impl GatewayRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: GatewayMethod::Get,
            endpoint: endpoint.into(),
            body: None,
        }
    }

    pub fn write(method: GatewayMethod, endpoint: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with('/') {
            return Err(Error::validation(format!(
                "Gateway endpoint '{}' must start with '/'",
                self.endpoint
            )));
        }
        if self.endpoint.contains("://") {
            return Err(Error::validation("Gateway endpoint must be a relative path"));
        }
        Ok(())
    }

    /// Stable key over method, endpoint and payload. Object keys are serialized
    /// in sorted order, so logically equal payloads share a key.
    pub fn request_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.endpoint.as_bytes());
        hasher.update(b"\n");
        if let Some(body) = &self.body {
            hasher.update(body.to_string().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Successful response from the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub request_key: String,
    pub endpoint: String,
    pub status: u16,
    pub body: Value,
    pub cached_at: i64,
    pub expires_at: Option<i64>,
}

impl CachedResponse {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.map(|at| at <= now_ms).unwrap_or(false)
    }
}

/// A write held back while the remote authority was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestQueueEntry {
    pub id: String,
    pub request_key: String,
    pub request: GatewayRequest,
    pub enqueued_at: i64,
    pub status: QueueEntryStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
}

impl RequestQueueEntry {
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.status == QueueEntryStatus::Pending
            && self.next_retry_at.map(|at| at <= now_ms).unwrap_or(true)
    }
}

/// What the gateway did with a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GatewayOutcome {
    /// Served by the remote authority.
    Fresh { response: GatewayResponse },
    /// Served from the response cache because the remote was unreachable.
    #[serde(rename_all = "camelCase")]
    Cached {
        response: GatewayResponse,
        cached_at: i64,
        stale: bool,
    },
    /// Write held for replay. `duplicate` is set when an identical write was already pending.
    #[serde(rename_all = "camelCase")]
    Queued { entry_id: String, duplicate: bool },
    /// Read with no cached copy while unreachable.
    UnavailableOffline,
}
