//! REST client for the remote authority.
//!
//! Entity mutations go to `/api/v1/{table}`; every delivery carries the queue
//! entry id as `Idempotency-Key` so a replay after a lost response is harmless.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use std::time::Duration;

use dairysync_core::entities::SyncableRecord;
use dairysync_core::gateway::{
    GatewayMethod, GatewayRequest, GatewayResponse, GatewayTransportTrait,
};
use dairysync_core::sync::{
    DeliveryError, DeliveryOutcome, RemoteAuthorityTrait, SyncMutation, SyncQueueEntry,
};

use crate::error::{RemoteError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const PROBE_TIMEOUT_SECS: u64 = 5;
const MAX_LOG_BODY_CHARS: usize = 512;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const BASE_LAST_MODIFIED_HEADER: &str = "x-base-last-modified";
pub const LAST_MODIFIED_HEADER: &str = "x-last-modified";

/// Body of a `409 Conflict` answer.
#[derive(Debug, Deserialize)]
struct ConflictBody {
    record: SyncableRecord,
}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteClient {
    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("Remote response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("Remote response error ({}): {}", status, preview);
    }

    /// `base_url` is the remote authority root, e.g. `https://hq.example.com`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn delivery_headers(entry: &SyncQueueEntry) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key = HeaderValue::from_str(&entry.id)
            .map_err(|_| RemoteError::invalid_request("Invalid queue entry id"))?;
        headers.insert(IDEMPOTENCY_KEY_HEADER, key);
        if let Some(base) = entry.base_last_modified {
            headers.insert(BASE_LAST_MODIFIED_HEADER, HeaderValue::from(base));
        }
        headers.insert(LAST_MODIFIED_HEADER, HeaderValue::from(entry.last_modified));
        Ok(headers)
    }

    /// Sends one queue entry. A `409` carrying the remote record is a conflict,
    /// not an error.
    pub async fn deliver_entry(&self, entry: &SyncQueueEntry) -> Result<DeliveryOutcome> {
        let table = entry.table.as_str();
        let headers = Self::delivery_headers(entry)?;
        let request = match &entry.mutation {
            SyncMutation::Create { record } => self
                .client
                .post(format!("{}/api/v1/{}", self.base_url, table))
                .json(record),
            SyncMutation::Update { id, changes } => self
                .client
                .patch(format!("{}/api/v1/{}/{}", self.base_url, table, id))
                .json(changes),
            SyncMutation::Delete { id } => self
                .client
                .delete(format!("{}/api/v1/{}/{}", self.base_url, table, id)),
        };

        let response = request.headers(headers).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if status.is_success() {
            return Ok(DeliveryOutcome::Applied);
        }
        if status == reqwest::StatusCode::CONFLICT {
            if let Ok(conflict) = serde_json::from_str::<ConflictBody>(&body) {
                return Ok(DeliveryOutcome::Conflict {
                    remote: conflict.record,
                });
            }
        }
        Err(RemoteError::api(
            status.as_u16(),
            format!("Request failed: {}", body),
        ))
    }

    /// Performs a gateway call against `{base}{endpoint}`.
    pub async fn send_request(&self, request: &GatewayRequest) -> Result<GatewayResponse> {
        request
            .validate()
            .map_err(|err| RemoteError::invalid_request(err.to_string()))?;

        let method = match request.method {
            GatewayMethod::Get => Method::GET,
            GatewayMethod::Post => Method::POST,
            GatewayMethod::Put => Method::PUT,
            GatewayMethod::Patch => Method::PATCH,
            GatewayMethod::Delete => Method::DELETE,
        };
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, request.endpoint));
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        Self::log_response(status, &text);

        if !status.is_success() {
            return Err(RemoteError::api(
                status.as_u16(),
                format!("Request failed: {}", text),
            ));
        }

        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        Ok(GatewayResponse {
            status: status.as_u16(),
            body,
        })
    }

    /// GET /health
    pub async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(RemoteError::api(status.as_u16(), "Health check failed"))
    }
}

#[async_trait]
impl RemoteAuthorityTrait for RemoteClient {
    async fn deliver(
        &self,
        entry: &SyncQueueEntry,
    ) -> std::result::Result<DeliveryOutcome, DeliveryError> {
        self.deliver_entry(entry).await.map_err(DeliveryError::from)
    }

    async fn probe(&self) -> bool {
        match self.health().await {
            Ok(()) => true,
            Err(err) => {
                debug!("Remote probe failed: {}", err);
                false
            }
        }
    }
}

#[async_trait]
impl GatewayTransportTrait for RemoteClient {
    async fn send(
        &self,
        request: &GatewayRequest,
    ) -> std::result::Result<GatewayResponse, DeliveryError> {
        self.send_request(request).await.map_err(DeliveryError::from)
    }
}
