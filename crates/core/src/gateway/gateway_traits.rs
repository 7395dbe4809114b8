use async_trait::async_trait;

use super::gateway_model::{
    CachedResponse, GatewayRequest, GatewayResponse, RequestQueueEntry,
};
use crate::errors::Result;
use crate::sync::DeliveryError;

/// Transport for server-only endpoints.
#[async_trait]
pub trait GatewayTransportTrait: Send + Sync {
    /// Performs the request. Non-2xx statuses and network failures are both
    /// reported as `DeliveryError`, classified for retry.
    async fn send(&self, request: &GatewayRequest)
        -> std::result::Result<GatewayResponse, DeliveryError>;
}

#[async_trait]
pub trait ResponseCacheRepositoryTrait: Send + Sync {
    fn get_cached_response(&self, request_key: &str) -> Result<Option<CachedResponse>>;

    /// Upsert by request key.
    async fn store_response(&self, response: CachedResponse) -> Result<()>;

    /// Deletes entries whose TTL elapsed before `now_ms`. Returns the number removed.
    async fn cleanup_expired(&self, now_ms: i64) -> Result<usize>;
}

#[async_trait]
pub trait RequestQueueRepositoryTrait: Send + Sync {
    /// Appends a write unless an identical one is already pending.
    /// Returns the pending entry and whether it was newly created.
    async fn enqueue_request(&self, request: GatewayRequest) -> Result<(RequestQueueEntry, bool)>;

    /// Pending entries in FIFO order, including ones still backing off.
    fn list_pending_requests(&self) -> Result<Vec<RequestQueueEntry>>;

    async fn mark_request_delivered(&self, entry_id: String) -> Result<()>;

    async fn schedule_request_retry(
        &self,
        entry_id: String,
        retry_count: i32,
        next_retry_at: i64,
        error: String,
        error_code: String,
    ) -> Result<()>;

    async fn mark_request_dead(&self, entry_id: String, error: String, error_code: String)
        -> Result<()>;
}
