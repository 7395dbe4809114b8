use async_trait::async_trait;

use super::sync_conflict::ConflictStrategy;
use super::sync_queue_model::{DeliveryOutcome, SyncEngineStatus, SyncPassResult, SyncQueueEntry};
use super::sync_retry::DeliveryError;
use crate::entities::{EntityTable, SyncableRecord};
use crate::errors::Result;

/// Queue depth by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: i64,
    pub dead: i64,
}

/// Storage operations the sync engine needs. Every write runs in one storage
/// transaction so queue and record metadata never diverge.
#[async_trait]
pub trait SyncQueueRepositoryTrait: Send + Sync {
    /// Pending entries in FIFO order, including ones still backing off.
    fn list_pending(&self) -> Result<Vec<SyncQueueEntry>>;

    fn list_dead(&self) -> Result<Vec<SyncQueueEntry>>;

    fn get_entry(&self, entry_id: &str) -> Result<Option<SyncQueueEntry>>;

    fn queue_depth(&self) -> Result<QueueDepth>;

    /// Removes the entry and marks its record `synced` when no other entries
    /// for the record remain. A second call for the same entry is a no-op.
    async fn mark_delivered(&self, entry_id: String) -> Result<()>;

    async fn schedule_retry(
        &self,
        entry_id: String,
        retry_count: i32,
        next_retry_at: i64,
        error: String,
        error_code: String,
    ) -> Result<()>;

    async fn mark_dead(&self, entry_id: String, error: String, error_code: String) -> Result<()>;

    async fn mark_conflict(&self, table: EntityTable, record_id: String) -> Result<()>;

    /// Settles a conflict on `entry_id` with `settle_conflict`, reading the
    /// local row inside the same transaction that stores the result.
    ///
    /// Returns the rewritten entry when the resolved record still has to be
    /// delivered upstream; otherwise the entry is removed and `None` returned.
    async fn resolve_entry_conflict(
        &self,
        entry_id: String,
        remote: SyncableRecord,
        strategy: ConflictStrategy,
        now_ms: i64,
    ) -> Result<Option<SyncQueueEntry>>;

    /// Moves a dead entry back to pending with a fresh retry budget.
    async fn requeue_dead(&self, entry_id: String) -> Result<bool>;

    async fn discard_dead(&self, entry_id: String) -> Result<bool>;

    fn get_engine_status(&self) -> Result<SyncEngineStatus>;

    async fn record_pass_outcome(
        &self,
        result: SyncPassResult,
        error: Option<String>,
    ) -> Result<()>;
}

/// The upstream system of record.
#[async_trait]
pub trait RemoteAuthorityTrait: Send + Sync {
    /// Sends one queue entry. Must be idempotent on `entry.id`.
    async fn deliver(
        &self,
        entry: &SyncQueueEntry,
    ) -> std::result::Result<DeliveryOutcome, DeliveryError>;

    /// Cheap reachability check.
    async fn probe(&self) -> bool;
}
