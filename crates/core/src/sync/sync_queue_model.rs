//! Sync queue domain models: typed mutations, queue entries and pass results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::entities::{is_reserved_field, EntityTable, FieldBag, SyncableRecord};
use crate::utils::time_utils::now_millis;

/// Supported sync operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Queue entry lifecycle. Delivered entries are deleted, so there is no "sent" state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    #[default]
    Pending,
    Dead,
}

/// Explicit field delta for updates.
///
/// A field in `set` overwrites, a field in `clear` becomes JSON `null`, and any
/// field in neither is left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDelta {
    #[serde(default)]
    pub set: FieldBag,
    #[serde(default)]
    pub clear: BTreeSet<String>,
}

impl RecordDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        self.clear.remove(&field);
        self.set.insert(field, value.into());
        self
    }

    pub fn clear(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.set.remove(&field);
        self.clear.insert(field);
        self
    }

    /// Builds a delta from a partial object. Explicit `null` values become clears.
    pub fn from_partial(partial: FieldBag) -> Self {
        partial
            .into_iter()
            .filter(|(key, _)| !is_reserved_field(key))
            .fold(Self::new(), |delta, (key, value)| {
                if value.is_null() {
                    delta.clear(key)
                } else {
                    delta.set(key, value)
                }
            })
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.clear.is_empty()
    }

    pub fn apply_to(&self, fields: &mut FieldBag) {
        for (key, value) in &self.set {
            if is_reserved_field(key) {
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }
        for key in &self.clear {
            if is_reserved_field(key) {
                continue;
            }
            fields.insert(key.clone(), Value::Null);
        }
    }

    /// Full-state delta used when a resolved record is pushed back upstream.
    pub fn from_record(record: &SyncableRecord) -> Self {
        Self {
            set: record.fields.clone(),
            clear: BTreeSet::new(),
        }
    }
}

/// Queue payload as a tagged union, so a delete can never carry domain fields
/// and an update always carries an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncMutation {
    Create { record: SyncableRecord },
    Update { id: String, changes: RecordDelta },
    Delete { id: String },
}

impl SyncMutation {
    pub fn record_id(&self) -> &str {
        match self {
            SyncMutation::Create { record } => &record.id,
            SyncMutation::Update { id, .. } | SyncMutation::Delete { id } => id,
        }
    }

    pub fn operation(&self) -> SyncOperation {
        match self {
            SyncMutation::Create { .. } => SyncOperation::Create,
            SyncMutation::Update { .. } => SyncOperation::Update,
            SyncMutation::Delete { .. } => SyncOperation::Delete,
        }
    }
}

/// A pending mutation waiting for confirmation from the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    pub id: String,
    pub table: EntityTable,
    pub mutation: SyncMutation,
    /// `lastModified` of the record version this mutation was based on.
    pub base_last_modified: Option<i64>,
    /// `lastModified` the mutation stamped on the record.
    pub last_modified: i64,
    /// Enqueue time in ms. Queue order is FIFO by this value.
    pub timestamp: i64,
    pub status: QueueEntryStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
}

impl SyncQueueEntry {
    pub fn record_id(&self) -> &str {
        self.mutation.record_id()
    }

    pub fn operation(&self) -> SyncOperation {
        self.mutation.operation()
    }

    /// Whether backoff allows another delivery attempt at `now_ms`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.status == QueueEntryStatus::Pending
            && self.next_retry_at.map(|at| at <= now_ms).unwrap_or(true)
    }
}

/// Request to append a queue entry inside a storage transaction.
#[derive(Debug, Clone)]
pub struct QueueWriteRequest {
    pub entry_id: Option<String>,
    pub table: EntityTable,
    pub mutation: SyncMutation,
    pub base_last_modified: Option<i64>,
    pub last_modified: i64,
    pub timestamp: i64,
}

impl QueueWriteRequest {
    pub fn new(
        table: EntityTable,
        mutation: SyncMutation,
        base_last_modified: Option<i64>,
        last_modified: i64,
    ) -> Self {
        Self {
            entry_id: None,
            table,
            mutation,
            base_last_modified,
            last_modified,
            timestamp: now_millis(),
        }
    }
}

/// Result of one delivery attempt the remote authority accepted or contested.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Applied,
    /// The remote copy changed after the entry's base version.
    Conflict { remote: SyncableRecord },
}

/// Trigger source for drain passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPassTrigger {
    Startup,
    Periodic,
    ConnectivityRestored,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPassStatus {
    /// Every entry in the snapshot was delivered or resolved.
    Ok,
    /// Some entries failed, were deferred or dead-lettered.
    Partial,
    /// Skipped because the remote authority is unreachable.
    Offline,
    /// Skipped because another pass is draining.
    InProgress,
    /// Aborted by a local storage failure.
    Error,
}

impl SyncPassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPassStatus::Ok => "ok",
            SyncPassStatus::Partial => "partial",
            SyncPassStatus::Offline => "offline",
            SyncPassStatus::InProgress => "in_progress",
            SyncPassStatus::Error => "error",
        }
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPassResult {
    pub status: SyncPassStatus,
    pub processed: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub duration_ms: i64,
}

impl SyncPassResult {
    pub fn skipped(status: SyncPassStatus) -> Self {
        Self {
            status,
            processed: 0,
            failed: 0,
            conflicts: 0,
            dead_lettered: 0,
            deferred: 0,
            duration_ms: 0,
        }
    }
}

/// Persisted engine status, for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEngineStatus {
    pub last_pass_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub last_pass_status: Option<String>,
    pub last_pass_duration_ms: Option<i64>,
    pub pending_entries: i64,
    pub dead_entries: i64,
}
