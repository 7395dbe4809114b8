//! Conflict detection and resolution between local and remote record versions.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::sync_queue_model::{RecordDelta, SyncMutation, SyncQueueEntry};
use crate::entities::{next_last_modified, SyncStatus, SyncableRecord};
use crate::errors::{Error, Result};

/// How a detected conflict is settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Local record wins outright; the remote copy is overwritten on the next delivery.
    Client,
    /// Remote record replaces the local one verbatim.
    Server,
    /// Shallow field merge with local precedence.
    #[default]
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Client => "client",
            ConflictStrategy::Server => "server",
            ConflictStrategy::Merge => "merge",
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(ConflictStrategy::Client),
            "server" => Ok(ConflictStrategy::Server),
            "merge" => Ok(ConflictStrategy::Merge),
            other => Err(Error::validation(format!(
                "Unknown conflict strategy '{}'",
                other
            ))),
        }
    }
}

/// Outcome of `resolve_conflict`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    /// Record to store locally.
    pub record: SyncableRecord,
    /// Whether the resolved record still has to be delivered upstream.
    pub push_upstream: bool,
}

/// True when the remote copy was modified after the version a mutation was based on.
///
/// A mutation with no base version (a create) conflicts with any existing remote copy.
pub fn is_remote_newer(base_last_modified: Option<i64>, remote: &SyncableRecord) -> bool {
    match base_last_modified {
        Some(base) => remote.last_modified > base,
        None => true,
    }
}

/// True when the remote copy already reflects the local version, e.g. after a
/// delivery whose acknowledgement was lost and is now being replayed.
pub fn remote_matches_local(local: &SyncableRecord, remote: &SyncableRecord) -> bool {
    local.id == remote.id
        && local.last_modified == remote.last_modified
        && local.is_deleted == remote.is_deleted
        && local.fields == remote.fields
}

/// Settles a conflict between `local` and `remote`.
///
/// Pure: the result depends only on the arguments. `now_ms` is the merge time
/// stamped by the `merge` strategy.
pub fn resolve_conflict(
    local: &SyncableRecord,
    remote: &SyncableRecord,
    strategy: ConflictStrategy,
    now_ms: i64,
) -> ConflictResolution {
    match strategy {
        ConflictStrategy::Client => {
            let mut record = local.clone();
            record.sync_status = SyncStatus::Pending;
            ConflictResolution {
                strategy,
                record,
                push_upstream: true,
            }
        }
        ConflictStrategy::Server => {
            let mut record = remote.clone();
            record.id = local.id.clone();
            record.sync_status = SyncStatus::Synced;
            ConflictResolution {
                strategy,
                record,
                push_upstream: false,
            }
        }
        ConflictStrategy::Merge => {
            let mut fields = remote.fields.clone();
            for (key, value) in &local.fields {
                fields.insert(key.clone(), value.clone());
            }
            let record = SyncableRecord {
                id: local.id.clone(),
                center_id: local.center_id.clone(),
                last_modified: now_ms,
                is_deleted: local.is_deleted,
                sync_status: SyncStatus::Synced,
                fields,
            };
            ConflictResolution {
                strategy,
                record,
                push_upstream: true,
            }
        }
    }
}

/// Settles a conflict against the local row as currently stored.
///
/// `local` must be read in the same storage transaction that applies the
/// result. When the remote copy is adopted, the mutations still queued behind
/// the conflicting entry are replayed on top of it so a local write made while
/// the conflict was in flight stays visible until it is delivered.
pub fn settle_conflict(
    local: Option<&SyncableRecord>,
    remote: &SyncableRecord,
    queued_after: &[SyncQueueEntry],
    strategy: ConflictStrategy,
    now_ms: i64,
) -> ConflictResolution {
    let mut resolution = match local {
        Some(local) => {
            let merged_at =
                next_last_modified(local.last_modified.max(remote.last_modified), now_ms);
            resolve_conflict(local, remote, strategy, merged_at)
        }
        // Purged locally: nothing left to defend.
        None => ConflictResolution {
            strategy,
            record: remote.clone(),
            push_upstream: false,
        },
    };

    if resolution.push_upstream {
        resolution.record.sync_status = SyncStatus::Pending;
        return resolution;
    }

    for entry in queued_after {
        replay_mutation(&mut resolution.record, entry);
    }
    resolution.record.sync_status = if queued_after.is_empty() {
        SyncStatus::Synced
    } else {
        SyncStatus::Pending
    };
    resolution
}

fn replay_mutation(record: &mut SyncableRecord, entry: &SyncQueueEntry) {
    match &entry.mutation {
        SyncMutation::Create { record: created } => record.merge_fields(&created.fields),
        SyncMutation::Update { changes, .. } => changes.apply_to(&mut record.fields),
        SyncMutation::Delete { .. } => record.is_deleted = true,
    }
    record.last_modified = record.last_modified.max(entry.last_modified);
}

/// Mutation that pushes a resolved record upstream in full.
pub fn rebased_mutation(record: &SyncableRecord) -> SyncMutation {
    if record.is_deleted {
        SyncMutation::Delete {
            id: record.id.clone(),
        }
    } else {
        SyncMutation::Update {
            id: record.id.clone(),
            changes: RecordDelta::from_record(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(last_modified: i64, fields: serde_json::Value) -> SyncableRecord {
        let mut record =
            SyncableRecord::new("p-1", "center-a", fields.as_object().cloned().unwrap());
        record.last_modified = last_modified;
        record
    }

    #[test]
    fn merge_prefers_local_fields_and_marks_synced() {
        let local = record(100, json!({ "price": 10, "stock": 5 }));
        let remote = record(200, json!({ "price": 12, "stock": 8 }));

        let resolved = resolve_conflict(&local, &remote, ConflictStrategy::Merge, 300);
        assert_eq!(resolved.record.fields["price"], 10);
        assert_eq!(resolved.record.fields["stock"], 5);
        assert_eq!(resolved.record.sync_status, SyncStatus::Synced);
        assert_eq!(resolved.record.last_modified, 300);
        assert!(resolved.push_upstream);
    }

    #[test]
    fn merge_keeps_remote_only_fields() {
        let local = record(100, json!({ "price": 10 }));
        let remote = record(200, json!({ "price": 12, "unit": "litre" }));

        let resolved = resolve_conflict(&local, &remote, ConflictStrategy::Merge, 300);
        assert_eq!(resolved.record.fields["price"], 10);
        assert_eq!(resolved.record.fields["unit"], "litre");
    }

    #[test]
    fn server_strategy_takes_remote_verbatim() {
        let local = record(100, json!({ "price": 10, "stock": 5 }));
        let remote = record(200, json!({ "price": 12 }));

        let resolved = resolve_conflict(&local, &remote, ConflictStrategy::Server, 300);
        assert_eq!(resolved.record.fields, remote.fields);
        assert_eq!(resolved.record.last_modified, 200);
        assert_eq!(resolved.record.sync_status, SyncStatus::Synced);
        assert!(!resolved.push_upstream);
    }

    #[test]
    fn client_strategy_keeps_local_and_stays_pending() {
        let local = record(100, json!({ "price": 10 }));
        let remote = record(200, json!({ "price": 12 }));

        let resolved = resolve_conflict(&local, &remote, ConflictStrategy::Client, 300);
        assert_eq!(resolved.record.fields, local.fields);
        assert_eq!(resolved.record.sync_status, SyncStatus::Pending);
        assert!(resolved.push_upstream);
    }

    #[test]
    fn resolution_is_deterministic() {
        let local = record(100, json!({ "price": 10, "stock": 5 }));
        let remote = record(200, json!({ "price": 12, "stock": 8, "unit": "kg" }));
        for strategy in [
            ConflictStrategy::Client,
            ConflictStrategy::Server,
            ConflictStrategy::Merge,
        ] {
            let first = resolve_conflict(&local, &remote, strategy, 500);
            let second = resolve_conflict(&local, &remote, strategy, 500);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn remote_newer_uses_base_version() {
        let remote = record(200, json!({}));
        assert!(is_remote_newer(Some(100), &remote));
        assert!(!is_remote_newer(Some(200), &remote));
        assert!(is_remote_newer(None, &remote));
    }

    fn queued_update(last_modified: i64, changes: RecordDelta) -> SyncQueueEntry {
        SyncQueueEntry {
            id: format!("e-{}", last_modified),
            table: crate::entities::EntityTable::Products,
            mutation: SyncMutation::Update {
                id: "p-1".to_string(),
                changes,
            },
            base_last_modified: Some(last_modified - 1),
            last_modified,
            timestamp: last_modified,
            status: crate::sync::QueueEntryStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            last_error_code: None,
        }
    }

    #[test]
    fn settle_merges_from_the_current_local_row() {
        let local = record(150, json!({ "price": 10, "note": "typed during sync" }));
        let remote = record(200, json!({ "price": 12, "stock": 8 }));

        let settled = settle_conflict(Some(&local), &remote, &[], ConflictStrategy::Merge, 100);
        assert!(settled.push_upstream);
        assert_eq!(settled.record.fields["note"], "typed during sync");
        assert_eq!(settled.record.fields["stock"], 8);
        assert_eq!(settled.record.sync_status, SyncStatus::Pending);
        assert_eq!(settled.record.last_modified, 201);
    }

    #[test]
    fn adopted_remote_keeps_later_queued_writes() {
        let local = record(150, json!({ "price": 10, "note": "typed during sync" }));
        let remote = record(200, json!({ "price": 12 }));
        let later = queued_update(150, RecordDelta::new().set("note", "typed during sync"));

        let settled = settle_conflict(
            Some(&local),
            &remote,
            std::slice::from_ref(&later),
            ConflictStrategy::Server,
            300,
        );
        assert!(!settled.push_upstream);
        assert_eq!(settled.record.fields["price"], 12);
        assert_eq!(settled.record.fields["note"], "typed during sync");
        assert_eq!(settled.record.last_modified, 200);
        assert_eq!(settled.record.sync_status, SyncStatus::Pending);

        let alone = settle_conflict(Some(&local), &remote, &[], ConflictStrategy::Server, 300);
        assert_eq!(alone.record.fields, remote.fields);
        assert_eq!(alone.record.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn purged_local_adopts_remote() {
        let remote = record(200, json!({ "price": 12 }));
        let settled = settle_conflict(None, &remote, &[], ConflictStrategy::Client, 300);
        assert!(!settled.push_upstream);
        assert_eq!(settled.record.fields, remote.fields);
        assert_eq!(settled.record.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn rebased_mutation_tombstones_deleted_records() {
        let mut deleted = record(100, json!({ "price": 10 }));
        deleted.is_deleted = true;
        assert_eq!(
            rebased_mutation(&deleted),
            SyncMutation::Delete {
                id: "p-1".to_string()
            }
        );
        assert!(matches!(
            rebased_mutation(&record(100, json!({ "price": 10 }))),
            SyncMutation::Update { .. }
        ));
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!(" Merge ".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::Merge);
        assert!("newest".parse::<ConflictStrategy>().is_err());
    }
}
