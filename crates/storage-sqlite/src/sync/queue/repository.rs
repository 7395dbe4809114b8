//! Repository for the sync queue and engine state.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use dairysync_core::entities::{EntityTable, SyncStatus, SyncableRecord};
use dairysync_core::errors::{Error, Result};
use dairysync_core::sync::{
    rebased_mutation, settle_conflict, ConflictStrategy, QueueDepth, QueueEntryStatus,
    QueueWriteRequest, SyncEngineStatus, SyncPassResult, SyncQueueEntry, SyncQueueRepositoryTrait,
};
use dairysync_core::utils::ids::new_entry_id;
use dairysync_core::utils::time_utils::now_millis;

use super::model::{NewSyncQueueEntryDB, SyncEngineStateDB, SyncQueueEntryDB};
use crate::db::{enum_from_db, enum_to_db, get_connection, DbPool, WriteHandle};
use crate::entities::{load_record, save_record, set_sync_status};
use crate::errors::StorageError;
use crate::schema::{sync_engine_state, sync_queue};

const ENGINE_STATE_ID: i32 = 1;

/// Appends a queue entry on `conn`. Call it inside the writer transaction that
/// changes the record, so the record and its entry commit or roll back together.
pub fn write_queue_entry(conn: &mut SqliteConnection, request: QueueWriteRequest) -> Result<String> {
    let entry_id = request.entry_id.unwrap_or_else(new_entry_id);
    let row = NewSyncQueueEntryDB {
        id: entry_id.clone(),
        entity_table: request.table.as_str().to_string(),
        record_id: request.mutation.record_id().to_string(),
        operation: enum_to_db(&request.mutation.operation())?,
        payload: serde_json::to_string(&request.mutation)?,
        base_last_modified: request.base_last_modified,
        last_modified: request.last_modified,
        enqueued_at: request.timestamp,
        status: enum_to_db(&QueueEntryStatus::Pending)?,
        retry_count: 0,
    };

    diesel::insert_into(sync_queue::table)
        .values(&row)
        .execute(conn)
        .map_err(StorageError::from)?;

    Ok(entry_id)
}

fn to_queue_entry(row: SyncQueueEntryDB) -> Result<SyncQueueEntry> {
    Ok(SyncQueueEntry {
        id: row.id,
        table: row.entity_table.parse()?,
        mutation: serde_json::from_str(&row.payload)?,
        base_last_modified: row.base_last_modified,
        last_modified: row.last_modified,
        timestamp: row.enqueued_at,
        status: enum_from_db(&row.status)?,
        retry_count: row.retry_count,
        next_retry_at: row.next_retry_at,
        last_error: row.last_error,
        last_error_code: row.last_error_code,
    })
}

fn load_entry_row(conn: &mut SqliteConnection, entry_id: &str) -> Result<Option<SyncQueueEntryDB>> {
    let row = sync_queue::table
        .filter(sync_queue::id.eq(entry_id))
        .select(SyncQueueEntryDB::as_select())
        .first::<SyncQueueEntryDB>(conn)
        .optional()
        .map_err(StorageError::from)?;
    Ok(row)
}

fn require_entry_row(conn: &mut SqliteConnection, entry_id: &str) -> Result<SyncQueueEntryDB> {
    load_entry_row(conn, entry_id)?
        .ok_or_else(|| Error::not_found(format!("Queue entry '{}' does not exist", entry_id)))
}

fn delete_entry_row(conn: &mut SqliteConnection, entry_id: &str) -> Result<usize> {
    let deleted = diesel::delete(sync_queue::table.filter(sync_queue::id.eq(entry_id)))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(deleted)
}

fn count_entries_for_record(
    conn: &mut SqliteConnection,
    table: &str,
    record_id: &str,
) -> Result<i64> {
    let count = sync_queue::table
        .filter(sync_queue::entity_table.eq(table))
        .filter(sync_queue::record_id.eq(record_id))
        .count()
        .get_result::<i64>(conn)
        .map_err(StorageError::from)?;
    Ok(count)
}

/// Every entry for one record, oldest first.
fn load_entries_for_record(
    conn: &mut SqliteConnection,
    table: &str,
    record_id: &str,
) -> Result<Vec<SyncQueueEntryDB>> {
    let rows = sync_queue::table
        .filter(sync_queue::entity_table.eq(table))
        .filter(sync_queue::record_id.eq(record_id))
        .order((sync_queue::enqueued_at.asc(), sync_queue::seq.asc()))
        .select(SyncQueueEntryDB::as_select())
        .load::<SyncQueueEntryDB>(conn)
        .map_err(StorageError::from)?;
    Ok(rows)
}

fn count_by_status(conn: &mut SqliteConnection, status: QueueEntryStatus) -> Result<i64> {
    let count = sync_queue::table
        .filter(sync_queue::status.eq(enum_to_db(&status)?))
        .count()
        .get_result::<i64>(conn)
        .map_err(StorageError::from)?;
    Ok(count)
}

fn ensure_updated(updated: usize, entry_id: &str) -> Result<()> {
    if updated == 0 {
        return Err(Error::not_found(format!(
            "Queue entry '{}' does not exist",
            entry_id
        )));
    }
    Ok(())
}

pub struct SyncQueueRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SyncQueueRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    fn list_by_status(&self, status: QueueEntryStatus) -> Result<Vec<SyncQueueEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_queue::table
            .filter(sync_queue::status.eq(enum_to_db(&status)?))
            .order((sync_queue::enqueued_at.asc(), sync_queue::seq.asc()))
            .select(SyncQueueEntryDB::as_select())
            .load::<SyncQueueEntryDB>(&mut conn)
            .map_err(StorageError::from)?;

        rows.into_iter().map(to_queue_entry).collect()
    }
}

#[async_trait]
impl SyncQueueRepositoryTrait for SyncQueueRepository {
    fn list_pending(&self) -> Result<Vec<SyncQueueEntry>> {
        self.list_by_status(QueueEntryStatus::Pending)
    }

    fn list_dead(&self) -> Result<Vec<SyncQueueEntry>> {
        self.list_by_status(QueueEntryStatus::Dead)
    }

    fn get_entry(&self, entry_id: &str) -> Result<Option<SyncQueueEntry>> {
        let mut conn = get_connection(&self.pool)?;
        load_entry_row(&mut conn, entry_id)?
            .map(to_queue_entry)
            .transpose()
    }

    fn queue_depth(&self) -> Result<QueueDepth> {
        let mut conn = get_connection(&self.pool)?;
        Ok(QueueDepth {
            pending: count_by_status(&mut conn, QueueEntryStatus::Pending)?,
            dead: count_by_status(&mut conn, QueueEntryStatus::Dead)?,
        })
    }

    async fn mark_delivered(&self, entry_id: String) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let Some(row) = load_entry_row(conn, &entry_id)? else {
                    return Ok(());
                };
                delete_entry_row(conn, &row.id)?;
                if count_entries_for_record(conn, &row.entity_table, &row.record_id)? == 0 {
                    let table: EntityTable = row.entity_table.parse()?;
                    set_sync_status(conn, table, &row.record_id, SyncStatus::Synced)?;
                }
                Ok(())
            })
            .await
    }

    async fn schedule_retry(
        &self,
        entry_id: String,
        retry_count: i32,
        next_retry_at: i64,
        error: String,
        error_code: String,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let updated = diesel::update(sync_queue::table.filter(sync_queue::id.eq(&entry_id)))
                    .set((
                        sync_queue::retry_count.eq(retry_count),
                        sync_queue::next_retry_at.eq(Some(next_retry_at)),
                        sync_queue::status.eq(enum_to_db(&QueueEntryStatus::Pending)?),
                        sync_queue::last_error.eq(Some(error)),
                        sync_queue::last_error_code.eq(Some(error_code)),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                ensure_updated(updated, &entry_id)
            })
            .await
    }

    async fn mark_dead(&self, entry_id: String, error: String, error_code: String) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let updated = diesel::update(sync_queue::table.filter(sync_queue::id.eq(&entry_id)))
                    .set((
                        sync_queue::status.eq(enum_to_db(&QueueEntryStatus::Dead)?),
                        sync_queue::next_retry_at.eq::<Option<i64>>(None),
                        sync_queue::last_error.eq(Some(error)),
                        sync_queue::last_error_code.eq(Some(error_code)),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                ensure_updated(updated, &entry_id)
            })
            .await
    }

    async fn mark_conflict(&self, table: EntityTable, record_id: String) -> Result<()> {
        self.writer
            .exec(move |conn| {
                set_sync_status(conn, table, &record_id, SyncStatus::Conflict)?;
                Ok(())
            })
            .await
    }

    async fn resolve_entry_conflict(
        &self,
        entry_id: String,
        remote: SyncableRecord,
        strategy: ConflictStrategy,
        now_ms: i64,
    ) -> Result<Option<SyncQueueEntry>> {
        self.writer
            .exec(move |conn| {
                let row = require_entry_row(conn, &entry_id)?;
                let table: EntityTable = row.entity_table.parse()?;
                let local = load_record(conn, table, &row.record_id)?;
                let queued_after = load_entries_for_record(conn, &row.entity_table, &row.record_id)?
                    .into_iter()
                    .filter(|other| other.id != row.id)
                    .map(to_queue_entry)
                    .collect::<Result<Vec<_>>>()?;

                let resolution =
                    settle_conflict(local.as_ref(), &remote, &queued_after, strategy, now_ms);
                save_record(conn, table, &resolution.record)?;
                if !resolution.push_upstream {
                    delete_entry_row(conn, &row.id)?;
                    return Ok(None);
                }

                let mutation = rebased_mutation(&resolution.record);
                diesel::update(sync_queue::table.filter(sync_queue::id.eq(&row.id)))
                    .set((
                        sync_queue::operation.eq(enum_to_db(&mutation.operation())?),
                        sync_queue::payload.eq(serde_json::to_string(&mutation)?),
                        sync_queue::base_last_modified.eq(Some(remote.last_modified)),
                        sync_queue::last_modified.eq(resolution.record.last_modified),
                        sync_queue::next_retry_at.eq::<Option<i64>>(None),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;

                to_queue_entry(require_entry_row(conn, &row.id)?).map(Some)
            })
            .await
    }

    async fn requeue_dead(&self, entry_id: String) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                let updated = diesel::update(
                    sync_queue::table
                        .filter(sync_queue::id.eq(&entry_id))
                        .filter(sync_queue::status.eq(enum_to_db(&QueueEntryStatus::Dead)?)),
                )
                .set((
                    sync_queue::status.eq(enum_to_db(&QueueEntryStatus::Pending)?),
                    sync_queue::retry_count.eq(0),
                    sync_queue::next_retry_at.eq::<Option<i64>>(None),
                ))
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(updated > 0)
            })
            .await
    }

    async fn discard_dead(&self, entry_id: String) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                let row = match load_entry_row(conn, &entry_id)? {
                    Some(row) if row.status == enum_to_db(&QueueEntryStatus::Dead)? => row,
                    _ => return Ok(false),
                };
                delete_entry_row(conn, &row.id)?;
                // The local copy never reached the remote; flag it for review.
                if count_entries_for_record(conn, &row.entity_table, &row.record_id)? == 0 {
                    let table: EntityTable = row.entity_table.parse()?;
                    set_sync_status(conn, table, &row.record_id, SyncStatus::Conflict)?;
                }
                Ok(true)
            })
            .await
    }

    fn get_engine_status(&self) -> Result<SyncEngineStatus> {
        let depth = self.queue_depth()?;
        let mut conn = get_connection(&self.pool)?;
        let engine = sync_engine_state::table
            .find(ENGINE_STATE_ID)
            .select(SyncEngineStateDB::as_select())
            .first::<SyncEngineStateDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;

        Ok(SyncEngineStatus {
            last_pass_at: engine.as_ref().and_then(|s| s.last_pass_at),
            last_success_at: engine.as_ref().and_then(|s| s.last_success_at),
            last_error: engine.as_ref().and_then(|s| s.last_error.clone()),
            consecutive_failures: engine.as_ref().map(|s| s.consecutive_failures).unwrap_or(0),
            last_pass_status: engine.as_ref().and_then(|s| s.last_pass_status.clone()),
            last_pass_duration_ms: engine.and_then(|s| s.last_pass_duration_ms),
            pending_entries: depth.pending,
            dead_entries: depth.dead,
        })
    }

    async fn record_pass_outcome(
        &self,
        result: SyncPassResult,
        error: Option<String>,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let now = now_millis();
                let success = error.is_none() && result.failed == 0;
                let existing = sync_engine_state::table
                    .find(ENGINE_STATE_ID)
                    .select(SyncEngineStateDB::as_select())
                    .first::<SyncEngineStateDB>(conn)
                    .optional()
                    .map_err(StorageError::from)?;

                let (last_success_at, consecutive_failures) = match (&existing, success) {
                    (_, true) => (Some(now), 0),
                    (Some(state), false) => (
                        state.last_success_at,
                        state.consecutive_failures.saturating_add(1),
                    ),
                    (None, false) => (None, 1),
                };
                let row = SyncEngineStateDB {
                    id: ENGINE_STATE_ID,
                    last_pass_at: Some(now),
                    last_success_at,
                    last_error: error,
                    consecutive_failures,
                    last_pass_status: Some(result.status.as_str().to_string()),
                    last_pass_duration_ms: Some(result.duration_ms),
                };

                diesel::insert_into(sync_engine_state::table)
                    .values(&row)
                    .on_conflict(sync_engine_state::id)
                    .do_update()
                    .set((
                        sync_engine_state::last_pass_at.eq(row.last_pass_at),
                        sync_engine_state::last_success_at.eq(row.last_success_at),
                        sync_engine_state::last_error.eq(row.last_error.clone()),
                        sync_engine_state::consecutive_failures.eq(row.consecutive_failures),
                        sync_engine_state::last_pass_status.eq(row.last_pass_status.clone()),
                        sync_engine_state::last_pass_duration_ms.eq(row.last_pass_duration_ms),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}
