//! Database rows for the sync queue and engine state.

use diesel::prelude::*;

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(primary_key(seq))]
#[diesel(table_name = crate::schema::sync_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncQueueEntryDB {
    pub seq: i32,
    pub id: String,
    pub entity_table: String,
    pub record_id: String,
    pub operation: String,
    pub payload: String,
    pub base_last_modified: Option<i64>,
    pub last_modified: i64,
    pub enqueued_at: i64,
    pub status: String,
    pub retry_count: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_queue)]
pub struct NewSyncQueueEntryDB {
    pub id: String,
    pub entity_table: String,
    pub record_id: String,
    pub operation: String,
    pub payload: String,
    pub base_last_modified: Option<i64>,
    pub last_modified: i64,
    pub enqueued_at: i64,
    pub status: String,
    pub retry_count: i32,
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_engine_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncEngineStateDB {
    pub id: i32,
    pub last_pass_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub last_pass_status: Option<String>,
    pub last_pass_duration_ms: Option<i64>,
}
