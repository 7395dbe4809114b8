use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use dairysync_core::errors::{Error, Result};
use dairysync_core::gateway::{
    CachedResponse, GatewayRequest, RequestQueueEntry, RequestQueueRepositoryTrait,
    ResponseCacheRepositoryTrait,
};
use dairysync_core::sync::QueueEntryStatus;
use dairysync_core::utils::ids::new_entry_id;
use dairysync_core::utils::time_utils::now_millis;

use super::model::{CachedResponseDB, NewRequestQueueEntryDB, RequestQueueEntryDB};
use crate::db::{enum_from_db, enum_to_db, get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{request_queue, response_cache};

fn to_cached_response(row: CachedResponseDB) -> Result<CachedResponse> {
    Ok(CachedResponse {
        request_key: row.request_key,
        endpoint: row.endpoint,
        status: u16::try_from(row.status).map_err(|_| {
            Error::Unexpected(format!("Cached status {} is out of range", row.status))
        })?,
        body: serde_json::from_str(&row.body)?,
        cached_at: row.cached_at,
        expires_at: row.expires_at,
    })
}

fn to_request_entry(row: RequestQueueEntryDB) -> Result<RequestQueueEntry> {
    let body = row
        .body
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(RequestQueueEntry {
        id: row.id,
        request_key: row.request_key,
        request: GatewayRequest {
            method: row.method.parse()?,
            endpoint: row.endpoint,
            body,
        },
        enqueued_at: row.enqueued_at,
        status: enum_from_db(&row.status)?,
        retry_count: row.retry_count,
        next_retry_at: row.next_retry_at,
        last_error: row.last_error,
        last_error_code: row.last_error_code,
    })
}

fn find_pending_by_key(
    conn: &mut SqliteConnection,
    request_key: &str,
) -> Result<Option<RequestQueueEntryDB>> {
    let row = request_queue::table
        .filter(request_queue::request_key.eq(request_key))
        .filter(request_queue::status.eq(enum_to_db(&QueueEntryStatus::Pending)?))
        .select(RequestQueueEntryDB::as_select())
        .first::<RequestQueueEntryDB>(conn)
        .optional()
        .map_err(StorageError::from)?;
    Ok(row)
}

fn find_by_id(conn: &mut SqliteConnection, entry_id: &str) -> Result<RequestQueueEntryDB> {
    request_queue::table
        .filter(request_queue::id.eq(entry_id))
        .select(RequestQueueEntryDB::as_select())
        .first::<RequestQueueEntryDB>(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| Error::not_found(format!("Queued request '{}' does not exist", entry_id)))
}

/// Response cache and write queue behind the offline gateway.
pub struct GatewayRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl GatewayRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl ResponseCacheRepositoryTrait for GatewayRepository {
    fn get_cached_response(&self, request_key: &str) -> Result<Option<CachedResponse>> {
        let mut conn = get_connection(&self.pool)?;
        response_cache::table
            .find(request_key)
            .select(CachedResponseDB::as_select())
            .first::<CachedResponseDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(to_cached_response)
            .transpose()
    }

    async fn store_response(&self, response: CachedResponse) -> Result<()> {
        let row = CachedResponseDB {
            request_key: response.request_key,
            endpoint: response.endpoint,
            status: i32::from(response.status),
            body: serde_json::to_string(&response.body)?,
            cached_at: response.cached_at,
            expires_at: response.expires_at,
        };
        self.writer
            .exec(move |conn| {
                diesel::insert_into(response_cache::table)
                    .values(&row)
                    .on_conflict(response_cache::request_key)
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn cleanup_expired(&self, now_ms: i64) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let deleted = diesel::delete(
                    response_cache::table
                        .filter(response_cache::expires_at.is_not_null())
                        .filter(response_cache::expires_at.le(now_ms)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(deleted)
            })
            .await
    }
}

#[async_trait]
impl RequestQueueRepositoryTrait for GatewayRepository {
    async fn enqueue_request(&self, request: GatewayRequest) -> Result<(RequestQueueEntry, bool)> {
        let body = request.body.as_ref().map(serde_json::to_string).transpose()?;
        self.writer
            .exec(move |conn| {
                let request_key = request.request_key();
                if let Some(existing) = find_pending_by_key(conn, &request_key)? {
                    return Ok((to_request_entry(existing)?, false));
                }

                let entry_id = new_entry_id();
                let row = NewRequestQueueEntryDB {
                    id: entry_id.clone(),
                    request_key,
                    method: request.method.as_str().to_string(),
                    endpoint: request.endpoint,
                    body,
                    enqueued_at: now_millis(),
                    status: enum_to_db(&QueueEntryStatus::Pending)?,
                    retry_count: 0,
                };
                diesel::insert_into(request_queue::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;

                Ok((to_request_entry(find_by_id(conn, &entry_id)?)?, true))
            })
            .await
    }

    fn list_pending_requests(&self) -> Result<Vec<RequestQueueEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = request_queue::table
            .filter(request_queue::status.eq(enum_to_db(&QueueEntryStatus::Pending)?))
            .order((request_queue::enqueued_at.asc(), request_queue::seq.asc()))
            .select(RequestQueueEntryDB::as_select())
            .load::<RequestQueueEntryDB>(&mut conn)
            .map_err(StorageError::from)?;

        rows.into_iter().map(to_request_entry).collect()
    }

    async fn mark_request_delivered(&self, entry_id: String) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::delete(request_queue::table.filter(request_queue::id.eq(entry_id)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn schedule_request_retry(
        &self,
        entry_id: String,
        retry_count: i32,
        next_retry_at: i64,
        error: String,
        error_code: String,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                find_by_id(conn, &entry_id)?;
                diesel::update(request_queue::table.filter(request_queue::id.eq(&entry_id)))
                    .set((
                        request_queue::retry_count.eq(retry_count),
                        request_queue::next_retry_at.eq(Some(next_retry_at)),
                        request_queue::last_error.eq(Some(error)),
                        request_queue::last_error_code.eq(Some(error_code)),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn mark_request_dead(
        &self,
        entry_id: String,
        error: String,
        error_code: String,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                find_by_id(conn, &entry_id)?;
                diesel::update(request_queue::table.filter(request_queue::id.eq(&entry_id)))
                    .set((
                        request_queue::status.eq(enum_to_db(&QueueEntryStatus::Dead)?),
                        request_queue::next_retry_at.eq::<Option<i64>>(None),
                        request_queue::last_error.eq(Some(error)),
                        request_queue::last_error_code.eq(Some(error_code)),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}
