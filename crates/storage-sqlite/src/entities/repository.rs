use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use dairysync_core::entities::{
    EntityRepositoryTrait, EntityTable, FieldBag, RecordQuery, SyncStatus, SyncableRecord,
};
use dairysync_core::errors::{Error, Result};
use dairysync_core::sync::{QueueWriteRequest, RecordDelta, SyncMutation};
use dairysync_core::utils::ids::new_record_id;
use dairysync_core::utils::time_utils::now_millis;

use super::model::EntityRowDB;
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::sync::write_queue_entry;

const ENTITY_COLUMNS: &str = "id, center_id, data, last_modified, is_deleted, sync_status";

fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

pub fn load_record(
    conn: &mut SqliteConnection,
    table: EntityTable,
    id: &str,
) -> Result<Option<SyncableRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?",
        ENTITY_COLUMNS,
        quote_identifier(table.as_str())
    );
    let row = diesel::sql_query(sql)
        .bind::<Text, _>(id)
        .get_result::<EntityRowDB>(conn)
        .optional()
        .map_err(StorageError::from)?;
    row.map(EntityRowDB::into_record).transpose()
}

fn load_rows(
    conn: &mut SqliteConnection,
    table: EntityTable,
    center_id: Option<&str>,
    include_deleted: bool,
) -> Result<Vec<SyncableRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE (? IS NULL OR center_id = ?) AND (? OR is_deleted = 0)",
        ENTITY_COLUMNS,
        quote_identifier(table.as_str())
    );
    let rows = diesel::sql_query(sql)
        .bind::<Nullable<Text>, _>(center_id)
        .bind::<Nullable<Text>, _>(center_id)
        .bind::<Bool, _>(include_deleted)
        .load::<EntityRowDB>(conn)
        .map_err(StorageError::from)?;
    rows.into_iter().map(EntityRowDB::into_record).collect()
}

/// Upserts the full row for `record`.
pub fn save_record(
    conn: &mut SqliteConnection,
    table: EntityTable,
    record: &SyncableRecord,
) -> Result<()> {
    let row = EntityRowDB::from_record(record)?;
    let sql = format!(
        "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
         center_id = excluded.center_id, \
         data = excluded.data, \
         last_modified = excluded.last_modified, \
         is_deleted = excluded.is_deleted, \
         sync_status = excluded.sync_status",
        quote_identifier(table.as_str()),
        ENTITY_COLUMNS
    );
    diesel::sql_query(sql)
        .bind::<Text, _>(row.id)
        .bind::<Text, _>(row.center_id)
        .bind::<Text, _>(row.data)
        .bind::<BigInt, _>(row.last_modified)
        .bind::<Bool, _>(row.is_deleted)
        .bind::<Text, _>(row.sync_status)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

/// Moves a record's sync status without touching its fields or `lastModified`.
pub fn set_sync_status(
    conn: &mut SqliteConnection,
    table: EntityTable,
    id: &str,
    status: SyncStatus,
) -> Result<usize> {
    let sql = format!(
        "UPDATE {} SET sync_status = ? WHERE id = ?",
        quote_identifier(table.as_str())
    );
    let updated = diesel::sql_query(sql)
        .bind::<Text, _>(status.as_str())
        .bind::<Text, _>(id)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(updated)
}

fn delete_row(conn: &mut SqliteConnection, table: EntityTable, id: &str) -> Result<usize> {
    let sql = format!("DELETE FROM {} WHERE id = ?", quote_identifier(table.as_str()));
    let deleted = diesel::sql_query(sql)
        .bind::<Text, _>(id)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(deleted)
}

fn require_record(
    conn: &mut SqliteConnection,
    table: EntityTable,
    id: &str,
) -> Result<SyncableRecord> {
    load_record(conn, table, id)?
        .ok_or_else(|| Error::not_found(format!("{} '{}' does not exist", table, id)))
}

pub struct EntityRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl EntityRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        EntityRepository { pool, writer }
    }
}

#[async_trait]
impl EntityRepositoryTrait for EntityRepository {
    async fn put(&self, table: EntityTable, record: SyncableRecord) -> Result<SyncableRecord> {
        if record.id.trim().is_empty() {
            return Err(Error::validation("Record id must not be empty"));
        }
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<SyncableRecord> {
                let mut stored = match load_record(conn, table, &record.id)? {
                    Some(mut existing) => {
                        existing.merge_fields(&record.fields);
                        existing.is_deleted = record.is_deleted;
                        existing
                    }
                    None => record,
                };
                stored.stamp_local_write(now_millis());
                save_record(conn, table, &stored)?;
                Ok(stored)
            })
            .await
    }

    fn query(&self, table: EntityTable, query: &RecordQuery) -> Result<Vec<SyncableRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = load_rows(
            &mut conn,
            table,
            query.center_id.as_deref(),
            query.include_deleted,
        )?;
        Ok(query.apply(rows))
    }

    fn get_by_id(&self, table: EntityTable, id: &str) -> Result<Option<SyncableRecord>> {
        let mut conn = get_connection(&self.pool)?;
        load_record(&mut conn, table, id)
    }

    async fn remove(&self, table: EntityTable, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.writer
            .exec(move |conn| Ok(delete_row(conn, table, &id)? > 0))
            .await
    }

    async fn create_with_sync(
        &self,
        table: EntityTable,
        center_id: String,
        fields: FieldBag,
    ) -> Result<SyncableRecord> {
        if center_id.trim().is_empty() {
            return Err(Error::validation("centerId must not be empty"));
        }
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<SyncableRecord> {
                let mut record = SyncableRecord::new(new_record_id(), center_id, fields);
                record.stamp_local_write(now_millis());
                save_record(conn, table, &record)?;
                write_queue_entry(
                    conn,
                    QueueWriteRequest::new(
                        table,
                        SyncMutation::Create {
                            record: record.clone(),
                        },
                        None,
                        record.last_modified,
                    ),
                )?;
                Ok(record)
            })
            .await
    }

    async fn update_with_sync(
        &self,
        table: EntityTable,
        id: &str,
        delta: RecordDelta,
    ) -> Result<()> {
        let id = id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                let mut record = require_record(conn, table, &id)?;
                if record.is_deleted {
                    return Err(Error::validation(format!(
                        "{} '{}' has been deleted",
                        table, id
                    )));
                }
                let base_last_modified = record.last_modified;
                delta.apply_to(&mut record.fields);
                record.stamp_local_write(now_millis());
                save_record(conn, table, &record)?;
                write_queue_entry(
                    conn,
                    QueueWriteRequest::new(
                        table,
                        SyncMutation::Update {
                            id: id.clone(),
                            changes: delta,
                        },
                        Some(base_last_modified),
                        record.last_modified,
                    ),
                )?;
                Ok(())
            })
            .await
    }

    async fn delete_with_sync(&self, table: EntityTable, id: &str) -> Result<()> {
        let id = id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                let mut record = require_record(conn, table, &id)?;
                if record.is_deleted {
                    return Ok(());
                }
                let base_last_modified = record.last_modified;
                record.is_deleted = true;
                record.stamp_local_write(now_millis());
                save_record(conn, table, &record)?;
                write_queue_entry(
                    conn,
                    QueueWriteRequest::new(
                        table,
                        SyncMutation::Delete { id: id.clone() },
                        Some(base_last_modified),
                        record.last_modified,
                    ),
                )?;
                Ok(())
            })
            .await
    }
}
