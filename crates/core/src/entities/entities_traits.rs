use async_trait::async_trait;

use super::entities_model::{EntityTable, FieldBag, SyncableRecord};
use super::entities_query::RecordQuery;
use crate::errors::Result;
use crate::sync::RecordDelta;

/// Local entity store. Reads never touch the network; writes go through the
/// serialized storage writer.
#[async_trait]
pub trait EntityRepositoryTrait: Send + Sync {
    /// Upsert by id with field-bag merge. Restamps `lastModified` and sets `pending`.
    /// Does not enqueue.
    async fn put(&self, table: EntityTable, record: SyncableRecord) -> Result<SyncableRecord>;

    fn query(&self, table: EntityTable, query: &RecordQuery) -> Result<Vec<SyncableRecord>>;

    fn get_by_id(&self, table: EntityTable, id: &str) -> Result<Option<SyncableRecord>>;

    /// Hard delete for local-only cleanup. Returns whether a row was removed.
    async fn remove(&self, table: EntityTable, id: &str) -> Result<bool>;

    /// Inserts a new record and appends a `Create` queue entry in one transaction.
    async fn create_with_sync(
        &self,
        table: EntityTable,
        center_id: String,
        fields: FieldBag,
    ) -> Result<SyncableRecord>;

    /// Applies `delta` to an existing record and appends an `Update` queue entry.
    async fn update_with_sync(&self, table: EntityTable, id: &str, delta: RecordDelta)
        -> Result<()>;

    /// Tombstones a record and appends a `Delete` queue entry.
    async fn delete_with_sync(&self, table: EntityTable, id: &str) -> Result<()>;
}
