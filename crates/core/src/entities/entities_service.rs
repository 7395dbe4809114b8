use log::debug;
use std::sync::Arc;

use super::entities_model::{EntityTable, FieldBag, SyncableRecord};
use super::entities_query::RecordQuery;
use super::entities_traits::EntityRepositoryTrait;
use super::entities_typed::SyncEntity;
use crate::errors::{Error, Result};
use crate::sync::RecordDelta;

/// Front door for UI writes: stamps the configured center and validates input
/// before handing off to the repository.
pub struct EntityService {
    repository: Arc<dyn EntityRepositoryTrait>,
    center_id: String,
}

impl EntityService {
    pub fn new(repository: Arc<dyn EntityRepositoryTrait>, center_id: impl Into<String>) -> Self {
        Self {
            repository,
            center_id: center_id.into(),
        }
    }

    pub fn center_id(&self) -> &str {
        &self.center_id
    }

    pub fn query(&self, table: EntityTable, query: &RecordQuery) -> Result<Vec<SyncableRecord>> {
        self.repository.query(table, query)
    }

    pub fn get_by_id(&self, table: EntityTable, id: &str) -> Result<Option<SyncableRecord>> {
        self.repository.get_by_id(table, id)
    }

    pub async fn create_with_sync(
        &self,
        table: EntityTable,
        fields: FieldBag,
    ) -> Result<SyncableRecord> {
        let record = self
            .repository
            .create_with_sync(table, self.center_id.clone(), fields)
            .await?;
        debug!("[Entities] Created {} '{}'", table, record.id);
        Ok(record)
    }

    pub async fn update_with_sync(
        &self,
        table: EntityTable,
        id: &str,
        delta: RecordDelta,
    ) -> Result<()> {
        if delta.is_empty() {
            return Err(Error::validation("Update carries no field changes"));
        }
        self.repository.update_with_sync(table, id, delta).await?;
        debug!("[Entities] Updated {} '{}'", table, id);
        Ok(())
    }

    pub async fn delete_with_sync(&self, table: EntityTable, id: &str) -> Result<()> {
        self.repository.delete_with_sync(table, id).await?;
        debug!("[Entities] Deleted {} '{}'", table, id);
        Ok(())
    }

    pub async fn create_entity<T: SyncEntity>(&self, entity: &T) -> Result<SyncableRecord> {
        self.create_with_sync(T::TABLE, entity.to_fields()?).await
    }

    pub fn get_entity<T: SyncEntity>(&self, id: &str) -> Result<Option<T>> {
        match self.repository.get_by_id(T::TABLE, id)? {
            Some(record) if !record.is_deleted => T::from_record(&record).map(Some),
            _ => Ok(None),
        }
    }
}
