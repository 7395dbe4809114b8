//! Row shape shared by every entity table.

use diesel::sql_types::{BigInt, Bool, Text};
use diesel::QueryableByName;

use dairysync_core::entities::{sanitize_fields, FieldBag, SyncableRecord};
use dairysync_core::errors::{Error, Result};

#[derive(QueryableByName, Debug, Clone, PartialEq)]
pub struct EntityRowDB {
    #[diesel(sql_type = Text)]
    pub id: String,
    #[diesel(sql_type = Text)]
    pub center_id: String,
    #[diesel(sql_type = Text)]
    pub data: String,
    #[diesel(sql_type = BigInt)]
    pub last_modified: i64,
    #[diesel(sql_type = Bool)]
    pub is_deleted: bool,
    #[diesel(sql_type = Text)]
    pub sync_status: String,
}

impl EntityRowDB {
    pub fn from_record(record: &SyncableRecord) -> Result<Self> {
        Ok(Self {
            id: record.id.clone(),
            center_id: record.center_id.clone(),
            data: serde_json::to_string(&record.fields)?,
            last_modified: record.last_modified,
            is_deleted: record.is_deleted,
            sync_status: record.sync_status.as_str().to_string(),
        })
    }

    pub fn into_record(self) -> Result<SyncableRecord> {
        let fields: FieldBag = match serde_json::from_str(&self.data)? {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(Error::Unexpected(format!(
                    "Record '{}' holds non-object data: {}",
                    self.id, other
                )))
            }
        };
        Ok(SyncableRecord {
            id: self.id,
            center_id: self.center_id,
            last_modified: self.last_modified,
            is_deleted: self.is_deleted,
            sync_status: self.sync_status.parse()?,
            fields: sanitize_fields(fields),
        })
    }
}
