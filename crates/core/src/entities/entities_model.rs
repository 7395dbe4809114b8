//! Syncable record shape shared by every entity table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};

/// Canonical list of local tables that participate in sync.
pub const ENTITY_TABLES: [&str; 6] = [
    "customers",
    "products",
    "orders",
    "invoices",
    "payments",
    "trip_sheets",
];

/// Keys owned by the record envelope. They never live in the field bag.
pub const RESERVED_FIELDS: [&str; 5] = ["id", "centerId", "lastModified", "isDeleted", "syncStatus"];

/// Domain fields of a record, keyed by field name.
pub type FieldBag = serde_json::Map<String, Value>;

/// Entity tables mirrored in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    Customers,
    Products,
    Orders,
    Invoices,
    Payments,
    TripSheets,
}

impl EntityTable {
    pub const ALL: [EntityTable; 6] = [
        EntityTable::Customers,
        EntityTable::Products,
        EntityTable::Orders,
        EntityTable::Invoices,
        EntityTable::Payments,
        EntityTable::TripSheets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityTable::Customers => "customers",
            EntityTable::Products => "products",
            EntityTable::Orders => "orders",
            EntityTable::Invoices => "invoices",
            EntityTable::Payments => "payments",
            EntityTable::TripSheets => "trip_sheets",
        }
    }
}

impl fmt::Display for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityTable {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        EntityTable::ALL
            .into_iter()
            .find(|table| table.as_str() == value)
            .ok_or_else(|| Error::validation(format!("Unsupported entity table '{}'", value)))
    }
}

/// Per-record sync state. Only the sync engine moves a record away from `Pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(Error::validation(format!("Unknown sync status '{}'", other))),
        }
    }
}

/// Base shape of every entity row: envelope metadata plus a flattened field bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableRecord {
    pub id: String,
    pub center_id: String,
    pub last_modified: i64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(flatten)]
    pub fields: FieldBag,
}

impl SyncableRecord {
    pub fn new(id: impl Into<String>, center_id: impl Into<String>, fields: FieldBag) -> Self {
        Self {
            id: id.into(),
            center_id: center_id.into(),
            last_modified: 0,
            is_deleted: false,
            sync_status: SyncStatus::Pending,
            fields: sanitize_fields(fields),
        }
    }

    /// Field-bag last-write-wins merge: incoming keys overwrite, absent keys persist.
    pub fn merge_fields(&mut self, incoming: &FieldBag) {
        for (key, value) in incoming {
            if is_reserved_field(key) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Restamps the record for a local write.
    pub fn stamp_local_write(&mut self, now_ms: i64) {
        self.last_modified = next_last_modified(self.last_modified, now_ms);
        self.sync_status = SyncStatus::Pending;
    }

    /// Looks up a field by name, resolving envelope keys as well as the field bag.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "centerId" => Some(Value::String(self.center_id.clone())),
            "lastModified" => Some(Value::from(self.last_modified)),
            "isDeleted" => Some(Value::Bool(self.is_deleted)),
            "syncStatus" => Some(Value::String(self.sync_status.as_str().to_string())),
            _ => self.fields.get(name).cloned(),
        }
    }
}

pub fn is_reserved_field(name: &str) -> bool {
    RESERVED_FIELDS.contains(&name)
}

/// Strips envelope keys a caller may have sent inside the domain payload.
pub fn sanitize_fields(mut fields: FieldBag) -> FieldBag {
    fields.retain(|key, _| !is_reserved_field(key));
    fields
}

/// Monotonic stamp: never earlier than, nor equal to, the previous stamp.
pub fn next_last_modified(previous: i64, now_ms: i64) -> i64 {
    now_ms.max(previous.saturating_add(1))
}
