//! Typed views over the field bag for callers that want compile-time shapes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::entities_model::{sanitize_fields, EntityTable, FieldBag, SyncableRecord};
use crate::errors::{Error, Result};

/// A domain entity stored in one sync table.
pub trait SyncEntity: Serialize + DeserializeOwned + Send + 'static {
    const TABLE: EntityTable;

    /// Domain fields for a create/update payload.
    fn to_fields(&self) -> Result<FieldBag> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(sanitize_fields(map)),
            _ => Err(Error::validation(format!(
                "{} must serialize to a JSON object",
                Self::TABLE
            ))),
        }
    }

    fn from_record(record: &SyncableRecord) -> Result<Self> {
        if record.fields.is_empty() && !record.is_deleted {
            return Err(Error::validation(format!(
                "Record '{}' in {} has no domain fields",
                record.id,
                Self::TABLE
            )));
        }
        Ok(serde_json::from_value(serde_json::Value::Object(
            record.fields.clone(),
        ))?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub route: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

impl SyncEntity for Customer {
    const TABLE: EntityTable = EntityTable::Customers;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub name: String,
    pub unit: String,
    pub price: f64,
    pub stock: f64,
}

impl SyncEntity for Product {
    const TABLE: EntityTable = EntityTable::Products;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: String,
    pub quantity: f64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub customer_id: String,
    pub order_date: String,
    pub status: String,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
    pub total: f64,
}

impl SyncEntity for Order {
    const TABLE: EntityTable = EntityTable::Orders;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub order_id: String,
    pub customer_id: String,
    pub invoice_number: Option<String>,
    pub amount: f64,
    pub tax_amount: f64,
    pub status: String,
}

impl SyncEntity for Invoice {
    const TABLE: EntityTable = EntityTable::Invoices;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub customer_id: String,
    pub invoice_id: Option<String>,
    pub amount: f64,
    pub method: String,
    pub paid_at: String,
}

impl SyncEntity for Payment {
    const TABLE: EntityTable = EntityTable::Payments;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSheet {
    pub route: String,
    pub driver: String,
    pub trip_date: String,
    #[serde(default)]
    pub order_ids: Vec<String>,
    pub status: String,
}

impl SyncEntity for TripSheet {
    const TABLE: EntityTable = EntityTable::TripSheets;
}
