//! Filter/order/paginate view over an entity table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::entities_model::SyncableRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

/// One predicate term. Terms in a query are combined with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &SyncableRecord) -> bool {
        let actual = record.field(&self.field).unwrap_or(Value::Null);
        match self.op {
            FilterOp::Eq => values_equal(&actual, &self.value),
            FilterOp::Ne => !values_equal(&actual, &self.value),
            FilterOp::Gt => compare_values(&actual, &self.value) == Ordering::Greater,
            FilterOp::Gte => compare_values(&actual, &self.value) != Ordering::Less,
            FilterOp::Lt => compare_values(&actual, &self.value) == Ordering::Less,
            FilterOp::Lte => compare_values(&actual, &self.value) != Ordering::Greater,
            FilterOp::Contains => match (&actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack
                    .to_lowercase()
                    .contains(&needle.to_lowercase()),
                (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordQuery {
    /// Tenant partition. `None` reads across every center.
    pub center_id: Option<String>,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// Tombstoned rows are hidden unless asked for.
    #[serde(default)]
    pub include_deleted: bool,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_center(center_id: impl Into<String>) -> Self {
        Self {
            center_id: Some(center_id.into()),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn matches(&self, record: &SyncableRecord) -> bool {
        if !self.include_deleted && record.is_deleted {
            return false;
        }
        if let Some(center_id) = &self.center_id {
            if &record.center_id != center_id {
                return false;
            }
        }
        self.filters.iter().all(|filter| filter.matches(record))
    }

    /// Applies predicate, ordering and pagination to rows already loaded from storage.
    ///
    /// Without an explicit order, rows are returned by `id` so pagination is stable.
    pub fn apply(&self, records: Vec<SyncableRecord>) -> Vec<SyncableRecord> {
        let mut rows = records
            .into_iter()
            .filter(|record| self.matches(record))
            .collect::<Vec<_>>();

        match &self.order_by {
            Some(order) => rows.sort_by(|a, b| {
                let left = a.field(&order.field).unwrap_or(Value::Null);
                let right = b.field(&order.field).unwrap_or(Value::Null);
                let ordering = compare_values(&left, &right).then_with(|| a.id.cmp(&b.id));
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            }),
            None => rows.sort_by(|a, b| a.id.cmp(&b.id)),
        }

        let iter = rows.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Total order over JSON scalars: null < bool < number < string < other.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }

    match (left, right) {
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        (Value::Number(l), Value::Number(r)) => {
            let l = l.as_f64().unwrap_or(0.0);
            let r = r.as_f64().unwrap_or(0.0);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        (Value::String(l), Value::String(r)) => l.cmp(r),
        _ => rank(left).cmp(&rank(right)),
    }
}
