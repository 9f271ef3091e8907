//! Read-only access to the point-of-sale tables.
//!
//! The backup service only needs three enumerable row sets. Rows come back as
//! typed field maps and are normalized into portable JSON objects before they
//! are written into an artifact.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::errors::{BackupError, Result};

pub use postgres::PgDataSource;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision numerics are carried in their textual form.
    Decimal(String),
    Text(String),
    Uuid(uuid::Uuid),
    Timestamp(DateTime<Utc>),
    NaiveTimestamp(NaiveDateTime),
    Date(NaiveDate),
    Json(Value),
}

pub type Record = BTreeMap<String, FieldValue>;

impl FieldValue {
    /// Converts the value to JSON, rendering every date or time as ISO-8601.
    pub fn to_portable(&self) -> Result<Value> {
        Ok(match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::Number((*i).into()),
            FieldValue::Float(f) => Number::from_f64(*f).map(Value::Number).ok_or_else(|| {
                BackupError::SerializationFailure(format!("non-finite float {} cannot be stored", f))
            })?,
            FieldValue::Decimal(d) => Value::String(d.clone()),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Uuid(u) => Value::String(u.to_string()),
            FieldValue::Timestamp(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            FieldValue::NaiveTimestamp(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            FieldValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::Json(v) => v.clone(),
        })
    }
}

/// Normalizes a batch of records; the first non-portable field fails the batch.
pub fn normalize_records(records: &[Record]) -> Result<Vec<Map<String, Value>>> {
    records
        .iter()
        .map(|record| {
            record
                .iter()
                .map(|(name, value)| {
                    value
                        .to_portable()
                        .map(|v| (name.clone(), v))
                        .map_err(|e| BackupError::SerializationFailure(format!("field '{}': {}", name, e)))
                })
                .collect::<Result<Map<String, Value>>>()
        })
        .collect()
}

/// Read queries the backup service runs. Implementations must not write.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Sales rows, optionally restricted to `start..=end` on their creation time.
    async fn fetch_sales(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>>;

    /// Line items belonging to the same sales window.
    async fn fetch_sale_items(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>>;

    async fn fetch_inventory(&self) -> Result<Vec<Record>>;
}
