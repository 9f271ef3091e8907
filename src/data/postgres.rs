use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::debug;

use super::{DataSource, FieldValue, Record};
use crate::errors::{BackupError, Result};

const SALES_QUERY: &str = "SELECT * FROM sales \
     WHERE ($1::timestamptz IS NULL OR created_at >= $1) \
       AND ($2::timestamptz IS NULL OR created_at <= $2) \
     ORDER BY id";

const SALE_ITEMS_QUERY: &str = "SELECT si.* FROM sale_items si \
     JOIN sales s ON s.id = si.sale_id \
     WHERE ($1::timestamptz IS NULL OR s.created_at >= $1) \
       AND ($2::timestamptz IS NULL OR s.created_at <= $2) \
     ORDER BY si.sale_id, si.id";

const INVENTORY_QUERY: &str = "SELECT * FROM products ORDER BY id";

/// Postgres-backed reads over the `sales`, `sale_items` and `products` tables.
///
/// Reads are issued independently; there is no snapshot isolation across them.
#[derive(Clone)]
pub struct PgDataSource {
    pool: PgPool,
}

impl PgDataSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| BackupError::query("database connection", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_windowed(
        &self,
        what: &str,
        sql: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>> {
        let rows = sqlx::query(sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackupError::query(what, e))?;
        debug!(table = what, rows = rows.len(), "fetched rows");
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl DataSource for PgDataSource {
    async fn fetch_sales(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>> {
        self.fetch_windowed("sales", SALES_QUERY, start, end).await
    }

    async fn fetch_sale_items(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>> {
        self.fetch_windowed("sale_items", SALE_ITEMS_QUERY, start, end).await
    }

    async fn fetch_inventory(&self) -> Result<Vec<Record>> {
        let rows = sqlx::query(INVENTORY_QUERY)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackupError::query("products", e))?;
        debug!(table = "products", rows = rows.len(), "fetched rows");
        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &PgRow) -> Result<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let is_null = row
            .try_get_raw(idx)
            .map_err(|e| decode_error(column.name(), e))?
            .is_null();
        let value = if is_null {
            FieldValue::Null
        } else {
            decode_column(row, idx, column.name(), column.type_info().name())?
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn decode_column(row: &PgRow, idx: usize, name: &str, type_name: &str) -> Result<FieldValue> {
    let err = |e: sqlx::Error| decode_error(name, e);
    Ok(match type_name {
        "BOOL" => FieldValue::Bool(row.try_get(idx).map_err(err)?),
        "INT2" => FieldValue::Int(row.try_get::<i16, _>(idx).map_err(err)? as i64),
        "INT4" => FieldValue::Int(row.try_get::<i32, _>(idx).map_err(err)? as i64),
        "INT8" => FieldValue::Int(row.try_get(idx).map_err(err)?),
        "FLOAT4" => FieldValue::Float(row.try_get::<f32, _>(idx).map_err(err)? as f64),
        "FLOAT8" => FieldValue::Float(row.try_get(idx).map_err(err)?),
        "NUMERIC" => FieldValue::Decimal(
            row.try_get::<sqlx::types::BigDecimal, _>(idx)
                .map_err(err)?
                .to_string(),
        ),
        "UUID" => FieldValue::Uuid(row.try_get(idx).map_err(err)?),
        "TIMESTAMPTZ" => FieldValue::Timestamp(row.try_get::<DateTime<Utc>, _>(idx).map_err(err)?),
        "TIMESTAMP" => FieldValue::NaiveTimestamp(row.try_get::<NaiveDateTime, _>(idx).map_err(err)?),
        "DATE" => FieldValue::Date(row.try_get::<NaiveDate, _>(idx).map_err(err)?),
        "JSON" | "JSONB" => FieldValue::Json(row.try_get(idx).map_err(err)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => FieldValue::Text(row.try_get(idx).map_err(err)?),
        other => {
            return Err(BackupError::SerializationFailure(format!(
                "column '{}' has unsupported type {}",
                name, other
            )));
        }
    })
}

fn decode_error(column: &str, e: sqlx::Error) -> BackupError {
    BackupError::SerializationFailure(format!("failed to decode column '{}': {}", column, e))
}
