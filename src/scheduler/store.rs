//! Durable job definitions and run history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::errors::{BackupError, Result};
use crate::models::{Job, JobId, RunLog, RunStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;
    async fn upsert_job(&self, job: &Job) -> Result<()>;
    async fn delete_job(&self, id: JobId) -> Result<()>;
    async fn record_job_status(
        &self,
        id: JobId,
        status: RunStatus,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn insert_run_log(&self, log: &RunLog) -> Result<()>;
    /// Most recent first.
    async fn list_run_logs(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<RunLog>>;
}

/// Keeps everything in process memory. Used by tests and by embedders that
/// persist jobs elsewhere.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<BTreeMap<JobId, Job>>,
    logs: RwLock<Vec<RunLog>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn upsert_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.values().any(|other| other.id != job.id && other.name == job.name) {
            return Err(BackupError::config(format!("job name '{}' is already taken", job.name)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }

    async fn record_job_status(
        &self,
        id: JobId,
        status: RunStatus,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| BackupError::NotFound(format!("job {}", id)))?;
        job.last_run_status = Some(status);
        if last_run_at.is_some() {
            job.last_run_at = last_run_at;
        }
        if next_run_at.is_some() {
            job.next_run_at = next_run_at;
        }
        Ok(())
    }

    async fn insert_run_log(&self, log: &RunLog) -> Result<()> {
        let mut logs = self.logs.write().await;
        if logs.iter().any(|l| l.backup_id == log.backup_id) {
            return Err(BackupError::config(format!("duplicate backup id {}", log.backup_id)));
        }
        logs.push(log.clone());
        Ok(())
    }

    async fn list_run_logs(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<RunLog>> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .rev()
            .filter(|l| job_id.is_none() || l.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

const CREATE_JOBS_TABLE: &str = "CREATE TABLE IF NOT EXISTS backup_jobs (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    backup_type TEXT NOT NULL,
    cadence TEXT NOT NULL,
    time_of_day TEXT,
    retention_days INTEGER NOT NULL DEFAULT 30 CHECK (retention_days > 0),
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    last_run_at TIMESTAMPTZ,
    last_run_status TEXT,
    next_run_at TIMESTAMPTZ
)";

const CREATE_LOGS_TABLE: &str = "CREATE TABLE IF NOT EXISTS backup_logs (
    id BIGSERIAL PRIMARY KEY,
    backup_id TEXT NOT NULL UNIQUE,
    job_id BIGINT REFERENCES backup_jobs(id) ON DELETE SET NULL,
    backup_type TEXT NOT NULL,
    status TEXT NOT NULL,
    object_key TEXT,
    byte_size BIGINT NOT NULL DEFAULT 0,
    record_count BIGINT NOT NULL DEFAULT 0,
    error_message TEXT,
    started_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ
)";

const JOB_COLUMNS: &str = "id, name, backup_type, cadence, time_of_day, retention_days, enabled, \
     last_run_at, last_run_status, next_run_at";

const LOG_COLUMNS: &str = "backup_id, job_id, backup_type, status, object_key, byte_size, \
     record_count, error_message, started_at, completed_at";

/// Job store over the `backup_jobs` and `backup_logs` tables.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in [CREATE_JOBS_TABLE, CREATE_LOGS_TABLE] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| BackupError::query("job store schema", e))?;
        }
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let err = |e: sqlx::Error| BackupError::query("backup_jobs", e);
    let backup_type: String = row.try_get("backup_type").map_err(err)?;
    let retention_days: i32 = row.try_get("retention_days").map_err(err)?;
    let last_run_status: Option<String> = row.try_get("last_run_status").map_err(err)?;
    Ok(Job {
        id: row.try_get("id").map_err(err)?,
        name: row.try_get("name").map_err(err)?,
        backup_type: backup_type.parse()?,
        cadence: row.try_get("cadence").map_err(err)?,
        time_of_day: row.try_get("time_of_day").map_err(err)?,
        retention_days: u32::try_from(retention_days)
            .map_err(|_| BackupError::config(format!("negative retention_days {}", retention_days)))?,
        enabled: row.try_get("enabled").map_err(err)?,
        last_run_at: row.try_get("last_run_at").map_err(err)?,
        last_run_status: last_run_status.as_deref().map(str::parse).transpose()?,
        next_run_at: row.try_get("next_run_at").map_err(err)?,
    })
}

fn log_from_row(row: &PgRow) -> Result<RunLog> {
    let err = |e: sqlx::Error| BackupError::query("backup_logs", e);
    let backup_type: String = row.try_get("backup_type").map_err(err)?;
    let status: String = row.try_get("status").map_err(err)?;
    let byte_size: i64 = row.try_get("byte_size").map_err(err)?;
    let record_count: i64 = row.try_get("record_count").map_err(err)?;
    Ok(RunLog {
        backup_id: row.try_get("backup_id").map_err(err)?,
        job_id: row.try_get("job_id").map_err(err)?,
        backup_type: backup_type.parse()?,
        status: status.parse()?,
        object_key: row.try_get("object_key").map_err(err)?,
        byte_size: byte_size.max(0) as u64,
        record_count: record_count.max(0) as u64,
        error_message: row.try_get("error_message").map_err(err)?,
        started_at: row.try_get("started_at").map_err(err)?,
        completed_at: row.try_get("completed_at").map_err(err)?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!("SELECT {} FROM backup_jobs ORDER BY id", JOB_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackupError::query("backup_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM backup_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackupError::query("backup_jobs", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn upsert_job(&self, job: &Job) -> Result<()> {
        let retention_days = i32::try_from(job.retention_days)
            .map_err(|_| BackupError::config(format!("retention_days {} is too large", job.retention_days)))?;
        sqlx::query(
            "INSERT INTO backup_jobs (id, name, backup_type, cadence, time_of_day, retention_days, enabled, \
                 last_run_at, last_run_status, next_run_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO UPDATE SET \
                 name = EXCLUDED.name, backup_type = EXCLUDED.backup_type, cadence = EXCLUDED.cadence, \
                 time_of_day = EXCLUDED.time_of_day, retention_days = EXCLUDED.retention_days, \
                 enabled = EXCLUDED.enabled, last_run_at = EXCLUDED.last_run_at, \
                 last_run_status = EXCLUDED.last_run_status, next_run_at = EXCLUDED.next_run_at",
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(job.backup_type.as_str())
        .bind(&job.cadence)
        .bind(&job.time_of_day)
        .bind(retention_days)
        .bind(job.enabled)
        .bind(job.last_run_at)
        .bind(job.last_run_status.map(|s| s.as_str()))
        .bind(job.next_run_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::query("backup_jobs", e))?;
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM backup_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::query("backup_jobs", e))?;
        Ok(())
    }

    async fn record_job_status(
        &self,
        id: JobId,
        status: RunStatus,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backup_jobs SET last_run_status = $2, \
                 last_run_at = COALESCE($3, last_run_at), \
                 next_run_at = COALESCE($4, next_run_at) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::query("backup_jobs", e))?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn insert_run_log(&self, log: &RunLog) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO backup_logs ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            LOG_COLUMNS
        ))
        .bind(&log.backup_id)
        .bind(log.job_id)
        .bind(log.backup_type.as_str())
        .bind(log.status.as_str())
        .bind(&log.object_key)
        .bind(i64::try_from(log.byte_size).unwrap_or(i64::MAX))
        .bind(i64::try_from(log.record_count).unwrap_or(i64::MAX))
        .bind(&log.error_message)
        .bind(log.started_at)
        .bind(log.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BackupError::query("backup_logs", e))?;
        Ok(())
    }

    async fn list_run_logs(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<RunLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM backup_logs WHERE ($1::bigint IS NULL OR job_id = $1) \
             ORDER BY started_at DESC, id DESC LIMIT $2",
            LOG_COLUMNS
        ))
        .bind(job_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BackupError::query("backup_logs", e))?;
        rows.iter().map(log_from_row).collect()
    }
}
