// posbackup/src/backup/service.rs
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::codec::{self, Envelope};
use crate::config::StorageConfig;
use crate::data::DataSource;
use crate::errors::{BackupError, Result};
use crate::models::{AggregateResult, BackupType, DeletionResult, RestoreResult, RunResult, RunStatus};
use crate::restore::verification;
use crate::storage::{connect_provider, ObjectInfo, StorageProvider, Sweep};

pub const BACKUP_ROOT: &str = "backups";
pub const ARTIFACT_SUFFIX: &str = ".json.gz";
pub const ITEMS_SUFFIX: &str = "_items.json.gz";

/// `{type}_{YYYYMMDDHHMMSS}_{8 hex}`. The random tail keeps ids unique when
/// several backups start within the same second.
pub fn generate_backup_id(backup_type: BackupType, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4();
    format!(
        "{}_{}_{}",
        backup_type,
        now.format("%Y%m%d%H%M%S"),
        hex::encode(&random.as_bytes()[..4])
    )
}

pub fn artifact_key(backup_type: BackupType, backup_id: &str) -> String {
    format!("{}/{}/{}{}", BACKUP_ROOT, backup_type, backup_id, ARTIFACT_SUFFIX)
}

pub fn items_key(backup_id: &str) -> String {
    format!("{}/{}/{}{}", BACKUP_ROOT, BackupType::Sales, backup_id, ITEMS_SUFFIX)
}

fn is_primary_artifact(key: &str) -> bool {
    key.ends_with(ARTIFACT_SUFFIX) && !key.ends_with(ITEMS_SUFFIX)
}

fn check_backup_id(backup_id: &str) -> Result<()> {
    if backup_id.is_empty() || backup_id.contains('/') || backup_id.contains("..") {
        return Err(BackupError::config(format!("invalid backup id '{}'", backup_id)));
    }
    Ok(())
}

#[derive(Clone)]
enum ProviderState {
    Ready(Arc<dyn StorageProvider>),
    Unavailable(String),
}

/// Turns data-access queries into stored artifacts and back.
///
/// Holds no state between calls beyond its provider and data source. Every
/// public operation reports failure through its result type.
#[derive(Clone)]
pub struct BackupService {
    provider: ProviderState,
    data: Arc<dyn DataSource>,
}

impl BackupService {
    pub fn new(provider: Arc<dyn StorageProvider>, data: Arc<dyn DataSource>) -> Self {
        Self {
            provider: ProviderState::Ready(provider),
            data,
        }
    }

    /// A service whose provider failed to initialize. Every operation
    /// short-circuits with `ProviderUnavailable`.
    pub fn unavailable(reason: impl Into<String>, data: Arc<dyn DataSource>) -> Self {
        Self {
            provider: ProviderState::Unavailable(reason.into()),
            data,
        }
    }

    /// Connects the configured provider; a failed probe yields a not-ready service.
    pub async fn connect(storage: &StorageConfig, data: Arc<dyn DataSource>) -> Self {
        match connect_provider(storage).await {
            Ok(provider) => Self::new(provider, data),
            Err(e) => {
                error!(error = %e, "storage provider failed its connectivity probe");
                Self::unavailable(e.to_string(), data)
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.provider, ProviderState::Ready(_))
    }

    fn provider(&self) -> Result<&Arc<dyn StorageProvider>> {
        match &self.provider {
            ProviderState::Ready(p) => Ok(p),
            ProviderState::Unavailable(reason) => Err(BackupError::ProviderUnavailable(reason.clone())),
        }
    }

    /// Backs up sales (optionally restricted to `start..=end`) plus their line
    /// items as a second artifact next to the first.
    pub async fn backup_sales(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> RunResult {
        let started_at = Utc::now();
        let backup_id = generate_backup_id(BackupType::Sales, started_at);
        info!(backup_id = %backup_id, ?start, ?end, "starting sales backup");
        let attempt = AssertUnwindSafe(self.try_backup_sales(&backup_id, started_at, start, end))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panicked(BackupType::Sales, panic)));
        match attempt {
            Ok(result) => result,
            Err(e) => {
                error!(backup_id = %backup_id, error = %e, "sales backup failed");
                RunResult::failed(backup_id, BackupType::Sales, started_at, &e)
            }
        }
    }

    async fn try_backup_sales(
        &self,
        backup_id: &str,
        started_at: DateTime<Utc>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<RunResult> {
        let provider = self.provider()?;
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(BackupError::config(format!("sales window start {} is after end {}", s, e)));
            }
        }

        let sales = self.data.fetch_sales(start, end).await?;
        let items = self.data.fetch_sale_items(start, end).await?;
        let envelope = Envelope::from_records(backup_id, BackupType::Sales, started_at, &sales)?;
        let items_envelope = Envelope::from_records(backup_id, BackupType::Sales, started_at, &items)?;
        let payload = codec::encode(&envelope)?;
        let items_payload = codec::encode(&items_envelope)?;

        let key = artifact_key(BackupType::Sales, backup_id);
        let secondary = items_key(backup_id);
        let byte_size = payload.len() as u64;
        provider.put(&key, Bytes::from(payload)).await?;
        if let Err(e) = provider.put(&secondary, Bytes::from(items_payload)).await {
            // A sales artifact without its items is not restorable as a unit.
            if let Err(cleanup) = provider.delete(&key).await {
                warn!(key = %key, error = %cleanup, "failed to remove orphaned sales artifact");
            }
            return Err(e);
        }

        info!(
            backup_id,
            records = envelope.record_count,
            items = items_envelope.record_count,
            bytes = byte_size,
            key = %key,
            "sales backup completed"
        );
        Ok(RunResult {
            backup_id: backup_id.to_string(),
            backup_type: BackupType::Sales,
            status: RunStatus::Completed,
            record_count: envelope.record_count,
            object_key: Some(key),
            items_key: Some(secondary),
            byte_size,
            error: None,
            started_at,
            completed_at: Utc::now(),
        })
    }

    pub async fn backup_inventory(&self) -> RunResult {
        let started_at = Utc::now();
        let backup_id = generate_backup_id(BackupType::Inventory, started_at);
        info!(backup_id = %backup_id, "starting inventory backup");
        let attempt = AssertUnwindSafe(self.try_backup_inventory(&backup_id, started_at))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panicked(BackupType::Inventory, panic)));
        match attempt {
            Ok(result) => result,
            Err(e) => {
                error!(backup_id = %backup_id, error = %e, "inventory backup failed");
                RunResult::failed(backup_id, BackupType::Inventory, started_at, &e)
            }
        }
    }

    async fn try_backup_inventory(&self, backup_id: &str, started_at: DateTime<Utc>) -> Result<RunResult> {
        let provider = self.provider()?;
        let products = self.data.fetch_inventory().await?;
        let envelope = Envelope::from_records(backup_id, BackupType::Inventory, started_at, &products)?;
        let payload = codec::encode(&envelope)?;
        let key = artifact_key(BackupType::Inventory, backup_id);
        let byte_size = payload.len() as u64;
        provider.put(&key, Bytes::from(payload)).await?;

        info!(backup_id, records = envelope.record_count, bytes = byte_size, key = %key, "inventory backup completed");
        Ok(RunResult {
            backup_id: backup_id.to_string(),
            backup_type: BackupType::Inventory,
            status: RunStatus::Completed,
            record_count: envelope.record_count,
            object_key: Some(key),
            items_key: None,
            byte_size,
            error: None,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Runs the sales and inventory backups side by side. Each branch runs on
    /// its own task so a panic in one is reported as that branch's failure.
    pub async fn backup_all(&self) -> AggregateResult {
        let started_at = Utc::now();
        let sales_service = self.clone();
        let inventory_service = self.clone();
        let sales = tokio::spawn(async move { sales_service.backup_sales(None, None).await });
        let inventory = tokio::spawn(async move { inventory_service.backup_inventory().await });
        let (sales, inventory) = tokio::join!(sales, inventory);

        let sales = sales.unwrap_or_else(|e| aborted_branch(BackupType::Sales, started_at, e));
        let inventory = inventory.unwrap_or_else(|e| aborted_branch(BackupType::Inventory, started_at, e));
        let aggregate = AggregateResult::from_branches(sales, inventory);
        info!(
            successful = aggregate.successful_count,
            failed = aggregate.failed_count,
            "full backup finished"
        );
        aggregate
    }

    pub async fn restore_sales(&self, backup_id: &str) -> RestoreResult {
        self.restore(BackupType::Sales, backup_id).await
    }

    pub async fn restore_inventory(&self, backup_id: &str) -> RestoreResult {
        self.restore(BackupType::Inventory, backup_id).await
    }

    /// Downloads and decodes an artifact. Applying the rows is the caller's job.
    async fn restore(&self, backup_type: BackupType, backup_id: &str) -> RestoreResult {
        match self.try_restore(backup_type, backup_id).await {
            Ok((envelope, items)) => {
                info!(backup_id, records = envelope.record_count, "artifact restored");
                RestoreResult {
                    backup_id: backup_id.to_string(),
                    status: RunStatus::Completed,
                    envelope: Some(envelope),
                    items,
                    error: None,
                }
            }
            Err(e) => {
                error!(backup_id, error = %e, "restore failed");
                RestoreResult {
                    backup_id: backup_id.to_string(),
                    status: RunStatus::Failed,
                    envelope: None,
                    items: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_restore(&self, backup_type: BackupType, backup_id: &str) -> Result<(Envelope, Option<Envelope>)> {
        let provider = self.provider()?;
        check_backup_id(backup_id)?;
        let bytes = provider.get(&artifact_key(backup_type, backup_id)).await?;
        let envelope = codec::decode(&bytes)?;
        if envelope.backup_type != backup_type || envelope.backup_id != backup_id {
            return Err(BackupError::VerificationFailure(format!(
                "artifact holds {} backup {}, expected {} backup {}",
                envelope.backup_type, envelope.backup_id, backup_type, backup_id
            )));
        }

        let items = if backup_type == BackupType::Sales {
            match provider.get(&items_key(backup_id)).await {
                Ok(bytes) => Some(codec::decode(&bytes)?),
                Err(BackupError::NotFound(_)) => {
                    warn!(backup_id, "sales artifact has no line items artifact");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        Ok((envelope, items))
    }

    /// Primary artifacts only, newest first. `Full` (or no filter) lists every type.
    pub async fn list_backups(&self, type_filter: Option<BackupType>) -> Result<Vec<ObjectInfo>> {
        let provider = self.provider()?;
        let prefix = match type_filter {
            Some(t @ (BackupType::Sales | BackupType::Inventory)) => format!("{}/{}/", BACKUP_ROOT, t),
            Some(BackupType::Full) | None => format!("{}/", BACKUP_ROOT),
        };
        let mut objects: Vec<ObjectInfo> = provider
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|obj| is_primary_artifact(&obj.key))
            .collect();
        objects.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.key.cmp(&a.key))
        });
        Ok(objects)
    }

    /// Deletes primary and line-item artifacts strictly older than
    /// `retention_days` days.
    pub async fn delete_old_backups(&self, retention_days: u32) -> DeletionResult {
        self.delete_old_backups_at(retention_days, Utc::now()).await
    }

    pub async fn delete_old_backups_at(&self, retention_days: u32, now: DateTime<Utc>) -> DeletionResult {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let outcome: Result<Sweep> = async {
            if retention_days == 0 {
                return Err(BackupError::config("retention_days must be positive"));
            }
            let provider = self.provider()?;
            provider.delete_older_than(&format!("{}/", BACKUP_ROOT), cutoff).await
        }
        .await;

        match outcome {
            Ok(sweep) if sweep.failed > 0 => {
                error!(
                    retention_days,
                    deleted_count = sweep.deleted,
                    failed_count = sweep.failed,
                    "retention cleanup left expired backups behind"
                );
                DeletionResult {
                    status: RunStatus::Failed,
                    deleted_count: sweep.deleted,
                    failed_count: sweep.failed,
                    cutoff,
                    error: Some(format!("{} expired objects could not be deleted", sweep.failed)),
                }
            }
            Ok(sweep) => {
                info!(retention_days, deleted_count = sweep.deleted, %cutoff, "retention cleanup finished");
                DeletionResult {
                    status: RunStatus::Completed,
                    deleted_count: sweep.deleted,
                    failed_count: 0,
                    cutoff,
                    error: None,
                }
            }
            Err(e) => {
                error!(retention_days, error = %e, "retention cleanup failed");
                DeletionResult {
                    status: RunStatus::Failed,
                    deleted_count: 0,
                    failed_count: 0,
                    cutoff,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Reads the stored object once and checks it; any failure is `false`.
    pub async fn verify_backup(&self, key: &str) -> bool {
        let provider = match self.provider() {
            Ok(p) => p,
            Err(e) => {
                warn!(key, error = %e, "cannot verify backup");
                return false;
            }
        };
        match provider.get(key).await {
            Ok(bytes) => verification::verify_artifact(key, &bytes),
            Err(e) => {
                warn!(key, error = %e, "cannot read backup for verification");
                false
            }
        }
    }
}

fn panicked(backup_type: BackupType, panic: Box<dyn Any + Send>) -> BackupError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    BackupError::TaskFailure(format!("{} backup panicked: {}", backup_type, message))
}

fn aborted_branch(backup_type: BackupType, started_at: DateTime<Utc>, e: tokio::task::JoinError) -> RunResult {
    let err = BackupError::TaskFailure(format!("{} backup task aborted: {}", backup_type, e));
    error!(error = %err, "backup branch did not complete");
    RunResult::failed(generate_backup_id(backup_type, started_at), backup_type, started_at, &err)
}
