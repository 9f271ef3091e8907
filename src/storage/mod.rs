//! Object storage backends for backup artifacts.
//!
//! Every backend exposes the same small surface: put, get, list and delete by
//! key. Retention is implemented once here, on top of `list` and `delete`, so
//! the age comparison is identical for every backend.

pub mod azure;
pub mod cloud;
pub mod gcs;
pub mod local;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::errors::{BackupError, Result};

pub use azure::connect_azure;
pub use gcs::connect_gcs;
pub use local::LocalStorage;
pub use s3::S3Storage;

/// What a retention pass removed and what it could not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Sweep {
    pub deleted: usize,
    pub failed: usize,
}

/// Metadata for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short backend name used in log lines.
    fn name(&self) -> &'static str;

    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Returns `BackupError::NotFound` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Deletes every object under `prefix` last modified strictly before
    /// `cutoff`. An object that fails to delete is logged, counted in
    /// `Sweep::failed` and the pass moves on to the next one.
    async fn delete_older_than(&self, prefix: &str, cutoff: DateTime<Utc>) -> Result<Sweep> {
        let expired: Vec<ObjectInfo> = self
            .list(prefix)
            .await?
            .into_iter()
            .filter(|obj| obj.last_modified < cutoff)
            .collect();

        let mut sweep = Sweep::default();
        for obj in &expired {
            match self.delete(&obj.key).await {
                Ok(()) => {
                    sweep.deleted += 1;
                    info!(backend = self.name(), key = %obj.key, "deleted expired object");
                }
                Err(e) => {
                    sweep.failed += 1;
                    warn!(backend = self.name(), key = %obj.key, error = %e, "failed to delete expired object");
                }
            }
        }
        Ok(sweep)
    }
}

/// Builds the configured backend and probes it.
///
/// A failed probe is reported as `ProviderUnavailable`; there is no fallback
/// to another backend.
pub async fn connect_provider(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>> {
    let provider: Arc<dyn StorageProvider> = match config {
        StorageConfig::Local(cfg) => Arc::new(LocalStorage::connect(&cfg.root).await?),
        StorageConfig::S3(cfg) => Arc::new(S3Storage::connect(cfg).await?),
        StorageConfig::Gcs(cfg) => Arc::new(connect_gcs(cfg).await?),
        StorageConfig::Azure(cfg) => Arc::new(connect_azure(cfg).await?),
    };
    info!(backend = provider.name(), "storage provider ready");
    Ok(provider)
}

/// Rejects keys that could escape a backend's root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment == ".." || segment == ".")
    {
        return Err(BackupError::config(format!("invalid object key '{}'", key)));
    }
    Ok(())
}
