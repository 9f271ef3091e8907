//! Adapter from the `object_store` crate to [`StorageProvider`].
//!
//! The Google Cloud Storage and Azure Blob backends differ only in how the
//! store is built and how their native errors are named, so both wrap this
//! one type.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::{debug, info};

use super::{validate_key, ObjectInfo, StorageProvider};
use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudKind {
    Gcs,
    Azure,
}

impl CloudKind {
    fn label(&self) -> &'static str {
        match self {
            CloudKind::Gcs => "gcs",
            CloudKind::Azure => "azure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloudStorage {
    kind: CloudKind,
    store: Arc<dyn ObjectStore>,
    /// Bucket or container name, for log lines only.
    location: String,
}

impl CloudStorage {
    /// Wraps a built store after confirming the bucket/container answers a listing.
    pub async fn probe(kind: CloudKind, store: Arc<dyn ObjectStore>, location: String) -> Result<Self> {
        let mut listing = store.list(None);
        if let Some(Err(e)) = listing.next().await {
            return Err(BackupError::ProviderUnavailable(format!(
                "{} location '{}' is not accessible: {}",
                kind.label(),
                location,
                e
            )));
        }
        drop(listing);
        info!(backend = kind.label(), location = %location, "cloud location is accessible");
        Ok(Self { kind, store, location })
    }

    pub fn kind(&self) -> CloudKind {
        self.kind
    }

    fn map_error(&self, key: &str, e: object_store::Error, op: Op) -> BackupError {
        match e {
            object_store::Error::NotFound { .. } => BackupError::NotFound(key.to_string()),
            other => {
                let message = format!("{} ({}): {}", self.kind.label(), self.location, other);
                match op {
                    Op::Put => BackupError::upload(key, message),
                    Op::Get | Op::List => BackupError::download(key, message),
                    Op::Delete => BackupError::delete(key, message),
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Op {
    Put,
    Get,
    List,
    Delete,
}

fn object_path(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key).map_err(|e| BackupError::config(format!("invalid object key '{}': {}", key, e)))
}

#[async_trait]
impl StorageProvider for CloudStorage {
    fn name(&self) -> &'static str {
        self.kind.label()
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        validate_key(key)?;
        let path = object_path(key)?;
        let size = data.len();
        self.store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| self.map_error(key, e, Op::Put))?;
        debug!(backend = self.kind.label(), key, bytes = size, "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        validate_key(key)?;
        let path = object_path(key)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| self.map_error(key, e, Op::Get))?;
        result.bytes().await.map_err(|e| self.map_error(key, e, Op::Get))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        // object_store lists by path segment; narrow to the string prefix afterwards.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let dir_path = if dir.is_empty() { None } else { Some(object_path(dir)?) };

        let mut listing = self.store.list(dir_path.as_ref());
        let mut objects = Vec::new();
        while let Some(item) = listing.next().await {
            let meta = item.map_err(|e| self.map_error(prefix, e, Op::List))?;
            let key = meta.location.to_string();
            if !key.starts_with(prefix) {
                continue;
            }
            objects.push(ObjectInfo {
                key,
                size: meta.size as u64,
                last_modified: meta.last_modified,
            });
        }
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let path = object_path(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(self.map_error(key, e, Op::Delete)),
        }
    }
}
