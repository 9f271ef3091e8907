use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use super::{validate_key, ObjectInfo, StorageProvider};
use crate::errors::{BackupError, Result};

/// Stores objects as files below a root directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Creates the root directory if needed. Failure leaves no provider.
    pub async fn connect(root: &Path) -> Result<Self> {
        if root.as_os_str().is_empty() {
            return Err(BackupError::ProviderUnavailable(
                "local storage root must not be empty".into(),
            ));
        }
        fs::create_dir_all(root).await.map_err(|e| {
            BackupError::ProviderUnavailable(format!(
                "failed to create storage directory {}: {}",
                root.display(),
                e
            ))
        })?;
        let meta = fs::metadata(root).await.map_err(|e| {
            BackupError::ProviderUnavailable(format!("cannot stat {}: {}", root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(BackupError::ProviderUnavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackupError::upload(key, e))?;
        }
        // Write beside the target and rename so readers never see a partial file.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &data)
            .await
            .map_err(|e| BackupError::upload(key, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| BackupError::upload(key, e))?;
        debug!(key, bytes = data.len(), "wrote local object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackupError::NotFound(key.to_string())),
            Err(e) => Err(BackupError::download(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let owned = prefix.to_string();
        tokio::task::spawn_blocking(move || list_blocking(&root, &owned))
            .await
            .map_err(|e| BackupError::download(prefix, e))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::delete(key, e)),
        }
    }
}

fn list_blocking(root: &Path, prefix: &str) -> Result<Vec<ObjectInfo>> {
    // Only descend into the directory part of the prefix.
    let dir_part = match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    };
    let start = root.join(dir_part);
    if !start.exists() {
        return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(&start) {
        let entry = entry.map_err(|e| BackupError::download(prefix, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !key.starts_with(prefix) || key.ends_with(".partial") {
            continue;
        }
        let meta = entry.metadata().map_err(|e| BackupError::download(&key, e))?;
        let modified = meta.modified().map_err(|e| BackupError::download(&key, e))?;
        objects.push(ObjectInfo {
            key,
            size: meta.len(),
            last_modified: DateTime::<Utc>::from(modified),
        });
    }
    Ok(objects)
}
