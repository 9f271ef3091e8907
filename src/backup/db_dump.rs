// posbackup/src/backup/db_dump.rs
use chrono::{Duration, Local, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::DumpConfig;
use crate::errors::{BackupError, Result};
use crate::storage::{LocalStorage, ObjectInfo, StorageProvider, Sweep};
use crate::utils::process::{run_supervised, EXTERNAL_PROCESS_TIMEOUT};
use crate::utils::{database_name, find_pg_executable, redact_url};

/// File name prefix shared by every dump of `db_name`.
pub fn dump_prefix(db_name: &str) -> String {
    format!("{}_backup_", db_name)
}

fn is_dump_file(name: &str) -> bool {
    name.contains("_backup_") && (name.ends_with(".sql") || name.ends_with(".sql.gz"))
}

/// Snapshots the whole database with `pg_dump`, gzips it unless told not
/// to, and then prunes local dumps older than the retention window.
pub async fn dump_database(config: &DumpConfig) -> Result<PathBuf> {
    if config.retention_days == 0 {
        return Err(BackupError::config("retention days must be positive"));
    }
    let db_name = database_name(&config.db_url)?;
    let pg_dump_path = find_pg_executable("pg_dump")?;
    tokio::fs::create_dir_all(&config.backup_path).await?;

    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let sql_path = config
        .backup_path
        .join(format!("{}{}.sql", dump_prefix(&db_name), timestamp));

    info!(
        database = %db_name,
        url = %redact_url(&config.db_url),
        target = %sql_path.display(),
        "running pg_dump"
    );
    let mut cmd = Command::new(&pg_dump_path);
    cmd.arg("--no-owner")
        .arg("--no-acl")
        .arg("--format=plain")
        .arg("-f")
        .arg(&sql_path)
        .arg(&config.db_url);
    if let Err(e) = run_supervised(cmd, "pg_dump", EXTERNAL_PROCESS_TIMEOUT).await {
        let _ = tokio::fs::remove_file(&sql_path).await;
        return Err(e);
    }

    let final_path = if config.compress {
        let gz_path = compress_file(&sql_path).await?;
        tokio::fs::remove_file(&sql_path).await?;
        gz_path
    } else {
        sql_path
    };
    info!(path = %final_path.display(), "✓ database dump written");

    let sweep = prune_old_dumps(&config.backup_path, &db_name, config.retention_days).await?;
    if sweep.deleted > 0 {
        info!(removed = sweep.deleted, retention_days = config.retention_days, "removed expired dumps");
    }
    if sweep.failed > 0 {
        warn!(failed = sweep.failed, "some expired dumps could not be removed");
    }
    Ok(final_path)
}

/// Gzips `source` into `source.gz` with flate2.
pub async fn compress_file(source: &Path) -> Result<PathBuf> {
    let mut target = source.as_os_str().to_os_string();
    target.push(".gz");
    let target = PathBuf::from(target);
    let (src, dst) = (source.to_path_buf(), target.clone());
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut reader = BufReader::new(File::open(&src)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&dst)?), Compression::default());
        std::io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| BackupError::TaskFailure(e.to_string()))??;
    Ok(target)
}

/// Retention for local dumps reuses the storage layer's age comparison.
pub async fn prune_old_dumps(backup_path: &Path, db_name: &str, retention_days: u32) -> Result<Sweep> {
    let store = LocalStorage::connect(backup_path).await?;
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    store.delete_older_than(&dump_prefix(db_name), cutoff).await
}

/// Dump files directly inside `backup_path`, newest first.
pub async fn list_dumps(backup_path: &Path) -> Result<Vec<ObjectInfo>> {
    if !tokio::fs::try_exists(backup_path).await.unwrap_or(false) {
        warn!(path = %backup_path.display(), "backup directory does not exist");
        return Ok(Vec::new());
    }
    let store = LocalStorage::connect(backup_path).await?;
    let mut dumps: Vec<ObjectInfo> = store
        .list("")
        .await?
        .into_iter()
        .filter(|obj| !obj.key.contains('/') && is_dump_file(&obj.key))
        .collect();
    dumps.sort_by(|a, b| b.last_modified.cmp(&a.last_modified).then_with(|| b.key.cmp(&a.key)));
    Ok(dumps)
}
