// posbackup/src/restore/db_restore.rs
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use super::verification;
use crate::backup::codec::gunzip;
use crate::config::RestoreConfig;
use crate::errors::{BackupError, Result};
use crate::utils::process::{run_supervised, EXTERNAL_PROCESS_TIMEOUT};
use crate::utils::{find_pg_executable, redact_url};

/// Replays a `pg_dump` file (plain or gzipped) into the target database
/// with `psql`. The dump is verified first; a dump that fails verification
/// is never applied.
pub async fn restore_dump(config: &RestoreConfig) -> Result<()> {
    let source = &config.backup_file;
    if !tokio::fs::try_exists(source).await.unwrap_or(false) {
        return Err(BackupError::NotFound(source.display().to_string()));
    }
    if !verification::verify_file(source).await {
        return Err(BackupError::VerificationFailure(format!(
            "{} is not a readable SQL dump",
            source.display()
        )));
    }

    let is_gzipped = source.extension().is_some_and(|ext| ext == "gz");
    let sql_path = if is_gzipped {
        decompress_to_temp(source).await?
    } else {
        source.clone()
    };

    let outcome = execute_sql_file(&config.target_db_url, &sql_path).await;

    if is_gzipped {
        if let Err(e) = tokio::fs::remove_file(&sql_path).await {
            warn!(path = %sql_path.display(), error = %e, "failed to remove temporary restore file");
        }
    }
    outcome
}

async fn decompress_to_temp(source: &Path) -> Result<PathBuf> {
    let compressed = tokio::fs::read(source).await?;
    let sql = tokio::task::spawn_blocking(move || gunzip(&compressed))
        .await
        .map_err(|e| BackupError::TaskFailure(e.to_string()))??;
    let temp_path = std::env::temp_dir().join(format!("posbackup_restore_{}.sql", Uuid::new_v4()));
    tokio::fs::write(&temp_path, sql).await?;
    Ok(temp_path)
}

async fn execute_sql_file(target_db_url: &str, sql_file_path: &Path) -> Result<()> {
    let psql_path = find_pg_executable("psql")?;
    info!(
        file = %sql_file_path.display(),
        target = %redact_url(target_db_url),
        "executing SQL file with psql"
    );

    let mut cmd = Command::new(psql_path);
    cmd.arg("-X")
        .arg("-q")
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        .arg("-d")
        .arg(target_db_url)
        .arg("-f")
        .arg(sql_file_path);
    run_supervised(cmd, "psql", EXTERNAL_PROCESS_TIMEOUT).await?;

    info!(file = %sql_file_path.display(), "✓ restore applied");
    Ok(())
}
