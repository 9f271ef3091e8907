pub mod codec;
pub mod db_dump;
pub mod service;

use std::path::PathBuf;
use tracing::info;

use crate::config::DumpConfig;
use crate::errors::Result;

pub use codec::{decode, encode, Envelope, SCHEMA_VERSION};
pub use service::{artifact_key, generate_backup_id, items_key, BackupService};

/// Entry point for the command-line `backup` subcommand: a full `pg_dump`
/// snapshot written under the configured backup directory.
pub async fn run_backup_flow(config: &DumpConfig) -> Result<PathBuf> {
    info!(
        backup_path = %config.backup_path.display(),
        retention_days = config.retention_days,
        compress = config.compress,
        "starting database backup"
    );
    db_dump::dump_database(config).await
}
