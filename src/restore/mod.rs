pub mod db_restore;
pub mod verification;

use tracing::info;

use crate::config::RestoreConfig;
use crate::errors::Result;

/// Entry point for the command-line `restore` subcommand.
pub async fn run_restore_flow(config: &RestoreConfig) -> Result<()> {
    info!(backup_file = %config.backup_file.display(), "starting database restore");
    db_restore::restore_dump(config).await
}
