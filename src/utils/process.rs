// posbackup/src/utils/process.rs
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

use crate::errors::{BackupError, Result};

/// Wall-clock budget for external dump and restore tools.
pub const EXTERNAL_PROCESS_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Runs a child process to completion with stdout and stderr captured
/// separately.
///
/// The child is killed if `limit` elapses or if the returned future is
/// dropped, so it is never left running behind its parent.
pub async fn run_supervised(mut cmd: Command, what: &str, limit: Duration) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| BackupError::TaskFailure(format!("failed to start {}: {}", what, e)))?;
    debug!(what, pid = child.id(), "started external process");

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(output),
        Ok(Ok(output)) => Err(BackupError::Command {
            what: what.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
        Ok(Err(e)) => Err(BackupError::Io(e)),
        Err(_) => {
            error!(what, seconds = limit.as_secs(), "external process timed out and was killed");
            Err(BackupError::Timeout {
                what: what.to_string(),
                seconds: limit.as_secs(),
            })
        }
    }
}
