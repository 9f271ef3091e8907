// posbackup/src/restore/verification.rs
use std::path::Path;
use tracing::{debug, warn};

use crate::backup::codec::gunzip;
use crate::errors::{BackupError, Result};

/// First bytes of a plain-format `pg_dump` file.
pub const SQL_DUMP_MARKER: &str = "--";
/// Envelopes are JSON objects.
pub const JSON_MARKER: char = '{';

/// Checks that an artifact is readable and starts the way its name says it
/// should. Compressed artifacts are decompressed in full so a truncated
/// stream is caught; plain artifacts only have their first line inspected.
///
/// Never panics and never mutates anything; every problem becomes `false`.
pub fn verify_artifact(name: &str, bytes: &[u8]) -> bool {
    match check_artifact(name, bytes) {
        Ok(()) => {
            debug!(artifact = name, "artifact verified");
            true
        }
        Err(e) => {
            warn!(artifact = name, error = %e, "artifact failed verification");
            false
        }
    }
}

pub fn check_artifact(name: &str, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(BackupError::VerificationFailure(format!("{} is empty", name)));
    }
    match name.strip_suffix(".gz") {
        Some(inner_name) => {
            let content = gunzip(bytes)
                .map_err(|e| BackupError::VerificationFailure(format!("{}: {}", name, e)))?;
            check_marker(inner_name, leading_text(&content))
        }
        None => {
            let text = leading_text(bytes);
            let first_line = text.lines().next().unwrap_or("");
            check_marker(name, first_line)
        }
    }
}

/// Lossy view of at most the first 4 KiB, enough for any marker.
fn leading_text(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = bytes.len().min(4096);
    String::from_utf8_lossy(&bytes[..end])
}

fn check_marker(name: &str, text: impl AsRef<str>) -> Result<()> {
    let text = text.as_ref().trim_start();
    let ok = if name.ends_with(".json") {
        text.starts_with(JSON_MARKER)
    } else if name.ends_with(".sql") {
        text.starts_with(SQL_DUMP_MARKER)
    } else {
        !text.is_empty()
    };
    if ok {
        Ok(())
    } else {
        Err(BackupError::VerificationFailure(format!(
            "{} does not start with the expected marker",
            name
        )))
    }
}

/// Verifies a local artifact file; an unreadable file fails verification.
pub async fn verify_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match tokio::fs::read(path).await {
        Ok(bytes) => verify_artifact(&name, &bytes),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read artifact");
            false
        }
    }
}
