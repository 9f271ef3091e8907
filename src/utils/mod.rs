pub mod process;

use std::path::PathBuf;
use url::Url;
use which::which;

use crate::errors::{BackupError, Result};

/// Finds a PostgreSQL client tool (`pg_dump`, `psql`) in the system PATH.
pub fn find_pg_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        BackupError::config(format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        ))
    })
}

/// Database name taken from the path of a `postgres://` URL.
pub fn database_name(db_url: &str) -> Result<String> {
    let parsed = Url::parse(db_url).map_err(|e| BackupError::config(format!("invalid database URL: {}", e)))?;
    let name = parsed.path().trim_start_matches('/').to_string();
    if name.is_empty() || name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-') {
        return Err(BackupError::config(format!(
            "database URL must name a database (got '{}')",
            name
        )));
    }
    Ok(name)
}

/// The URL with any password replaced, safe for log lines.
pub fn redact_url(db_url: &str) -> String {
    match Url::parse(db_url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_database_name() {
        assert_eq!(database_name("postgres://u:p@localhost:5432/pos_prod").unwrap(), "pos_prod");
        assert!(database_name("postgres://u:p@localhost:5432/").is_err());
        assert!(database_name("not a url").is_err());
    }

    #[test]
    fn redacts_passwords() {
        let redacted = redact_url("postgres://admin:hunter2@db:5432/pos");
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.contains("admin"));
        assert_eq!(redact_url("postgres://db/pos"), "postgres://db/pos");
    }
}
