// posbackup/src/config/mod.rs
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{BackupError, Result};
use crate::models::{parse_time_of_day, DEFAULT_TIME_OF_DAY};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_S3_ACCESS_KEY_ID: &str = "POSBACKUP_S3_ACCESS_KEY_ID";
pub const ENV_S3_SECRET_ACCESS_KEY: &str = "POSBACKUP_S3_SECRET_ACCESS_KEY";
pub const ENV_GCS_SERVICE_ACCOUNT: &str = "GOOGLE_SERVICE_ACCOUNT_PATH";
pub const ENV_AZURE_ACCOUNT: &str = "AZURE_STORAGE_ACCOUNT";
pub const ENV_AZURE_ACCESS_KEY: &str = "AZURE_STORAGE_ACCESS_KEY";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStorageConfig {
    pub provider: Option<String>,
    pub local_path: Option<PathBuf>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub folder_prefix: Option<String>,
    pub service_account_path: Option<PathBuf>,
    pub account: Option<String>,
    pub container: Option<String>,
    pub access_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSchedulerConfig {
    pub misfire_grace_seconds: Option<u64>,
    pub default_time_of_day: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub storage: Option<RawStorageConfig>,
    pub scheduler: Option<RawSchedulerConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq)]
pub struct LocalConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GcsConfig {
    pub bucket: String,
    pub service_account_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    pub access_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageConfig {
    Local(LocalConfig),
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub misfire_grace: Duration,
    pub default_time_of_day: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            misfire_grace: Duration::from_secs(60),
            default_time_of_day: DEFAULT_TIME_OF_DAY.to_string(),
        }
    }
}

/// Options for a full-database `pg_dump` snapshot taken by the command-line tool.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpConfig {
    pub db_url: String,
    pub backup_path: PathBuf,
    pub retention_days: u32,
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreConfig {
    pub backup_file: PathBuf,
    pub target_db_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Reads `config_path`, then lets environment variables override credentials.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            BackupError::config(format!(
                "failed to read config file at {}: {}",
                config_path.display(),
                e
            ))
        })?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).map_err(|e| {
            BackupError::config(format!(
                "failed to parse JSON from config file at {}: {}",
                config_path.display(),
                e
            ))
        })?;
        Self::from_raw(raw, |name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    pub fn from_raw<F>(raw: RawJsonConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage = parse_storage_config(raw.storage.unwrap_or_default(), &env)?;
        let scheduler = parse_scheduler_config(raw.scheduler.unwrap_or_default())?;
        let database_url = env(ENV_DATABASE_URL).or(raw.database_url).filter(|s| !s.is_empty());
        Ok(AppConfig {
            database_url,
            storage,
            scheduler,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn required(value: Option<String>, field: &str, provider: &str) -> Result<String> {
    non_empty(value).ok_or_else(|| {
        BackupError::config(format!(
            "storage.{} must be set in config.json for the '{}' provider",
            field, provider
        ))
    })
}

fn parse_storage_config<F>(raw: RawStorageConfig, env: &F) -> Result<StorageConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let provider = non_empty(raw.provider).unwrap_or_else(|| "local".to_string());
    match provider.to_ascii_lowercase().as_str() {
        "local" => {
            let root = raw.local_path.unwrap_or_else(|| PathBuf::from("./backups"));
            if root.as_os_str().is_empty() {
                return Err(BackupError::config("storage.local_path cannot be empty"));
            }
            Ok(StorageConfig::Local(LocalConfig { root }))
        }
        "s3" => {
            let access_key_id = env(ENV_S3_ACCESS_KEY_ID).or(non_empty(raw.access_key_id));
            let secret_access_key = env(ENV_S3_SECRET_ACCESS_KEY).or(non_empty(raw.secret_access_key));
            if access_key_id.is_some() != secret_access_key.is_some() {
                return Err(BackupError::config(
                    "S3 access_key_id and secret_access_key must be supplied together",
                ));
            }
            Ok(StorageConfig::S3(S3Config {
                bucket: required(raw.bucket, "bucket", "s3")?,
                region: non_empty(raw.region).unwrap_or_else(|| "us-east-1".to_string()),
                endpoint_url: non_empty(raw.endpoint_url),
                access_key_id,
                secret_access_key,
                folder_prefix: non_empty(raw.folder_prefix),
            }))
        }
        "gcs" | "gcp" => Ok(StorageConfig::Gcs(GcsConfig {
            bucket: required(raw.bucket, "bucket", "gcs")?,
            service_account_path: env(ENV_GCS_SERVICE_ACCOUNT)
                .map(PathBuf::from)
                .or(raw.service_account_path),
        })),
        "azure" => Ok(StorageConfig::Azure(AzureConfig {
            account: required(env(ENV_AZURE_ACCOUNT).or(raw.account), "account", "azure")?,
            container: required(raw.container, "container", "azure")?,
            access_key: env(ENV_AZURE_ACCESS_KEY).or(non_empty(raw.access_key)),
        })),
        other => Err(BackupError::config(format!(
            "unknown storage provider '{}', expected one of local, s3, gcs, azure",
            other
        ))),
    }
}

fn parse_scheduler_config(raw: RawSchedulerConfig) -> Result<SchedulerConfig> {
    let defaults = SchedulerConfig::default();
    let default_time_of_day = non_empty(raw.default_time_of_day).unwrap_or(defaults.default_time_of_day);
    parse_time_of_day(&default_time_of_day)?;
    Ok(SchedulerConfig {
        misfire_grace: raw
            .misfire_grace_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.misfire_grace),
        default_time_of_day,
    })
}
