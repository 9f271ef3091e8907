//! Job definitions, run history rows and the structured results returned by
//! the backup service.

use chrono::{DateTime, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::backup::codec::Envelope;
use crate::errors::{BackupError, Result};

pub type JobId = i64;

pub const DEFAULT_TIME_OF_DAY: &str = "02:00";
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Sales,
    Inventory,
    Full,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Sales => "sales",
            BackupType::Inventory => "inventory",
            BackupType::Full => "full",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sales" => Ok(BackupType::Sales),
            "inventory" => Ok(BackupType::Inventory),
            "full" => Ok(BackupType::Full),
            other => Err(BackupError::config(format!("unknown backup type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for Cadence {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Cadence::Hourly),
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            "monthly" => Ok(Cadence::Monthly),
            other => Err(BackupError::config(format!("unrecognized cadence '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(BackupError::config(format!("unknown run status '{}'", other))),
        }
    }
}

/// A persisted backup schedule.
///
/// `cadence` and `time_of_day` are kept as written by the API boundary; they
/// are parsed when the job is scheduled so a bad value only skips that job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub backup_type: BackupType,
    pub cadence: String,
    pub time_of_day: Option<String>,
    pub retention_days: u32,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, name: impl Into<String>, backup_type: BackupType, cadence: Cadence) -> Self {
        let cadence = match cadence {
            Cadence::Hourly => "hourly",
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        };
        Job {
            id,
            name: name.into(),
            backup_type,
            cadence: cadence.to_string(),
            time_of_day: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            enabled: true,
            last_run_at: None,
            last_run_status: None,
            next_run_at: None,
        }
    }

    pub fn parsed_cadence(&self) -> Result<Cadence> {
        self.cadence.parse()
    }

    /// Time of day the job fires at, falling back to 02:00.
    pub fn parsed_time_of_day(&self) -> Result<NaiveTime> {
        parse_time_of_day(self.time_of_day.as_deref().unwrap_or(DEFAULT_TIME_OF_DAY))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BackupError::config("job name must not be empty"));
        }
        if self.retention_days == 0 {
            return Err(BackupError::config(format!(
                "job '{}': retention_days must be positive",
                self.name
            )));
        }
        self.parsed_cadence()?;
        self.parsed_time_of_day()?;
        Ok(())
    }
}

static TIME_OF_DAY: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^([01]\d|2[0-3]):([0-5]\d)$"));

/// Parses a strict `HH:MM` string.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    let re = TIME_OF_DAY
        .as_ref()
        .map_err(|e| BackupError::config(e.to_string()))?;
    let caps = re
        .captures(value.trim())
        .ok_or_else(|| BackupError::config(format!("invalid time of day '{}', expected HH:MM", value)))?;
    let hour: u32 = caps[1].parse().map_err(|_| BackupError::config(format!("invalid hour in '{}'", value)))?;
    let minute: u32 = caps[2].parse().map_err(|_| BackupError::config(format!("invalid minute in '{}'", value)))?;
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| BackupError::config(format!("invalid time of day '{}'", value)))
}

/// One row of execution history. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub backup_id: String,
    pub job_id: Option<JobId>,
    pub backup_type: BackupType,
    pub status: RunStatus,
    pub object_key: Option<String>,
    pub byte_size: u64,
    pub record_count: u64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of a single-artifact backup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub status: RunStatus,
    pub record_count: u64,
    pub object_key: Option<String>,
    pub items_key: Option<String>,
    pub byte_size: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    pub fn failed(
        backup_id: impl Into<String>,
        backup_type: BackupType,
        started_at: DateTime<Utc>,
        error: &BackupError,
    ) -> Self {
        RunResult {
            backup_id: backup_id.into(),
            backup_type,
            status: RunStatus::Failed,
            record_count: 0,
            object_key: None,
            items_key: None,
            byte_size: 0,
            error: Some(error.to_string()),
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn to_run_log(&self, job_id: Option<JobId>) -> RunLog {
        RunLog {
            backup_id: self.backup_id.clone(),
            job_id,
            backup_type: self.backup_type,
            status: self.status,
            object_key: self.object_key.clone(),
            byte_size: self.byte_size,
            record_count: self.record_count,
            error_message: self.error.clone(),
            started_at: self.started_at,
            completed_at: Some(self.completed_at),
        }
    }
}

/// Outcome of `backup_all`: both branches are always reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub status: RunStatus,
    pub successful_count: usize,
    pub failed_count: usize,
    pub sales: RunResult,
    pub inventory: RunResult,
}

impl AggregateResult {
    pub fn from_branches(sales: RunResult, inventory: RunResult) -> Self {
        let successful_count = [&sales, &inventory].iter().filter(|r| r.is_success()).count();
        let failed_count = 2 - successful_count;
        let status = if failed_count == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        AggregateResult {
            status,
            successful_count,
            failed_count,
            sales,
            inventory,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreResult {
    pub backup_id: String,
    pub status: RunStatus,
    pub envelope: Option<Envelope>,
    /// Line items stored next to a sales artifact, when present.
    pub items: Option<Envelope>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionResult {
    pub status: RunStatus,
    pub deleted_count: usize,
    /// Expired objects that could not be deleted; any makes the pass `Failed`.
    pub failed_count: usize,
    pub cutoff: DateTime<Utc>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn time_of_day_defaults_to_two_am() {
        let job = Job::new(1, "nightly", BackupType::Sales, Cadence::Daily);
        let t = job.parsed_time_of_day().unwrap();
        assert_eq!((t.hour(), t.minute()), (2, 0));
    }

    #[test]
    fn rejects_malformed_time_of_day() {
        for bad in ["24:00", "2:00", "12:60", "noon", ""] {
            assert!(parse_time_of_day(bad).is_err(), "{bad} should be rejected");
        }
        assert!(parse_time_of_day("23:59").is_ok());
    }

    #[test]
    fn time_of_day_parses_repeatedly_from_many_threads() {
        let handles: Vec<_> = (0..4)
            .map(|h| {
                std::thread::spawn(move || {
                    (0..60)
                        .map(|m| parse_time_of_day(&format!("{:02}:{:02}", h * 5, m)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for (h, handle) in handles.into_iter().enumerate() {
            let times = handle.join().unwrap();
            assert_eq!(times.len(), 60);
            assert_eq!(times[59], NaiveTime::from_hms_opt(h as u32 * 5, 59, 0).unwrap());
        }
    }

    #[test]
    fn unknown_cadence_is_a_configuration_error() {
        let mut job = Job::new(1, "odd", BackupType::Inventory, Cadence::Daily);
        job.cadence = "fortnightly".into();
        assert!(matches!(
            job.validate(),
            Err(BackupError::ConfigurationError(_))
        ));
    }

    #[test]
    fn zero_retention_is_rejected() {
        let mut job = Job::new(1, "keep-nothing", BackupType::Full, Cadence::Weekly);
        job.retention_days = 0;
        assert!(job.validate().is_err());
    }

    #[test]
    fn aggregate_counts_each_branch() {
        let now = Utc::now();
        let ok = RunResult {
            backup_id: "sales_x".into(),
            backup_type: BackupType::Sales,
            status: RunStatus::Completed,
            record_count: 3,
            object_key: Some("backups/sales/sales_x.json.gz".into()),
            items_key: None,
            byte_size: 10,
            error: None,
            started_at: now,
            completed_at: now,
        };
        let bad = RunResult::failed(
            "inventory_x",
            BackupType::Inventory,
            now,
            &BackupError::query("products", "boom"),
        );
        let agg = AggregateResult::from_branches(ok, bad);
        assert_eq!(agg.status, RunStatus::Failed);
        assert_eq!((agg.successful_count, agg.failed_count), (1, 1));
    }
}
