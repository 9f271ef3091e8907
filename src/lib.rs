//! Backup and recovery for the point-of-sale database.
//!
//! The library side holds the storage backends, the artifact codec, the
//! backup service and the job scheduler. The `posbackup` binary is a thin
//! command-line wrapper around it.

pub mod backup;
pub mod config;
pub mod data;
pub mod errors;
pub mod models;
pub mod restore;
pub mod scheduler;
pub mod storage;
pub mod utils;

pub use backup::BackupService;
pub use errors::{BackupError, Result};
pub use scheduler::Scheduler;
