//! POS backup and restore tool
//!
//! Command-line interface for full-database snapshots, restores and the
//! scheduled backup daemon.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use posbackup::backup::{self, db_dump, BackupService};
use posbackup::config::{AppConfig, DumpConfig, RestoreConfig};
use posbackup::data::PgDataSource;
use posbackup::models::DEFAULT_RETENTION_DAYS;
use posbackup::restore::{self, verification};
use posbackup::scheduler::{PgJobStore, Scheduler};
use posbackup::utils::redact_url;

#[derive(Parser, Debug)]
#[command(name = "posbackup", version, about = "Backup and restore for the POS database")]
struct Cli {
    /// Path to config.json (storage backend and scheduler settings)
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a full pg_dump snapshot
    Backup {
        #[arg(long, env = "DATABASE_URL")]
        db_url: String,
        #[arg(long, default_value = "./backups")]
        backup_path: PathBuf,
        #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
        retention_days: u32,
        /// Keep the dump as plain SQL
        #[arg(long)]
        no_compress: bool,
    },
    /// Replay a snapshot into a database
    Restore {
        #[arg(long)]
        backup: PathBuf,
        #[arg(long, env = "DATABASE_URL")]
        db_url: Option<String>,
        /// Defaults to --db-url
        #[arg(long)]
        target_db: Option<String>,
    },
    /// List local snapshots, newest first
    List {
        #[arg(long, default_value = "./backups")]
        backup_path: PathBuf,
    },
    /// Check that a snapshot is readable
    Verify {
        #[arg(long)]
        backup: PathBuf,
    },
    /// Run the backup scheduler until interrupted
    Schedule {
        #[arg(long, env = "DATABASE_URL")]
        db_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Backup {
            db_url,
            backup_path,
            retention_days,
            no_compress,
        } => {
            let config = DumpConfig {
                db_url,
                backup_path,
                retention_days,
                compress: !no_compress,
            };
            let path = backup::run_backup_flow(&config).await.context("Backup process failed")?;
            println!("✅ Backup written to {}", path.display());
        }
        Command::Restore {
            backup,
            db_url,
            target_db,
        } => {
            let target_db_url = target_db
                .or(db_url)
                .context("Restore needs --target-db or --db-url (DATABASE_URL)")?;
            let config = RestoreConfig {
                backup_file: backup,
                target_db_url,
            };
            info!(target = %redact_url(&config.target_db_url), "restoring");
            restore::run_restore_flow(&config).await.context("Restore process failed")?;
            println!("✅ Restored {}", config.backup_file.display());
        }
        Command::List { backup_path } => {
            let dumps = db_dump::list_dumps(&backup_path)
                .await
                .with_context(|| format!("Failed to list backups in {}", backup_path.display()))?;
            if dumps.is_empty() {
                println!("No backups found in {}", backup_path.display());
            }
            let now = Utc::now();
            for dump in dumps {
                let age = now - dump.last_modified;
                println!(
                    "{:<50} {:>12} bytes  {}d {}h ago",
                    dump.key,
                    dump.size,
                    age.num_days(),
                    age.num_hours() % 24
                );
            }
        }
        Command::Verify { backup } => {
            if verification::verify_file(&backup).await {
                println!("✅ {} is valid", backup.display());
            } else {
                anyhow::bail!("{} failed verification", backup.display());
            }
        }
        Command::Schedule { db_url } => run_scheduler(&cli.config, db_url).await?,
    }
    Ok(())
}

async fn run_scheduler(config_path: &std::path::Path, db_url: Option<String>) -> Result<()> {
    let app_config = AppConfig::load_from_json(config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;
    let database_url = db_url
        .or(app_config.database_url.clone())
        .context("The scheduler needs --db-url, DATABASE_URL or database_url in config.json")?;
    info!(database = %redact_url(&database_url), "connecting to database");

    let data = PgDataSource::connect(&database_url)
        .await
        .context("Failed to connect to the database")?;
    let store = PgJobStore::new(data.pool().clone());
    store.ensure_schema().await.context("Failed to prepare job tables")?;

    let service = BackupService::connect(&app_config.storage, Arc::new(data)).await;
    if !service.is_ready() {
        anyhow::bail!("Storage provider is unavailable; see the log for details");
    }

    let scheduler = Scheduler::new(service, Arc::new(store), app_config.scheduler.clone());
    scheduler.start().await.context("Failed to start the scheduler")?;
    println!("⏰ Scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    scheduler.stop().await;
    Ok(())
}
