mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use common::{service, FakeDataSource, MemoryStorage};
use posbackup::config::SchedulerConfig;
use posbackup::errors::BackupError;
use posbackup::errors::Result;
use posbackup::models::{BackupType, Cadence, Job, JobId, RunLog, RunStatus};
use posbackup::scheduler::{JobStore, MemoryJobStore, Scheduler};

/// Delegates to a `MemoryJobStore` but panics when a run is marked as
/// started, so the job dies outside the backup service.
struct PanicOnStartStore(MemoryJobStore);

#[async_trait]
impl JobStore for PanicOnStartStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.0.list_jobs().await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.0.get_job(id).await
    }

    async fn upsert_job(&self, job: &Job) -> Result<()> {
        self.0.upsert_job(job).await
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        self.0.delete_job(id).await
    }

    async fn record_job_status(
        &self,
        id: JobId,
        status: RunStatus,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if status == RunStatus::InProgress {
            panic!("status table is gone");
        }
        self.0.record_job_status(id, status, last_run_at, next_run_at).await
    }

    async fn insert_run_log(&self, log: &RunLog) -> Result<()> {
        self.0.insert_run_log(log).await
    }

    async fn list_run_logs(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<RunLog>> {
        self.0.list_run_logs(job_id, limit).await
    }
}

fn setup(data: FakeDataSource) -> (Scheduler, Arc<MemoryJobStore>, Arc<MemoryStorage>, Arc<FakeDataSource>) {
    let storage = MemoryStorage::new();
    let data = Arc::new(data);
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = Scheduler::new(
        service(storage.clone(), data.clone()),
        store.clone(),
        SchedulerConfig::default(),
    );
    (scheduler, store, storage, data)
}

#[tokio::test]
async fn execute_records_the_run_and_updates_the_job() {
    let (scheduler, store, storage, _) = setup(FakeDataSource::with_rows(150, 0));
    scheduler
        .add_or_update(Job::new(1, "nightly-sales", BackupType::Sales, Cadence::Daily))
        .await
        .unwrap();

    let status = scheduler.execute(1).await.unwrap();
    assert_eq!(status, RunStatus::Completed);

    let logs = store.list_run_logs(Some(1), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].record_count, 150);
    assert_eq!(logs[0].status, RunStatus::Completed);
    let key = logs[0].object_key.clone().unwrap();
    assert!(storage.raw(&key).is_some());

    let job = store.get_job(1).await.unwrap().unwrap();
    assert_eq!(job.last_run_status, Some(RunStatus::Completed));
    assert!(job.last_run_at.is_some());
    assert!(job.next_run_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn full_job_writes_a_log_per_branch_and_fails_if_either_fails() {
    let data = FakeDataSource::with_rows(3, 3);
    data.fail_sales.store(true, Ordering::SeqCst);
    let (scheduler, store, _, _) = setup(data);
    scheduler
        .add_or_update(Job::new(2, "weekly-full", BackupType::Full, Cadence::Weekly))
        .await
        .unwrap();

    assert_eq!(scheduler.execute(2).await.unwrap(), RunStatus::Failed);
    let logs = store.list_run_logs(Some(2), 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs.iter().filter(|l| l.status == RunStatus::Failed).count(), 1);
    assert_eq!(
        store.get_job(2).await.unwrap().unwrap().last_run_status,
        Some(RunStatus::Failed)
    );
}

#[tokio::test]
async fn retention_runs_only_after_a_successful_backup() {
    let data = FakeDataSource::with_rows(1, 1);
    data.fail_inventory.store(true, Ordering::SeqCst);
    let (scheduler, _, storage, data) = setup(data);
    storage.insert_aged("backups/inventory/inventory_ancient.json.gz", b"x", Duration::days(60));

    let mut job = Job::new(3, "inventory", BackupType::Inventory, Cadence::Daily);
    job.retention_days = 30;
    scheduler.add_or_update(job).await.unwrap();

    assert_eq!(scheduler.execute(3).await.unwrap(), RunStatus::Failed);
    assert!(storage.raw("backups/inventory/inventory_ancient.json.gz").is_some());

    data.fail_inventory.store(false, Ordering::SeqCst);
    assert_eq!(scheduler.execute(3).await.unwrap(), RunStatus::Completed);
    assert!(storage.raw("backups/inventory/inventory_ancient.json.gz").is_none());
}

#[tokio::test]
async fn overlapping_runs_of_the_same_job_are_refused() {
    let mut data = FakeDataSource::with_rows(1, 0);
    data.delay_ms = 300;
    let (scheduler, store, _, _) = setup(data);
    scheduler
        .add_or_update(Job::new(4, "slow", BackupType::Sales, Cadence::Hourly))
        .await
        .unwrap();

    let first = scheduler.run_now(4);
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    let second = scheduler.execute(4).await;
    assert!(matches!(second, Err(BackupError::TaskFailure(_))));

    assert_eq!(first.await.unwrap().unwrap(), RunStatus::Completed);
    assert_eq!(store.list_run_logs(Some(4), 10).await.unwrap().len(), 1);

    // The guard is released once the run is over.
    assert_eq!(scheduler.execute(4).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn one_failing_job_does_not_disturb_another() {
    let data = FakeDataSource::with_rows(2, 2);
    data.fail_sales.store(true, Ordering::SeqCst);
    let (scheduler, store, _, _) = setup(data);
    scheduler
        .add_or_update(Job::new(5, "sales", BackupType::Sales, Cadence::Daily))
        .await
        .unwrap();
    scheduler
        .add_or_update(Job::new(6, "inventory", BackupType::Inventory, Cadence::Daily))
        .await
        .unwrap();

    assert_eq!(scheduler.execute(5).await.unwrap(), RunStatus::Failed);
    assert_eq!(scheduler.execute(6).await.unwrap(), RunStatus::Completed);
    assert_eq!(scheduler.scheduled_jobs().await, vec![5, 6]);
    assert_eq!(
        store.get_job(6).await.unwrap().unwrap().last_run_status,
        Some(RunStatus::Completed)
    );
}

#[tokio::test]
async fn start_skips_bad_jobs_and_catches_up_a_missed_fire_once() {
    let (scheduler, store, _, _) = setup(FakeDataSource::with_rows(0, 4));

    let mut missed = Job::new(7, "missed-inventory", BackupType::Inventory, Cadence::Hourly);
    missed.next_run_at = Some(Utc::now() - Duration::hours(6));
    store.upsert_job(&missed).await.unwrap();

    let mut broken = Job::new(8, "broken", BackupType::Sales, Cadence::Daily);
    broken.cadence = "sometimes".into();
    store.upsert_job(&broken).await.unwrap();

    let mut disabled = Job::new(9, "off", BackupType::Sales, Cadence::Daily);
    disabled.enabled = false;
    store.upsert_job(&disabled).await.unwrap();

    scheduler.start().await.unwrap();
    assert_eq!(scheduler.scheduled_jobs().await, vec![7]);

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    loop {
        let logs = store.list_run_logs(Some(7), 10).await.unwrap();
        if !logs.is_empty() {
            assert_eq!(logs.len(), 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "catch-up run never fired");
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    scheduler.stop().await;
    assert_eq!(store.list_run_logs(Some(7), 10).await.unwrap().len(), 1);
    assert!(scheduler.next_fire(7).await.unwrap() > Utc::now());
}

#[tokio::test]
async fn stop_waits_for_in_flight_runs() {
    let mut data = FakeDataSource::with_rows(3, 0);
    data.delay_ms = 200;
    let (scheduler, store, _, _) = setup(data);
    scheduler
        .add_or_update(Job::new(10, "drain-me", BackupType::Sales, Cadence::Daily))
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    let _run = scheduler.run_now(10);
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    scheduler.stop().await;

    let logs = store.list_run_logs(Some(10), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Completed);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let (scheduler, _, _, _) = setup(FakeDataSource::default());
    assert!(matches!(scheduler.execute(404).await, Err(BackupError::NotFound(_))));
}

#[tokio::test]
async fn panicking_inventory_source_is_logged_as_a_failed_run() {
    let data = FakeDataSource::with_rows(0, 5);
    data.panic_inventory.store(true, Ordering::SeqCst);
    let (scheduler, store, storage, _) = setup(data);
    scheduler
        .add_or_update(Job::new(11, "inventory", BackupType::Inventory, Cadence::Daily))
        .await
        .unwrap();

    assert_eq!(scheduler.execute(11).await.unwrap(), RunStatus::Failed);
    let logs = store.list_run_logs(Some(11), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Failed);
    assert_eq!(logs[0].backup_type, BackupType::Inventory);
    assert!(logs[0].error_message.as_deref().unwrap().contains("panicked"));
    assert!(storage.keys().is_empty());

    let job = store.get_job(11).await.unwrap().unwrap();
    assert_eq!(job.last_run_status, Some(RunStatus::Failed));
    assert_eq!(scheduler.scheduled_jobs().await, vec![11]);
}

#[tokio::test]
async fn job_that_dies_outside_the_service_still_leaves_a_failed_run_log() {
    let store = Arc::new(PanicOnStartStore(MemoryJobStore::new()));
    let scheduler = Scheduler::new(
        service(MemoryStorage::new(), Arc::new(FakeDataSource::with_rows(1, 1))),
        store.clone(),
        SchedulerConfig::default(),
    );
    scheduler
        .add_or_update(Job::new(12, "doomed", BackupType::Sales, Cadence::Daily))
        .await
        .unwrap();

    assert!(matches!(scheduler.execute(12).await, Err(BackupError::TaskFailure(_))));
    let logs = store.list_run_logs(Some(12), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Failed);
    assert_eq!(logs[0].backup_type, BackupType::Sales);
    assert!(logs[0].backup_id.starts_with("sales_"));

    let job = store.get_job(12).await.unwrap().unwrap();
    assert_eq!(job.last_run_status, Some(RunStatus::Failed));
    assert!(job.last_run_at.is_some());

    // The reentrancy guard is released after the panic.
    assert!(matches!(scheduler.execute(12).await, Err(BackupError::TaskFailure(_))));
    assert_eq!(store.list_run_logs(Some(12), 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn job_disabled_mid_run_is_not_rescheduled() {
    let mut data = FakeDataSource::with_rows(2, 0);
    data.delay_ms = 300;
    let (scheduler, store, _, _) = setup(data);
    let job = Job::new(13, "switch-off", BackupType::Sales, Cadence::Hourly);
    scheduler.add_or_update(job.clone()).await.unwrap();

    let run = scheduler.run_now(13);
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    let mut disabled = job;
    disabled.enabled = false;
    scheduler.add_or_update(disabled).await.unwrap();

    assert_eq!(run.await.unwrap().unwrap(), RunStatus::Completed);
    let stored = store.get_job(13).await.unwrap().unwrap();
    assert!(!stored.enabled);
    assert_eq!(stored.next_run_at, None);
    assert_eq!(stored.last_run_status, Some(RunStatus::Completed));
    assert!(scheduler.next_fire(13).await.is_none());
    assert!(scheduler.scheduled_jobs().await.is_empty());
}
