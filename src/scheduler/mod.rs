//! Fires backup jobs on their cadence and records the outcome.
//!
//! A single background task owns a min-heap of upcoming fire times. Each
//! fire runs on its own tracked task, so a slow backup never holds up the
//! heap and `stop` can wait for in-flight runs to finish.

pub mod store;
pub mod trigger;

use chrono::{DateTime, Local, NaiveTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backup::{generate_backup_id, BackupService};
use crate::config::SchedulerConfig;
use crate::errors::{BackupError, Result};
use crate::models::{parse_time_of_day, BackupType, Cadence, Job, JobId, RunResult, RunStatus};

pub use store::{JobStore, MemoryJobStore, PgJobStore};
pub use trigger::{lateness, next_fire_after, Lateness};

struct Registration {
    cadence: Cadence,
    time_of_day: NaiveTime,
    generation: u64,
    next_fire: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    registrations: HashMap<JobId, Registration>,
    // (fire time, job, generation); entries whose generation no longer
    // matches the registration are stale and dropped when popped.
    heap: BinaryHeap<Reverse<(DateTime<Utc>, JobId, u64)>>,
    running: HashSet<JobId>,
    next_generation: u64,
}

struct Inner {
    service: BackupService,
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    state: Mutex<State>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    tracker: TaskTracker,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; every clone drives the same schedule.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(service: BackupService, store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Scheduler {
            inner: Arc::new(Inner {
                service,
                store,
                config,
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                shutdown,
                tracker: TaskTracker::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Loads every enabled job from the store and starts firing them. A job
    /// with a bad cadence or time of day is logged and skipped. Calling
    /// `start` on a running scheduler does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut driver = self.inner.driver.lock().await;
        if driver.is_some() {
            debug!("scheduler already running");
            return Ok(());
        }

        let jobs = self.inner.store.list_jobs().await?;
        let now = Utc::now();
        let mut scheduled = 0;
        for job in jobs.into_iter().filter(|j| j.enabled) {
            match self.inner.register_loaded(&job, now).await {
                Ok(()) => scheduled += 1,
                Err(e) => error!(job_id = job.id, job = %job.name, error = %e, "job skipped"),
            }
        }

        self.inner.shutdown.send_replace(false);
        self.inner.tracker.reopen();
        let inner = self.inner.clone();
        *driver = Some(tokio::spawn(async move { inner.drive().await }));
        info!(scheduled, "scheduler started");
        Ok(())
    }

    /// Stops firing and waits for in-flight executions to finish.
    pub async fn stop(&self) {
        let handle = self.inner.driver.lock().await.take();
        self.inner.shutdown.send_replace(true);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }
        self.inner.tracker.close();
        info!(in_flight = self.inner.tracker.len(), "draining scheduled backups");
        self.inner.tracker.wait().await;
        info!("scheduler stopped");
    }

    /// Persists `job` and (re)registers its trigger, or deregisters it when
    /// the job is disabled. A job that fails validation is deregistered and
    /// the error returned.
    pub async fn add_or_update(&self, mut job: Job) -> Result<()> {
        if let Err(e) = job.validate() {
            self.inner.deregister(job.id).await;
            return Err(e);
        }
        if job.enabled {
            let (cadence, time_of_day) = self.inner.trigger_for(&job)?;
            let next = next_local_fire(cadence, time_of_day)?;
            job.next_run_at = Some(next);
            self.inner.store.upsert_job(&job).await?;
            self.inner.register(job.id, cadence, time_of_day, next).await;
            info!(job_id = job.id, job = %job.name, next_run_at = %next, "job scheduled");
        } else {
            job.next_run_at = None;
            self.inner.store.upsert_job(&job).await?;
            self.inner.deregister(job.id).await;
            info!(job_id = job.id, job = %job.name, "job disabled");
        }
        Ok(())
    }

    /// Deregisters the job's trigger. The stored job itself is left alone.
    pub async fn remove(&self, job_id: JobId) {
        self.inner.deregister(job_id).await;
        info!(job_id, "job removed from schedule");
    }

    /// Runs one job now and returns its final status. Fails with
    /// `TaskFailure` if the job is already running.
    pub async fn execute(&self, job_id: JobId) -> Result<RunStatus> {
        self.inner.execute(job_id).await
    }

    /// Manual trigger. Runs in the background under the same reentrancy
    /// guard as scheduled fires, and is drained by `stop`.
    pub fn run_now(&self, job_id: JobId) -> JoinHandle<Result<RunStatus>> {
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move { inner.execute(job_id).await })
    }

    /// Next planned fire for a registered job.
    pub async fn next_fire(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        let state = self.inner.state.lock().await;
        state.registrations.get(&job_id).map(|r| r.next_fire)
    }

    pub async fn scheduled_jobs(&self) -> Vec<JobId> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<JobId> = state.registrations.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn next_local_fire(cadence: Cadence, time_of_day: NaiveTime) -> Result<DateTime<Utc>> {
    Ok(next_fire_after(cadence, time_of_day, &Local::now())?.with_timezone(&Utc))
}

impl Inner {
    fn trigger_for(&self, job: &Job) -> Result<(Cadence, NaiveTime)> {
        let cadence = job.parsed_cadence()?;
        let time_of_day = parse_time_of_day(
            job.time_of_day
                .as_deref()
                .unwrap_or(&self.config.default_time_of_day),
        )?;
        Ok((cadence, time_of_day))
    }

    async fn register(&self, job_id: JobId, cadence: Cadence, time_of_day: NaiveTime, next_fire: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.next_generation += 1;
        let generation = state.next_generation;
        state.registrations.insert(
            job_id,
            Registration {
                cadence,
                time_of_day,
                generation,
                next_fire,
            },
        );
        state.heap.push(Reverse((next_fire, job_id, generation)));
        drop(state);
        self.wake.notify_one();
    }

    async fn deregister(&self, job_id: JobId) {
        let removed = self.state.lock().await.registrations.remove(&job_id).is_some();
        if removed {
            self.wake.notify_one();
        }
    }

    /// Registers a job read from the store at startup. A persisted
    /// `next_run_at` already in the past fires once immediately, however
    /// many intervals were missed.
    async fn register_loaded(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        job.validate()?;
        let (cadence, time_of_day) = self.trigger_for(job)?;
        let next = match job.next_run_at {
            Some(planned) if planned <= now => {
                match lateness(planned, now, self.grace()) {
                    Lateness::Misfired { missed_by } => warn!(
                        job_id = job.id,
                        job = %job.name,
                        %planned,
                        missed_minutes = missed_by.num_minutes(),
                        "missed fire, running one catch-up backup"
                    ),
                    Lateness::OnTime => debug!(job_id = job.id, %planned, "fire is due"),
                }
                now
            }
            _ => next_local_fire(cadence, time_of_day)?,
        };
        self.register(job.id, cadence, time_of_day, next).await;
        info!(job_id = job.id, job = %job.name, next_run_at = %next, "job scheduled");
        Ok(())
    }

    fn grace(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.misfire_grace).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    async fn drive(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let (due, next_deadline) = self.take_due(Utc::now()).await;
            for (job_id, planned) in due {
                self.fire(job_id, planned);
            }

            let sleep_for = next_deadline
                .map(|at| (at - Utc::now()).to_std().unwrap_or_default())
                .unwrap_or(std::time::Duration::from_secs(3600));
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!("scheduler loop exited");
    }

    /// Pops every due entry, plans each job's following fire from `now`
    /// (missed intervals are not replayed) and returns the due jobs plus the
    /// earliest remaining deadline.
    async fn take_due(&self, now: DateTime<Utc>) -> (Vec<(JobId, DateTime<Utc>)>, Option<DateTime<Utc>>) {
        let grace = self.grace();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut due = Vec::new();
        let mut replanned = Vec::new();

        while let Some(Reverse((at, job_id, generation))) = state.heap.peek().copied() {
            let current = state
                .registrations
                .get(&job_id)
                .is_some_and(|r| r.generation == generation && r.next_fire == at);
            if !current {
                state.heap.pop();
                continue;
            }
            if at > now {
                break;
            }
            state.heap.pop();
            if let Lateness::Misfired { missed_by } = lateness(at, now, grace) {
                warn!(job_id, planned = %at, missed_minutes = missed_by.num_minutes(), "coalescing missed fires into one run");
            }
            due.push((job_id, at));

            let Some(reg) = state.registrations.get_mut(&job_id) else {
                continue;
            };
            match next_fire_after(reg.cadence, reg.time_of_day, &now.with_timezone(&Local)) {
                Ok(next) => {
                    let next = next.with_timezone(&Utc);
                    reg.next_fire = next;
                    replanned.push(Reverse((next, job_id, reg.generation)));
                }
                Err(e) => {
                    error!(job_id, error = %e, "cannot plan next fire, job deregistered");
                    state.registrations.remove(&job_id);
                }
            }
        }
        state.heap.extend(replanned);

        let next_deadline = state.heap.peek().map(|Reverse((at, _, _))| *at);
        (due, next_deadline)
    }

    fn fire(self: &Arc<Self>, job_id: JobId, planned: DateTime<Utc>) {
        let inner = self.clone();
        self.tracker.spawn(async move {
            if !inner.claim(job_id).await {
                warn!(job_id, %planned, "previous run still in progress, skipping this fire");
                return;
            }
            debug!(job_id, %planned, "firing scheduled backup");
            match inner.execute_claimed(job_id).await {
                Ok(status) => info!(job_id, status = status.as_str(), "scheduled backup finished"),
                Err(e) => error!(job_id, error = %e, "scheduled backup failed"),
            }
        });
    }

    /// Reentrancy guard: false if the job is already running.
    async fn claim(&self, job_id: JobId) -> bool {
        self.state.lock().await.running.insert(job_id)
    }

    async fn execute(self: &Arc<Self>, job_id: JobId) -> Result<RunStatus> {
        if !self.claim(job_id).await {
            return Err(BackupError::TaskFailure(format!("job {} is already running", job_id)));
        }
        self.execute_claimed(job_id).await
    }

    /// Runs a claimed job on its own task and releases the claim afterwards,
    /// even if the run panicked.
    async fn execute_claimed(self: &Arc<Self>, job_id: JobId) -> Result<RunStatus> {
        let started_at = Utc::now();
        let inner = self.clone();
        let outcome = tokio::spawn(async move { inner.run_job(job_id).await }).await;
        self.state.lock().await.running.remove(&job_id);

        match outcome {
            Ok(result) => result,
            Err(e) => {
                let err = BackupError::TaskFailure(format!("job {} aborted: {}", job_id, e));
                error!(job_id, error = %err, "backup job panicked");
                self.record_aborted_run(job_id, started_at, &err).await;
                Err(err)
            }
        }
    }

    /// Leaves the same trail as a failed run when a job dies mid-flight:
    /// one failed RunLog row and a failed job status.
    async fn record_aborted_run(&self, job_id: JobId, started_at: DateTime<Utc>, err: &BackupError) {
        let backup_type = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job.backup_type,
            _ => BackupType::Full,
        };
        let log = RunResult::failed(generate_backup_id(backup_type, started_at), backup_type, started_at, err)
            .to_run_log(Some(job_id));
        if let Err(store_err) = self.store.insert_run_log(&log).await {
            warn!(job_id, error = %store_err, "failed to write run log");
        }
        let next = self.planned_next_fire(job_id).await;
        if let Err(store_err) = self
            .store
            .record_job_status(job_id, RunStatus::Failed, Some(Utc::now()), next)
            .await
        {
            warn!(job_id, error = %store_err, "failed to record job status");
        }
    }

    async fn planned_next_fire(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.registrations.get(&job_id).map(|r| r.next_fire)
    }

    async fn run_job(&self, job_id: JobId) -> Result<RunStatus> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("job {}", job_id)))?;
        self.store
            .record_job_status(job_id, RunStatus::InProgress, None, None)
            .await?;
        info!(job_id, job = %job.name, backup_type = %job.backup_type, "backup job started");

        let results: Vec<RunResult> = match job.backup_type {
            BackupType::Sales => vec![self.service.backup_sales(None, None).await],
            BackupType::Inventory => vec![self.service.backup_inventory().await],
            BackupType::Full => {
                let aggregate = self.service.backup_all().await;
                vec![aggregate.sales, aggregate.inventory]
            }
        };

        for result in &results {
            if let Err(e) = self.store.insert_run_log(&result.to_run_log(Some(job_id))).await {
                error!(job_id, backup_id = %result.backup_id, error = %e, "failed to write run log");
            }
        }

        let status = if results.iter().all(RunResult::is_success) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let finished_at = Utc::now();
        // A job disabled or removed mid-run keeps whatever next_run_at it has now.
        let next = self.planned_next_fire(job_id).await;
        self.store
            .record_job_status(job_id, status, Some(finished_at), next)
            .await?;

        if status == RunStatus::Completed {
            let deletion = self.service.delete_old_backups(job.retention_days).await;
            if deletion.status != RunStatus::Completed {
                warn!(job_id, error = ?deletion.error, "retention cleanup after backup failed");
            }
        } else {
            warn!(job_id, job = %job.name, "backup job failed, retention cleanup skipped");
        }
        info!(job_id, job = %job.name, status = status.as_str(), "backup job finished");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataSource, Record};
    use crate::storage::LocalStorage;
    use async_trait::async_trait;

    struct EmptySource;

    #[async_trait]
    impl DataSource for EmptySource {
        async fn fetch_sales(&self, _: Option<DateTime<Utc>>, _: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }
        async fn fetch_sale_items(&self, _: Option<DateTime<Utc>>, _: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }
        async fn fetch_inventory(&self) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }
    }

    async fn scheduler(dir: &std::path::Path) -> (Scheduler, Arc<MemoryJobStore>) {
        let provider = Arc::new(LocalStorage::connect(dir).await.unwrap());
        let service = BackupService::new(provider, Arc::new(EmptySource));
        let store = Arc::new(MemoryJobStore::new());
        (Scheduler::new(service, store.clone(), SchedulerConfig::default()), store)
    }

    #[tokio::test]
    async fn add_or_update_registers_and_persists_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path()).await;
        scheduler
            .add_or_update(Job::new(1, "nightly", BackupType::Sales, Cadence::Daily))
            .await
            .unwrap();

        let next = scheduler.next_fire(1).await.unwrap();
        assert!(next > Utc::now());
        assert_eq!(store.get_job(1).await.unwrap().unwrap().next_run_at, Some(next));

        let mut disabled = store.get_job(1).await.unwrap().unwrap();
        disabled.enabled = false;
        scheduler.add_or_update(disabled).await.unwrap();
        assert!(scheduler.next_fire(1).await.is_none());
    }

    #[tokio::test]
    async fn bad_cadence_is_rejected_without_registering() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler(dir.path()).await;
        let mut job = Job::new(2, "odd", BackupType::Inventory, Cadence::Daily);
        job.cadence = "every-other-tuesday".into();
        let err = scheduler.add_or_update(job).await.unwrap_err();
        assert!(matches!(err, BackupError::ConfigurationError(_)));
        assert!(scheduler.scheduled_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn remove_deregisters_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler(dir.path()).await;
        scheduler
            .add_or_update(Job::new(3, "hourly", BackupType::Full, Cadence::Hourly))
            .await
            .unwrap();
        scheduler.remove(3).await;
        scheduler.remove(3).await;
        assert!(scheduler.scheduled_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn stale_heap_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler(dir.path()).await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        let t = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        scheduler.inner.register(7, Cadence::Daily, t, past).await;
        scheduler.inner.deregister(7).await;

        let (due, next) = scheduler.inner.take_due(Utc::now()).await;
        assert!(due.is_empty());
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn due_entry_is_replanned_into_the_future() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler(dir.path()).await;
        let long_ago = Utc::now() - chrono::Duration::days(3);
        let t = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        scheduler.inner.register(8, Cadence::Hourly, t, long_ago).await;

        let now = Utc::now();
        let (due, next) = scheduler.inner.take_due(now).await;
        assert_eq!(due, vec![(8, long_ago)]);
        let next = next.unwrap();
        assert!(next > now && next <= now + chrono::Duration::hours(1));
    }
}
