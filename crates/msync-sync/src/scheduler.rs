//! Tick-driven job scheduler with per-job single flight.
//!
//! One registry, guarded by a single mutex, holds every armed job plus the set of keys with a
//! run in flight. A background loop calls [`SyncScheduler::tick`] on a fixed period; each due job
//! is started as its own task. Manual triggers go through the same check-and-set, so a job never
//! has two overlapping runs no matter where they came from.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use msync_core::{ScopeType, SyncResult, SyncTrigger};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::orchestrator::JobRunner;

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("no {scope} sync job for project {project_id}")]
    JobNotFound { project_id: Uuid, scope: ScopeType },
    #[error("a {scope} sync is already running for project {project_id}")]
    AlreadyRunning { project_id: Uuid, scope: ScopeType },
    #[error("sync interval must be at least one minute, got {0}")]
    InvalidInterval(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub project_id: Uuid,
    pub scope: ScopeType,
}

impl JobKey {
    pub fn new(project_id: Uuid, scope: ScopeType) -> Self {
        Self { project_id, scope }
    }
}

/// Condensed outcome of the last run, kept on the job for status reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunSummary {
    pub run_id: Uuid,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub sheets: usize,
    pub failed_sheets: usize,
    pub total_inserted: usize,
    pub total_updated: usize,
    pub total_skipped: usize,
    pub error: Option<String>,
}

impl From<&SyncResult> for JobRunSummary {
    fn from(result: &SyncResult) -> Self {
        let sheets = result.per_sheet_results.len();
        Self {
            run_id: result.run_id,
            trigger: result.trigger,
            started_at: result.started_at,
            finished_at: result.finished_at,
            success: result.success,
            sheets,
            failed_sheets: sheets - result.sheets_synced(),
            total_inserted: result.total_inserted,
            total_updated: result.total_updated,
            total_skipped: result.total_skipped,
            error: result.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub project_id: Uuid,
    pub scope: ScopeType,
    pub interval_minutes: u32,
    pub running: bool,
    pub next_fire_at: DateTime<Utc>,
    pub last_result: Option<JobRunSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub fired: Vec<JobKey>,
    /// Due jobs pushed back one tick because their previous run is still going.
    pub skipped: Vec<JobKey>,
}

#[derive(Debug, Clone)]
struct SyncJob {
    interval_minutes: u32,
    next_fire_at: DateTime<Utc>,
    last_result: Option<JobRunSummary>,
    /// Bumped on every upsert so a stale run cannot re-arm a replaced job.
    generation: u64,
}

impl SyncJob {
    fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.interval_minutes))
    }
}

#[derive(Debug, Default)]
struct JobRegistry {
    jobs: BTreeMap<JobKey, SyncJob>,
    in_flight: HashSet<JobKey>,
    next_generation: u64,
}

impl JobRegistry {
    fn status(&self, key: JobKey, job: &SyncJob) -> JobStatus {
        JobStatus {
            project_id: key.project_id,
            scope: key.scope,
            interval_minutes: job.interval_minutes,
            running: self.in_flight.contains(&key),
            next_fire_at: job.next_fire_at,
            last_result: job.last_result.clone(),
        }
    }
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

struct SchedulerInner {
    registry: Mutex<JobRegistry>,
    loop_handle: Mutex<Option<LoopHandle>>,
    idle: Notify,
    runner: Arc<dyn JobRunner>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

impl SchedulerInner {
    fn registry(&self) -> MutexGuard<'_, JobRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.tick).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Records the run on its job and re-arms it, unless the job was removed or replaced.
    fn complete(&self, key: JobKey, generation: Option<u64>, result: &SyncResult) {
        let now = self.clock.now();
        let mut registry = self.registry();
        match (registry.jobs.get_mut(&key), generation) {
            (Some(job), Some(generation)) if job.generation == generation => {
                job.last_result = Some(JobRunSummary::from(result));
                job.next_fire_at = now + job.interval();
                debug!(project_id = %key.project_id, scope = %key.scope, next_fire_at = %job.next_fire_at, "job re-armed");
            }
            _ => debug!(project_id = %key.project_id, scope = %key.scope, "job gone or replaced; not re-arming"),
        }
    }
}

/// Clears the in-flight mark when a run ends, including by panic or cancellation.
struct InFlightGuard {
    inner: Arc<SchedulerInner>,
    key: JobKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now_idle = {
            let mut registry = self.inner.registry();
            registry.in_flight.remove(&self.key);
            registry.in_flight.is_empty()
        };
        if now_idle {
            self.inner.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    pub fn new(runner: Arc<dyn JobRunner>, clock: Arc<dyn Clock>, tick: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry: Mutex::new(JobRegistry::default()),
                loop_handle: Mutex::new(None),
                idle: Notify::new(),
                runner,
                clock,
                tick: if tick.is_zero() { DEFAULT_TICK } else { tick },
            }),
        }
    }

    pub fn tick_period(&self) -> Duration {
        self.inner.tick
    }

    /// Starts the tick loop. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut handle = self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(
            tick_loop(weak, self.inner.tick, shutdown_rx).instrument(tracing::info_span!("scheduler")),
        );
        *handle = Some(LoopHandle {
            shutdown,
            _task: task,
        });
        info!(tick_secs = self.inner.tick.as_secs(), "scheduler started");
    }

    /// Stops arming new runs. In-flight runs finish on their own; see [`Self::wait_idle`].
    pub fn stop(&self) {
        let handle = self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            info!("scheduler stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Creates or replaces a job and arms it at `now + interval`.
    pub fn upsert_job(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        interval_minutes: u32,
    ) -> Result<JobStatus, SchedulerError> {
        let first_fire_at =
            self.inner.clock.now() + chrono::Duration::minutes(i64::from(interval_minutes));
        self.upsert_job_at(project_id, scope, interval_minutes, first_fire_at)
    }

    /// Like [`Self::upsert_job`] but with an explicit first fire time (used when restoring).
    pub fn upsert_job_at(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        interval_minutes: u32,
        first_fire_at: DateTime<Utc>,
    ) -> Result<JobStatus, SchedulerError> {
        if interval_minutes == 0 {
            return Err(SchedulerError::InvalidInterval(interval_minutes));
        }
        let key = JobKey::new(project_id, scope);
        let mut registry = self.inner.registry();
        registry.next_generation += 1;
        let generation = registry.next_generation;
        let last_result = registry.jobs.get(&key).and_then(|j| j.last_result.clone());
        let job = SyncJob {
            interval_minutes,
            next_fire_at: first_fire_at,
            last_result,
            generation,
        };
        let status = registry.status(key, &job);
        registry.jobs.insert(key, job);
        info!(%project_id, %scope, interval_minutes, next_fire_at = %first_fire_at, "sync job armed");
        Ok(status)
    }

    /// Removes a job. A run already in flight completes but does not re-arm.
    pub fn remove_job(&self, project_id: Uuid, scope: ScopeType) -> Result<(), SchedulerError> {
        let key = JobKey::new(project_id, scope);
        match self.inner.registry().jobs.remove(&key) {
            Some(_) => {
                info!(%project_id, %scope, "sync job removed");
                Ok(())
            }
            None => Err(SchedulerError::JobNotFound { project_id, scope }),
        }
    }

    pub fn job_status(&self, project_id: Uuid, scope: ScopeType) -> Option<JobStatus> {
        let key = JobKey::new(project_id, scope);
        let registry = self.inner.registry();
        registry.jobs.get(&key).map(|job| registry.status(key, job))
    }

    pub fn list_jobs(&self) -> Vec<JobStatus> {
        let registry = self.inner.registry();
        registry
            .jobs
            .iter()
            .map(|(key, job)| registry.status(*key, job))
            .collect()
    }

    pub fn is_running(&self, project_id: Uuid, scope: ScopeType) -> bool {
        self.inner
            .registry()
            .in_flight
            .contains(&JobKey::new(project_id, scope))
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.registry().in_flight.len()
    }

    /// Evaluates every job once, starting a task for each due job that is not already running.
    pub fn tick(&self) -> TickOutcome {
        let now = self.inner.clock.now();
        let retry_at = now + self.inner.tick_delta();
        let mut outcome = TickOutcome::default();
        let mut to_start = Vec::new();
        {
            let mut registry = self.inner.registry();
            let JobRegistry {
                jobs, in_flight, ..
            } = &mut *registry;
            for (key, job) in jobs.iter_mut() {
                if job.next_fire_at > now {
                    continue;
                }
                if in_flight.contains(key) {
                    job.next_fire_at = retry_at;
                    outcome.skipped.push(*key);
                    continue;
                }
                in_flight.insert(*key);
                job.next_fire_at = now + job.interval();
                outcome.fired.push(*key);
                to_start.push((*key, job.generation));
            }
        }

        for key in &outcome.skipped {
            warn!(project_id = %key.project_id, scope = %key.scope, "previous run still in flight; fire skipped");
        }
        for (key, generation) in to_start {
            let guard = InFlightGuard {
                inner: self.inner.clone(),
                key,
            };
            drop(self.spawn_run(guard, Some(generation), SyncTrigger::Scheduled));
        }
        outcome
    }

    /// Runs a job now unless a run for it is already in flight.
    ///
    /// Works for projects without an armed job too; an armed job is re-armed from completion.
    pub async fn trigger_manual(
        &self,
        project_id: Uuid,
        scope: ScopeType,
    ) -> Result<SyncResult, SchedulerError> {
        let key = JobKey::new(project_id, scope);
        let generation = {
            let mut registry = self.inner.registry();
            if !registry.in_flight.insert(key) {
                return Err(SchedulerError::AlreadyRunning { project_id, scope });
            }
            registry.jobs.get(&key).map(|j| j.generation)
        };
        let guard = InFlightGuard {
            inner: self.inner.clone(),
            key,
        };

        let handle = self.spawn_run(guard, generation, SyncTrigger::Manual);
        match handle.await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(%project_id, %scope, error = %err, "manual sync task failed");
                Ok(SyncResult::aborted(
                    project_id,
                    scope,
                    SyncTrigger::Manual,
                    self.inner.clock.now(),
                    format!("sync task failed: {err}"),
                ))
            }
        }
    }

    fn spawn_run(
        &self,
        guard: InFlightGuard,
        generation: Option<u64>,
        trigger: SyncTrigger,
    ) -> JoinHandle<SyncResult> {
        let key = guard.key;
        let inner = self.inner.clone();
        let span = tracing::info_span!(
            "job_run",
            project_id = %key.project_id,
            scope = %key.scope,
            ?trigger
        );
        tokio::spawn(
            async move {
                let result = inner
                    .runner
                    .run_job(key.project_id, key.scope, trigger)
                    .await;
                inner.complete(key, generation, &result);
                drop(guard);
                result
            }
            .instrument(span),
        )
    }

    /// Resolves once no run is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn tick_loop(
    inner: Weak<SchedulerInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let outcome = SyncScheduler { inner }.tick();
                if !outcome.fired.is_empty() {
                    debug!(fired = outcome.fired.len(), skipped = outcome.skipped.len(), "tick");
                }
            }
        }
    }
    debug!("tick loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Semaphore;

    use crate::clock::ManualClock;

    /// Runner that blocks each run until the test releases a permit.
    struct GatedRunner {
        gate: Semaphore,
        started: AtomicUsize,
        finished: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl Default for GatedRunner {
        fn default() -> Self {
            Self {
                gate: Semaphore::new(0),
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }
    }

    impl GatedRunner {
        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run_job(&self, project_id: Uuid, scope: ScopeType, trigger: SyncTrigger) -> SyncResult {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            let mut result = SyncResult::aborted(project_id, scope, trigger, Utc::now(), "done");
            result.success = true;
            result.error = None;
            result
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn setup() -> (SyncScheduler, Arc<GatedRunner>, Arc<ManualClock>) {
        let runner = Arc::new(GatedRunner::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = SyncScheduler::new(runner.clone(), clock.clone(), DEFAULT_TICK);
        (scheduler, runner, clock)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn job_fires_once_after_interval() {
        let (scheduler, runner, clock) = setup();
        let p = Uuid::new_v4();
        let status = scheduler.upsert_job(p, ScopeType::Single, 60).unwrap();
        assert_eq!(status.next_fire_at, t0() + chrono::Duration::minutes(60));

        clock.set(t0() + chrono::Duration::minutes(59));
        assert!(scheduler.tick().fired.is_empty());

        clock.set(t0() + chrono::Duration::minutes(61));
        let outcome = scheduler.tick();
        assert_eq!(outcome.fired, vec![JobKey::new(p, ScopeType::Single)]);
        assert!(scheduler.tick().fired.is_empty());

        runner.release(1);
        scheduler.wait_idle().await;
        assert_eq!(runner.finished.load(Ordering::SeqCst), 1);

        let status = scheduler.job_status(p, ScopeType::Single).unwrap();
        assert!(!status.running);
        assert_eq!(
            status.next_fire_at,
            t0() + chrono::Duration::minutes(61 + 60)
        );
        assert!(status.last_result.unwrap().success);
    }

    #[tokio::test]
    async fn due_job_still_running_is_skipped_one_tick() {
        let (scheduler, runner, clock) = setup();
        let p = Uuid::new_v4();
        scheduler.upsert_job(p, ScopeType::Multi, 5).unwrap();

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(scheduler.tick().fired.len(), 1);
        settle().await;

        clock.advance(chrono::Duration::minutes(5));
        let outcome = scheduler.tick();
        assert!(outcome.fired.is_empty());
        assert_eq!(outcome.skipped, vec![JobKey::new(p, ScopeType::Multi)]);
        assert_eq!(
            scheduler.job_status(p, ScopeType::Multi).unwrap().next_fire_at,
            clock.now() + chrono::Duration::seconds(60)
        );

        runner.release(1);
        scheduler.wait_idle().await;
        assert_eq!(runner.started.load(Ordering::SeqCst), 1);
        assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_trigger_is_rejected_while_scheduled_run_is_in_flight() {
        let (scheduler, runner, clock) = setup();
        let p = Uuid::new_v4();
        scheduler.upsert_job(p, ScopeType::Single, 60).unwrap();
        clock.advance(chrono::Duration::minutes(60));
        scheduler.tick();
        settle().await;
        assert!(scheduler.is_running(p, ScopeType::Single));

        let err = scheduler.trigger_manual(p, ScopeType::Single).await.unwrap_err();
        assert_eq!(
            err,
            SchedulerError::AlreadyRunning {
                project_id: p,
                scope: ScopeType::Single
            }
        );

        runner.release(1);
        scheduler.wait_idle().await;
        runner.release(1);
        let result = scheduler.trigger_manual(p, ScopeType::Single).await.unwrap();
        assert_eq!(result.trigger, SyncTrigger::Manual);
        assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_manual_triggers_never_overlap() {
        let (scheduler, runner, _clock) = setup();
        let p = Uuid::new_v4();

        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.trigger_manual(p, ScopeType::Multi).await }
        });
        settle().await;
        assert!(scheduler.is_running(p, ScopeType::Multi));
        // Tick and second trigger race the first run; neither may start another.
        assert!(scheduler.tick().fired.is_empty());
        assert!(matches!(
            scheduler.trigger_manual(p, ScopeType::Multi).await,
            Err(SchedulerError::AlreadyRunning { .. })
        ));

        runner.release(1);
        assert!(first.await.unwrap().is_ok());
        assert_eq!(runner.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removed_job_is_not_rearmed_by_in_flight_run() {
        let (scheduler, runner, clock) = setup();
        let p = Uuid::new_v4();
        scheduler.upsert_job(p, ScopeType::Single, 10).unwrap();
        clock.advance(chrono::Duration::minutes(10));
        scheduler.tick();
        settle().await;

        scheduler.remove_job(p, ScopeType::Single).unwrap();
        runner.release(1);
        scheduler.wait_idle().await;

        assert_eq!(runner.finished.load(Ordering::SeqCst), 1);
        assert!(scheduler.job_status(p, ScopeType::Single).is_none());
        assert!(scheduler.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn replaced_job_keeps_its_own_fire_time() {
        let (scheduler, runner, clock) = setup();
        let p = Uuid::new_v4();
        scheduler.upsert_job(p, ScopeType::Single, 10).unwrap();
        clock.advance(chrono::Duration::minutes(10));
        scheduler.tick();
        settle().await;

        let replaced = scheduler.upsert_job(p, ScopeType::Single, 120).unwrap();
        assert!(replaced.running);
        clock.advance(chrono::Duration::minutes(1));
        runner.release(1);
        scheduler.wait_idle().await;

        let status = scheduler.job_status(p, ScopeType::Single).unwrap();
        assert_eq!(status.interval_minutes, 120);
        assert_eq!(status.next_fire_at, replaced.next_fire_at);
    }

    #[test]
    fn remove_unknown_job_and_zero_interval_are_errors() {
        let (scheduler, _runner, _clock) = setup();
        let p = Uuid::new_v4();
        assert!(matches!(
            scheduler.remove_job(p, ScopeType::Single),
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert_eq!(
            scheduler.upsert_job(p, ScopeType::Single, 0),
            Err(SchedulerError::InvalidInterval(0))
        );
        assert!(scheduler.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (scheduler, _runner, _clock) = setup();
        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_started());
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_started());
        scheduler.start();
        assert!(scheduler.is_started());
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn tick_loop_fires_due_jobs() {
        let (scheduler, runner, clock) = setup();
        let p = Uuid::new_v4();
        scheduler.upsert_job(p, ScopeType::Single, 1).unwrap();
        runner.release(1);
        clock.advance(chrono::Duration::minutes(1));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.wait_idle().await;
        scheduler.stop();

        assert_eq!(runner.finished.load(Ordering::SeqCst), 1);
    }
}
