//! Caller-facing facade: config lifecycle, job registration, manual runs and reads.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use msync_adapters::{CredentialProvider, FetchError, SheetFetcher, SheetInfo};
use msync_core::{
    ConfigError, DailyMetric, DateRange, IndividualRecord, ProjectSyncConfig, ScopeType,
    SyncHistory, SyncResult, SyncStatus,
};
use msync_storage::{ConfigStore, MetricsStore, ScheduleUpdate, StatusUpdate, StoreError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::executor::{ExecutorSettings, SheetSyncExecutor};
use crate::orchestrator::SyncOrchestrator;
use crate::scheduler::{JobStatus, SchedulerError, SyncScheduler};

pub const INTERRUPTED_BY_RESTART: &str = "sync interrupted by restart";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no {scope} sync config for project {project_id}")]
    NotFound { project_id: Uuid, scope: ScopeType },
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Config(err) => Self::Config(err),
            StoreError::ConfigNotFound { project_id, scope } => Self::NotFound { project_id, scope },
            other => Self::Store(other),
        }
    }
}

/// Collaborators the engine is wired from.
#[derive(Clone)]
pub struct EngineParts {
    pub configs: Arc<dyn ConfigStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub fetcher: Arc<dyn SheetFetcher>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct SyncService {
    configs: Arc<dyn ConfigStore>,
    metrics: Arc<dyn MetricsStore>,
    fetcher: Arc<dyn SheetFetcher>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: SyncScheduler,
}

impl SyncService {
    pub fn new(parts: EngineParts, settings: ExecutorSettings, tick: std::time::Duration) -> Self {
        let executor = SheetSyncExecutor::new(
            parts.fetcher.clone(),
            parts.credentials.clone(),
            parts.metrics.clone(),
            parts.clock.clone(),
            settings,
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            parts.configs.clone(),
            executor,
            parts.clock.clone(),
        ));
        let scheduler = SyncScheduler::new(orchestrator.clone(), parts.clock.clone(), tick);
        Self {
            configs: parts.configs,
            metrics: parts.metrics,
            fetcher: parts.fetcher,
            credentials: parts.credentials,
            clock: parts.clock,
            orchestrator,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn fetcher_source(&self) -> &'static str {
        self.fetcher.source_id()
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stops the tick loop and waits for in-flight runs to finish.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.scheduler.wait_idle().await;
    }

    /// Validates, persists and arms (or disarms) the job for a config.
    ///
    /// Status fields and per-sheet sync stamps already stored for the project are kept; the
    /// caller's copy only supplies settings. Turning auto sync on for one scope turns it off for
    /// the project's other scope.
    pub async fn save_config(
        &self,
        mut config: ProjectSyncConfig,
    ) -> Result<ProjectSyncConfig, SyncError> {
        config.validate()?;
        let project_id = config.project_id();
        let scope = config.scope();

        let next_sync_at = config
            .auto_sync_enabled()
            .then(|| self.clock.now() + config.interval());
        config.state_mut().next_sync_at = next_sync_at;

        let saved = self.configs.save_settings(config).await?;
        match next_sync_at {
            Some(at) if saved.auto_sync_enabled() => {
                self.scheduler
                    .upsert_job_at(project_id, scope, saved.interval_minutes(), at)?;
                self.disarm_other_scope(project_id, scope).await?;
            }
            _ => self.disarm(project_id, scope),
        }
        info!(
            %project_id,
            %scope,
            auto_sync = saved.auto_sync_enabled(),
            interval_minutes = saved.interval_minutes(),
            sheets = saved.sheet_targets().len(),
            "sync config saved"
        );
        Ok(saved)
    }

    /// Removes the config and its job. Returns whether a config existed.
    pub async fn delete_config(&self, project_id: Uuid, scope: ScopeType) -> Result<bool, SyncError> {
        self.disarm(project_id, scope);
        let existed = self.configs.delete_config(project_id, scope).await?;
        if existed {
            info!(%project_id, %scope, "sync config deleted");
        }
        Ok(existed)
    }

    pub async fn get_config(
        &self,
        project_id: Uuid,
        scope: ScopeType,
    ) -> Result<Option<ProjectSyncConfig>, SyncError> {
        Ok(self.configs.get_config(project_id, scope).await?)
    }

    pub async fn list_configs(&self) -> Result<Vec<ProjectSyncConfig>, SyncError> {
        Ok(self.configs.list_configs().await?)
    }

    pub async fn history(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        limit: usize,
    ) -> Result<Vec<SyncHistory>, SyncError> {
        Ok(self.configs.list_history(project_id, scope, limit).await?)
    }

    pub async fn list_daily_metrics(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<DailyMetric>, SyncError> {
        Ok(self.metrics.list_daily_metrics(project_id, range).await?)
    }

    pub async fn list_individual_records(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<IndividualRecord>, SyncError> {
        Ok(self.metrics.list_individual_records(project_id, range).await?)
    }

    /// Persists the interval and next run on the stored config, then arms the job for that
    /// same instant. The project's other scope is turned off.
    pub async fn register_or_update_job(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        interval_minutes: u32,
    ) -> Result<JobStatus, SyncError> {
        if interval_minutes == 0 {
            return Err(SchedulerError::InvalidInterval(interval_minutes).into());
        }
        let next_sync_at = self.clock.now() + Duration::minutes(i64::from(interval_minutes));
        let saved = self
            .configs
            .update_schedule(
                project_id,
                scope,
                ScheduleUpdate::Armed {
                    interval_minutes,
                    next_sync_at,
                },
            )
            .await?;
        let status =
            self.scheduler
                .upsert_job_at(project_id, scope, saved.interval_minutes(), next_sync_at)?;
        self.disarm_other_scope(project_id, scope).await?;
        Ok(status)
    }

    /// Removes the job and turns auto sync off on the stored config, if any.
    pub async fn remove_job(&self, project_id: Uuid, scope: ScopeType) -> Result<(), SyncError> {
        self.scheduler.remove_job(project_id, scope)?;
        match self
            .configs
            .update_schedule(project_id, scope, ScheduleUpdate::Disarmed)
            .await
        {
            Ok(_) | Err(StoreError::ConfigNotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn job_status(&self, project_id: Uuid, scope: ScopeType) -> Option<JobStatus> {
        self.scheduler.job_status(project_id, scope)
    }

    pub fn list_jobs(&self) -> Vec<JobStatus> {
        self.scheduler.list_jobs()
    }

    /// Runs a project now; rejected while a run for the same job is in flight.
    pub async fn trigger_manual_sync(
        &self,
        project_id: Uuid,
        scope: ScopeType,
    ) -> Result<SyncResult, SyncError> {
        info!(%project_id, %scope, "manual sync requested");
        Ok(self.scheduler.trigger_manual(project_id, scope).await?)
    }

    /// Re-arms a job for every stored config with auto sync on; returns how many were armed.
    ///
    /// A stored `next_sync_at` is honored (past-due jobs fire on the next tick). Configs left in
    /// `syncing` by a previous process are moved to `error`. When both scopes of a project are
    /// stored with auto sync on, the single scope wins and the multi scope is turned off.
    pub async fn restore_jobs(&self) -> Result<usize, SyncError> {
        let now = self.clock.now();
        let mut configs = self.configs.list_configs().await?;
        configs.sort_by_key(|c| (c.project_id(), c.scope()));
        let mut armed_projects = HashSet::new();
        let mut armed = 0;
        for config in configs {
            let project_id = config.project_id();
            let scope = config.scope();
            let state = config.state();

            if state.sync_status == SyncStatus::Syncing {
                warn!(%project_id, %scope, "config left syncing by previous process");
                let update = StatusUpdate {
                    status: SyncStatus::Error,
                    last_sync_at: state.last_sync_at,
                    next_sync_at: state.next_sync_at,
                    last_sync_error: Some(INTERRUPTED_BY_RESTART.to_string()),
                };
                if let Err(err) = self.configs.update_status(project_id, scope, update).await {
                    warn!(%project_id, %scope, error = %err, "resetting interrupted status failed");
                }
            }

            if !config.auto_sync_enabled() {
                continue;
            }
            if let Err(err) = config.validate() {
                warn!(%project_id, %scope, error = %err, "stored config invalid; job not armed");
                continue;
            }
            if !armed_projects.insert(project_id) {
                warn!(%project_id, %scope, "other scope already armed; turning auto sync off");
                self.configs
                    .update_schedule(project_id, scope, ScheduleUpdate::Disarmed)
                    .await?;
                continue;
            }
            let first_fire_at = restored_fire_time(state.next_sync_at, now, &config);
            self.scheduler.upsert_job_at(
                project_id,
                scope,
                config.interval_minutes(),
                first_fire_at,
            )?;
            armed += 1;
        }
        info!(armed, "sync jobs restored");
        Ok(armed)
    }

    /// Lists the tabs of a spreadsheet using the project's credentials.
    pub async fn discover_sheets(
        &self,
        project_id: Uuid,
        spreadsheet_id: &str,
    ) -> Result<Vec<SheetInfo>, SyncError> {
        let credentials = self.credentials.credentials(project_id).await?;
        Ok(self
            .fetcher
            .list_sheets(spreadsheet_id, &credentials)
            .await?)
    }

    async fn disarm_other_scope(&self, project_id: Uuid, scope: ScopeType) -> Result<(), SyncError> {
        let other = scope.other();
        self.disarm(project_id, other);
        let armed = self
            .configs
            .get_config(project_id, other)
            .await?
            .is_some_and(|c| c.auto_sync_enabled());
        if armed {
            self.configs
                .update_schedule(project_id, other, ScheduleUpdate::Disarmed)
                .await?;
            info!(%project_id, scope = %other, "auto sync turned off for other scope");
        }
        Ok(())
    }

    fn disarm(&self, project_id: Uuid, scope: ScopeType) {
        match self.scheduler.remove_job(project_id, scope) {
            Ok(()) | Err(SchedulerError::JobNotFound { .. }) => {}
            Err(err) => warn!(%project_id, %scope, error = %err, "removing sync job failed"),
        }
    }
}

fn restored_fire_time(
    stored: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &ProjectSyncConfig,
) -> DateTime<Utc> {
    match stored {
        Some(at) if at > now => at,
        Some(_) => now,
        None => now + config.interval(),
    }
}
