//! Runs every selected sheet of a project config and records the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use msync_core::{
    ProjectSyncConfig, ScopeType, SheetError, SheetResult, SyncHistory, SyncResult, SyncTrigger,
};
use msync_storage::{ConfigStore, StatusUpdate};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::executor::SheetSyncExecutor;

/// What the scheduler invokes when a job fires.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run_job(&self, project_id: Uuid, scope: ScopeType, trigger: SyncTrigger) -> SyncResult;
}

pub struct SyncOrchestrator {
    configs: Arc<dyn ConfigStore>,
    executor: SheetSyncExecutor,
    clock: Arc<dyn Clock>,
}

impl SyncOrchestrator {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        executor: SheetSyncExecutor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            configs,
            executor,
            clock,
        }
    }

    /// Loads the stored config and runs it; an absent config yields a failed result.
    pub async fn run_project(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        trigger: SyncTrigger,
    ) -> SyncResult {
        match self.configs.get_config(project_id, scope).await {
            Ok(Some(config)) => self.run(&config, trigger).await,
            Ok(None) => {
                let result = SyncResult::aborted(
                    project_id,
                    scope,
                    trigger,
                    self.clock.now(),
                    format!("no {scope} sync config for project {project_id}"),
                );
                self.append_history(&result).await;
                result
            }
            Err(err) => {
                warn!(%project_id, %scope, error = %err, "loading sync config failed");
                let result = SyncResult::aborted(
                    project_id,
                    scope,
                    trigger,
                    self.clock.now(),
                    format!("loading sync config: {err}"),
                );
                self.append_history(&result).await;
                result
            }
        }
    }

    pub async fn run(&self, config: &ProjectSyncConfig, trigger: SyncTrigger) -> SyncResult {
        let project_id = config.project_id();
        let scope = config.scope();
        let span = tracing::info_span!("sync_run", %project_id, %scope, ?trigger);
        self.run_inner(config, trigger).instrument(span).await
    }

    async fn run_inner(&self, config: &ProjectSyncConfig, trigger: SyncTrigger) -> SyncResult {
        let project_id = config.project_id();
        let scope = config.scope();
        let mode = config.sync_mode();
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();

        if let Err(err) = self
            .configs
            .update_status(project_id, scope, StatusUpdate::syncing())
            .await
        {
            warn!(error = %err, "marking config as syncing failed");
        }

        let targets = config.sheet_targets();
        let mut per_sheet_results = Vec::with_capacity(targets.len());
        for target in &targets {
            let execution = self
                .executor
                .execute(project_id, &target.sheet, &target.mapping, mode)
                .await;
            if !execution.result.is_error() {
                if let Err(err) = self
                    .configs
                    .mark_sheet_synced(
                        project_id,
                        scope,
                        &target.sheet,
                        self.clock.now(),
                        execution.headers,
                    )
                    .await
                {
                    warn!(sheet = %target.sheet, error = %err, "stamping sheet sync time failed");
                }
            }
            per_sheet_results.push(execution.result);
        }

        let error = run_error(&per_sheet_results);
        let finished_at = self.clock.now();
        let result = SyncResult {
            run_id,
            project_id,
            scope,
            trigger,
            started_at,
            finished_at,
            total_inserted: succeeded(&per_sheet_results).map(|r| r.inserted).sum(),
            total_updated: succeeded(&per_sheet_results).map(|r| r.updated).sum(),
            total_skipped: succeeded(&per_sheet_results).map(|r| r.skipped).sum(),
            success: error.is_none(),
            error,
            per_sheet_results,
        };

        self.append_history(&result).await;

        let next_sync_at = config
            .auto_sync_enabled()
            .then(|| finished_at + config.interval());
        let update = StatusUpdate::finished(
            result.success,
            finished_at,
            next_sync_at,
            result.error.clone(),
        );
        if let Err(err) = self.configs.update_status(project_id, scope, update).await {
            warn!(error = %err, "writing final sync status failed");
        }

        info!(
            success = result.success,
            sheets = result.per_sheet_results.len(),
            failed_sheets = result.per_sheet_results.len() - result.sheets_synced(),
            inserted = result.total_inserted,
            updated = result.total_updated,
            skipped = result.total_skipped,
            "sync run finished"
        );
        result
    }

    async fn append_history(&self, result: &SyncResult) {
        if let Err(err) = self
            .configs
            .append_history(SyncHistory::from_result(result))
            .await
        {
            warn!(
                project_id = %result.project_id,
                scope = %result.scope,
                error = %err,
                "appending sync history failed"
            );
        }
    }
}

/// Sheets that count toward run totals. A failed sheet keeps its committed
/// batch counts on its own result only.
fn succeeded(results: &[SheetResult]) -> impl Iterator<Item = &SheetResult> {
    results.iter().filter(|r| !r.is_error())
}

/// Run-level error: any fatal sheet error, every sheet failing, or nothing to sync.
pub fn run_error(results: &[SheetResult]) -> Option<String> {
    if results.is_empty() {
        return Some(
            SheetError::Config {
                message: "no sheets selected".into(),
            }
            .to_string(),
        );
    }
    if let Some(fatal) = results
        .iter()
        .find(|r| r.error.as_ref().is_some_and(SheetError::is_fatal))
    {
        let err = fatal.error.as_ref().map(ToString::to_string).unwrap_or_default();
        return Some(format!("{}: {err}", fatal.sheet));
    }
    if results.iter().all(SheetResult::is_error) {
        let first = results
            .iter()
            .find_map(|r| r.error.as_ref().map(|e| format!("{}: {e}", r.sheet)))
            .unwrap_or_default();
        return Some(format!("all {} sheets failed; first: {first}", results.len()));
    }
    None
}

#[async_trait]
impl JobRunner for SyncOrchestrator {
    async fn run_job(&self, project_id: Uuid, scope: ScopeType, trigger: SyncTrigger) -> SyncResult {
        self.run_project(project_id, scope, trigger).await
    }
}
