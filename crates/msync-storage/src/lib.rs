//! Persistence collaborators for msync (config store, metrics store) plus HTTP fetch utilities.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msync_core::{
    ConfigError, DailyMetric, DateRange, DedupKey, IndividualRecord, MetricRecord, ProjectSyncConfig,
    ScopeType, SheetRef, SyncHistory, SyncMode, SyncState, SyncStatus,
};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClient, HttpClientConfig,
    HttpError, HttpResponse, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "msync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no {scope} sync config for project {project_id}")]
    ConfigNotFound { project_id: Uuid, scope: ScopeType },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("record already exists: {0:?}")]
    Conflict(DedupKey),
    #[error("{0}")]
    Message(String),
}

/// Status transition written by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
}

impl StatusUpdate {
    pub fn syncing() -> Self {
        Self {
            status: SyncStatus::Syncing,
            last_sync_at: None,
            next_sync_at: None,
            last_sync_error: None,
        }
    }

    pub fn finished(
        success: bool,
        at: DateTime<Utc>,
        next_sync_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Self {
        Self {
            status: if success {
                SyncStatus::Success
            } else {
                SyncStatus::Error
            },
            last_sync_at: Some(at),
            next_sync_at,
            last_sync_error: if success { None } else { error },
        }
    }

    /// `syncing` only flips the status; completion rewrites every field.
    pub fn apply(&self, state: &mut SyncState) {
        state.sync_status = self.status;
        if self.status == SyncStatus::Syncing {
            return;
        }
        state.last_sync_at = self.last_sync_at;
        state.next_sync_at = self.next_sync_at;
        state.last_sync_error = self.last_sync_error.clone();
    }
}

/// Auto-sync settings change for a stored config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleUpdate {
    Armed {
        interval_minutes: u32,
        next_sync_at: DateTime<Utc>,
    },
    Disarmed,
}

impl ScheduleUpdate {
    pub fn apply(&self, config: &mut ProjectSyncConfig) -> Result<(), ConfigError> {
        match *self {
            Self::Armed {
                interval_minutes,
                next_sync_at,
            } => {
                config.set_interval_minutes(interval_minutes)?;
                config.set_auto_sync(true);
                config.state_mut().next_sync_at = Some(next_sync_at);
            }
            Self::Disarmed => {
                config.set_auto_sync(false);
                config.state_mut().next_sync_at = None;
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(
        &self,
        project_id: Uuid,
        scope: ScopeType,
    ) -> Result<Option<ProjectSyncConfig>, StoreError>;

    async fn list_configs(&self) -> Result<Vec<ProjectSyncConfig>, StoreError>;

    async fn save_config(&self, config: ProjectSyncConfig) -> Result<ProjectSyncConfig, StoreError>;

    /// Writes new settings. Status, last-run fields and per-sheet stamps already stored are
    /// kept, read and written under one lock; `next_sync_at` comes from `config`.
    async fn save_settings(
        &self,
        config: ProjectSyncConfig,
    ) -> Result<ProjectSyncConfig, StoreError>;

    async fn update_schedule(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        update: ScheduleUpdate,
    ) -> Result<ProjectSyncConfig, StoreError>;

    /// Returns whether a config existed.
    async fn delete_config(&self, project_id: Uuid, scope: ScopeType) -> Result<bool, StoreError>;

    async fn update_status(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        update: StatusUpdate,
    ) -> Result<(), StoreError>;

    async fn mark_sheet_synced(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        sheet: &SheetRef,
        at: DateTime<Utc>,
        headers: Vec<String>,
    ) -> Result<(), StoreError>;

    async fn append_history(&self, row: SyncHistory) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn list_history(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        limit: usize,
    ) -> Result<Vec<SyncHistory>, StoreError>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn read_existing_keys(
        &self,
        project_id: Uuid,
        mode: SyncMode,
        range: Option<DateRange>,
    ) -> Result<HashSet<DedupKey>, StoreError>;

    /// Inserts all rows or none; returns the number written.
    async fn insert_rows(&self, rows: &[MetricRecord]) -> Result<usize, StoreError>;

    /// Overwrites rows matching each record's dedup key; returns the number written.
    async fn update_rows(&self, rows: &[MetricRecord]) -> Result<usize, StoreError>;

    async fn list_daily_metrics(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<DailyMetric>, StoreError>;

    async fn list_individual_records(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<IndividualRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syncing_keeps_previous_timestamps() {
        let at = Utc::now();
        let mut state = SyncState {
            sync_status: SyncStatus::Error,
            last_sync_at: Some(at),
            next_sync_at: Some(at),
            last_sync_error: Some("boom".into()),
        };
        StatusUpdate::syncing().apply(&mut state);
        assert_eq!(state.sync_status, SyncStatus::Syncing);
        assert_eq!(state.last_sync_at, Some(at));
        assert_eq!(state.last_sync_error.as_deref(), Some("boom"));
    }

    #[test]
    fn schedule_updates_toggle_auto_sync() {
        let at = Utc::now();
        let mut config = ProjectSyncConfig::Multi(msync_core::MultiSpreadsheetSyncConfig {
            project_id: Uuid::new_v4(),
            spreadsheets: vec![],
            sync_mode: SyncMode::DailyAggregate,
            auto_sync_enabled: false,
            frequency_minutes: 30,
            state: SyncState::default(),
        });
        ScheduleUpdate::Armed {
            interval_minutes: 10,
            next_sync_at: at,
        }
        .apply(&mut config)
        .unwrap();
        assert!(config.auto_sync_enabled());
        assert_eq!(config.interval_minutes(), 10);
        assert_eq!(config.state().next_sync_at, Some(at));

        let rejected = ScheduleUpdate::Armed {
            interval_minutes: 0,
            next_sync_at: at,
        }
        .apply(&mut config);
        assert!(matches!(rejected, Err(ConfigError::InvalidInterval { .. })));
        assert_eq!(config.interval_minutes(), 10);

        ScheduleUpdate::Disarmed.apply(&mut config).unwrap();
        assert!(!config.auto_sync_enabled());
        assert_eq!(config.state().next_sync_at, None);
    }

    #[test]
    fn successful_finish_clears_error() {
        let at = Utc::now();
        let mut state = SyncState {
            last_sync_error: Some("old failure".into()),
            ..SyncState::default()
        };
        StatusUpdate::finished(true, at, None, Some("ignored".into())).apply(&mut state);
        assert_eq!(state.sync_status, SyncStatus::Success);
        assert_eq!(state.last_sync_at, Some(at));
        assert!(state.last_sync_error.is_none());

        StatusUpdate::finished(false, at, None, Some("sheet failed".into())).apply(&mut state);
        assert_eq!(state.sync_status, SyncStatus::Error);
        assert_eq!(state.last_sync_error.as_deref(), Some("sheet failed"));
    }
}
