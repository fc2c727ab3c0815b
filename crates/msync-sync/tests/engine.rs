use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use msync_adapters::{FixtureSheetFetcher, SheetCredentials, StaticCredentialProvider};
use msync_core::clock::ManualClock;
use msync_core::{
    ColumnMapping, ConfigError, DailyMetric, DateRange, DedupKey, IndividualRecord, MetricColumn,
    MetricRecord, MultiSpreadsheetSyncConfig, ProjectSyncConfig, ScopeType, SheetConfig,
    SheetError, SpreadsheetEntry, SyncConfig, SyncMode, SyncState, SyncStatus, SyncTrigger,
    ValueType, DATE_KEY, UNIQUE_ID_KEY,
};
use msync_storage::{ConfigStore, MemoryStore, MetricsStore, StoreError};
use msync_sync::{Clock, EngineParts, ExecutorSettings, SchedulerError, SyncError, SyncService};
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, 6, 0, 0).single().unwrap()
}

struct Engine {
    service: SyncService,
    store: Arc<MemoryStore>,
    fetcher: Arc<FixtureSheetFetcher>,
    clock: Arc<ManualClock>,
}

/// Fails the listed `insert_rows` calls (1-based); everything else goes to the inner store.
struct FailingInserts {
    inner: Arc<MemoryStore>,
    calls: AtomicUsize,
    failing_calls: HashSet<usize>,
}

#[async_trait]
impl MetricsStore for FailingInserts {
    async fn read_existing_keys(
        &self,
        project_id: Uuid,
        mode: SyncMode,
        range: Option<DateRange>,
    ) -> Result<HashSet<DedupKey>, StoreError> {
        self.inner.read_existing_keys(project_id, mode, range).await
    }

    async fn insert_rows(&self, rows: &[MetricRecord]) -> Result<usize, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_calls.contains(&call) {
            return Err(StoreError::Message("connection lost".into()));
        }
        self.inner.insert_rows(rows).await
    }

    async fn update_rows(&self, rows: &[MetricRecord]) -> Result<usize, StoreError> {
        self.inner.update_rows(rows).await
    }

    async fn list_daily_metrics(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<DailyMetric>, StoreError> {
        self.inner.list_daily_metrics(project_id, range).await
    }

    async fn list_individual_records(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<IndividualRecord>, StoreError> {
        self.inner.list_individual_records(project_id, range).await
    }
}

fn engine() -> Engine {
    engine_with(|store| store as Arc<dyn MetricsStore>, ExecutorSettings::default())
}

fn engine_with(
    metrics: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn MetricsStore>,
    settings: ExecutorSettings,
) -> Engine {
    let store = Arc::new(MemoryStore::new());
    let fetcher =
        Arc::new(FixtureSheetFetcher::from_dir(workspace_root().join("fixtures/sheets")).unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let service = SyncService::new(
        EngineParts {
            configs: store.clone(),
            metrics: metrics(store.clone()),
            fetcher: fetcher.clone(),
            credentials: Arc::new(
                StaticCredentialProvider::new().with_default(SheetCredentials::bearer("fixture")),
            ),
            clock: clock.clone(),
        },
        settings,
        Duration::from_secs(60),
    );
    Engine {
        service,
        store,
        fetcher,
        clock,
    }
}

fn daily_mapping() -> ColumnMapping {
    ColumnMapping::new()
        .with("A", MetricColumn::new(DATE_KEY, "Date", ValueType::Date))
        .with("B", MetricColumn::new("spend", "Spend", ValueType::Numeric))
        .with("C", MetricColumn::new("clicks", "Clicks", ValueType::Numeric))
        .with("D", MetricColumn::new("leads", "Leads", ValueType::Numeric))
}

fn leads_mapping() -> ColumnMapping {
    ColumnMapping::new()
        .with("A", MetricColumn::new(DATE_KEY, "Created", ValueType::Date))
        .with("B", MetricColumn::new(UNIQUE_ID_KEY, "Lead ID", ValueType::Text))
        .with("C", MetricColumn::new("source", "Source", ValueType::Text))
        .with("D", MetricColumn::new("deal_value", "Deal Value", ValueType::Numeric).custom())
}

fn single(project_id: Uuid, mode: SyncMode, sheet: SheetConfig, auto: bool) -> ProjectSyncConfig {
    ProjectSyncConfig::Single(SyncConfig {
        project_id,
        spreadsheet_id: "demo-marketing".into(),
        spreadsheet_name: Some("Demo Marketing Dashboard".into()),
        sheets: vec![sheet],
        sync_mode: mode,
        auto_sync_enabled: auto,
        interval_hours: 1,
        state: SyncState::default(),
    })
}

#[tokio::test]
async fn individual_mode_without_unique_id_is_rejected_and_not_armed() {
    let e = engine();
    let p = Uuid::new_v4();
    let mapping = ColumnMapping::new()
        .with("A", MetricColumn::new(DATE_KEY, "Created", ValueType::Date))
        .with("C", MetricColumn::new("source", "Source", ValueType::Text));
    let config = single(
        p,
        SyncMode::IndividualRecords,
        SheetConfig::new("Leads", mapping),
        true,
    );

    let err = e.service.save_config(config).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Config(ConfigError::MissingUniqueIdColumn { .. })
    ));
    assert!(e.service.job_status(p, ScopeType::Single).is_none());
    assert!(e.store.get_config(p, ScopeType::Single).await.unwrap().is_none());
}

#[tokio::test]
async fn manual_resync_updates_instead_of_duplicating() {
    let e = engine();
    let p = Uuid::new_v4();
    e.service
        .save_config(single(
            p,
            SyncMode::DailyAggregate,
            SheetConfig::new("Daily", daily_mapping()),
            false,
        ))
        .await
        .unwrap();

    let first = e.service.trigger_manual_sync(p, ScopeType::Single).await.unwrap();
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.trigger, SyncTrigger::Manual);
    // Three full rows, one row with empty leads, one row whose spend fails to parse.
    assert_eq!(first.total_inserted, 10);
    assert_eq!(first.total_updated, 0);
    assert_eq!(first.total_skipped, 1);

    let second = e.service.trigger_manual_sync(p, ScopeType::Single).await.unwrap();
    assert_eq!(second.total_inserted, 0);
    assert_eq!(second.total_updated, 10);

    let stored = e.service.list_daily_metrics(p, None).await.unwrap();
    assert_eq!(stored.len(), 10);
    let history = e.service.history(p, ScopeType::Single, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].rows_updated, 10);

    let config = e.service.get_config(p, ScopeType::Single).await.unwrap().unwrap();
    assert_eq!(config.state().sync_status, SyncStatus::Success);
    assert_eq!(config.state().next_sync_at, None);
}

#[tokio::test]
async fn multi_spreadsheet_run_contains_a_failing_sheet() {
    let e = engine();
    let p = Uuid::new_v4();
    let regional = ColumnMapping::new()
        .with("A", MetricColumn::new(DATE_KEY, "Day", ValueType::Date))
        .with("B", MetricColumn::new("spend", "Cost", ValueType::Numeric));
    let config = ProjectSyncConfig::Multi(MultiSpreadsheetSyncConfig {
        project_id: p,
        spreadsheets: vec![
            SpreadsheetEntry {
                spreadsheet_id: "demo-marketing".into(),
                spreadsheet_name: None,
                sheets: vec![
                    SheetConfig::new("Daily", daily_mapping()),
                    SheetConfig::new("Missing Tab", daily_mapping()),
                ],
            },
            SpreadsheetEntry {
                spreadsheet_id: "demo-regional".into(),
                spreadsheet_name: None,
                sheets: vec![SheetConfig::new("EMEA", regional)],
            },
        ],
        sync_mode: SyncMode::DailyAggregate,
        auto_sync_enabled: false,
        frequency_minutes: 30,
        state: SyncState::default(),
    });
    e.service.save_config(config).await.unwrap();

    let result = e.service.trigger_manual_sync(p, ScopeType::Multi).await.unwrap();
    assert!(result.success);
    assert_eq!(result.per_sheet_results.len(), 3);
    assert_eq!(result.sheets_synced(), 2);
    let missing = &result.per_sheet_results[1];
    assert!(missing.is_error());
    assert_eq!(missing.inserted + missing.updated, 0);
    assert_eq!(
        result.total_inserted,
        result.per_sheet_results[0].inserted + result.per_sheet_results[2].inserted
    );
}

#[tokio::test]
async fn scheduled_tick_runs_job_and_rearms_it() {
    let e = engine();
    let p = Uuid::new_v4();
    e.service
        .save_config(single(
            p,
            SyncMode::IndividualRecords,
            SheetConfig::new("Leads", leads_mapping()),
            true,
        ))
        .await
        .unwrap();

    e.clock.advance(chrono::Duration::minutes(59));
    assert!(e.service.scheduler().tick().fired.is_empty());

    e.clock.advance(chrono::Duration::minutes(2));
    let fired_at = e.clock.now();
    assert_eq!(e.service.scheduler().tick().fired.len(), 1);
    e.service.scheduler().wait_idle().await;

    let history = e.service.history(p, ScopeType::Single, 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].trigger, SyncTrigger::Scheduled);
    assert_eq!(history[0].rows_inserted, 3);

    let records = e.service.list_individual_records(p, None).await.unwrap();
    assert_eq!(records.len(), 3);

    let job = e.service.job_status(p, ScopeType::Single).unwrap();
    assert!(!job.running);
    assert_eq!(job.next_fire_at, fired_at + chrono::Duration::hours(1));
    assert!(job.last_result.unwrap().success);

    let config = e.service.get_config(p, ScopeType::Single).await.unwrap().unwrap();
    assert_eq!(
        config.state().next_sync_at,
        Some(fired_at + chrono::Duration::hours(1))
    );
}

#[tokio::test(start_paused = true)]
async fn tick_and_manual_trigger_never_overlap() {
    let e = engine();
    let p = Uuid::new_v4();
    e.service
        .save_config(single(
            p,
            SyncMode::DailyAggregate,
            SheetConfig::new("Daily", daily_mapping()),
            true,
        ))
        .await
        .unwrap();
    e.fetcher.set_delay(Some(Duration::from_secs(5))).await;

    e.clock.advance(chrono::Duration::hours(1));
    assert_eq!(e.service.scheduler().tick().fired.len(), 1);
    tokio::task::yield_now().await;
    assert!(e.service.scheduler().is_running(p, ScopeType::Single));

    let err = e
        .service
        .trigger_manual_sync(p, ScopeType::Single)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Scheduler(SchedulerError::AlreadyRunning { .. })
    ));

    e.clock.advance(chrono::Duration::hours(1));
    let outcome = e.service.scheduler().tick();
    assert!(outcome.fired.is_empty());
    assert_eq!(outcome.skipped.len(), 1);

    e.service.scheduler().wait_idle().await;
    assert_eq!(e.fetcher.fetch_count(), 1);
    let history = e.service.history(p, ScopeType::Single, 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn removing_config_mid_run_leaves_no_job_behind() {
    let e = engine();
    let p = Uuid::new_v4();
    e.service
        .save_config(single(
            p,
            SyncMode::DailyAggregate,
            SheetConfig::new("Daily", daily_mapping()),
            true,
        ))
        .await
        .unwrap();
    e.fetcher.set_delay(Some(Duration::from_millis(20))).await;

    e.clock.advance(chrono::Duration::hours(1));
    e.service.scheduler().tick();
    tokio::task::yield_now().await;
    assert!(e.service.delete_config(p, ScopeType::Single).await.unwrap());

    e.service.shutdown().await;
    assert!(e.service.list_jobs().is_empty());
}

fn failing_inserts(calls: &[usize]) -> impl FnOnce(Arc<MemoryStore>) -> Arc<dyn MetricsStore> {
    let failing_calls = calls.iter().copied().collect::<HashSet<_>>();
    move |inner| {
        Arc::new(FailingInserts {
            inner,
            calls: AtomicUsize::new(0),
            failing_calls,
        }) as Arc<dyn MetricsStore>
    }
}

fn small_batches() -> ExecutorSettings {
    ExecutorSettings {
        write_batch_size: 2,
        ..ExecutorSettings::default()
    }
}

#[tokio::test]
async fn sheet_failing_mid_persist_adds_nothing_to_totals() {
    let e = engine_with(failing_inserts(&[2, 3, 4, 5]), small_batches());
    let p = Uuid::new_v4();
    e.service
        .save_config(single(
            p,
            SyncMode::DailyAggregate,
            SheetConfig::new("Daily", daily_mapping()),
            false,
        ))
        .await
        .unwrap();

    let result = e.service.trigger_manual_sync(p, ScopeType::Single).await.unwrap();
    let sheet = &result.per_sheet_results[0];
    assert!(matches!(sheet.error, Some(SheetError::Persist { .. })));
    assert_eq!(sheet.inserted, 2);
    assert_eq!(result.total_inserted, 0);
    assert_eq!(result.total_updated, 0);
    assert_eq!(result.total_skipped, 0);
    assert!(!result.success);
    // The committed batch stays stored.
    assert_eq!(e.store.record_count().await, 2);

    let history = e.service.history(p, ScopeType::Single, 1).await.unwrap();
    assert_eq!(history[0].rows_inserted, 0);
}

#[tokio::test]
async fn multi_run_totals_skip_a_sheet_whose_persist_failed() {
    let e = engine_with(failing_inserts(&[2]), small_batches());
    let p = Uuid::new_v4();
    let regional = ColumnMapping::new()
        .with("A", MetricColumn::new(DATE_KEY, "Day", ValueType::Date))
        .with("B", MetricColumn::new("spend", "Cost", ValueType::Numeric));
    let config = ProjectSyncConfig::Multi(MultiSpreadsheetSyncConfig {
        project_id: p,
        spreadsheets: vec![
            SpreadsheetEntry {
                spreadsheet_id: "demo-marketing".into(),
                spreadsheet_name: None,
                sheets: vec![SheetConfig::new("Daily", daily_mapping())],
            },
            SpreadsheetEntry {
                spreadsheet_id: "demo-regional".into(),
                spreadsheet_name: None,
                sheets: vec![SheetConfig::new("EMEA", regional)],
            },
        ],
        sync_mode: SyncMode::DailyAggregate,
        auto_sync_enabled: false,
        frequency_minutes: 30,
        state: SyncState::default(),
    });
    e.service.save_config(config).await.unwrap();

    let result = e.service.trigger_manual_sync(p, ScopeType::Multi).await.unwrap();
    let (daily, emea) = (&result.per_sheet_results[0], &result.per_sheet_results[1]);
    assert!(matches!(daily.error, Some(SheetError::Persist { .. })));
    assert_eq!(daily.inserted, 2);
    assert!(!emea.is_error());
    assert!(emea.inserted > 0);

    assert!(result.success);
    assert_eq!(result.total_inserted, emea.inserted);
    assert_eq!(result.total_updated, emea.updated);
    assert_eq!(result.total_skipped, emea.skipped);
    assert_eq!(e.store.record_count().await, daily.inserted + emea.inserted);
}

#[tokio::test]
async fn single_and_multi_auto_sync_never_both_armed() {
    let e = engine();
    let p = Uuid::new_v4();
    let single_config = single(
        p,
        SyncMode::DailyAggregate,
        SheetConfig::new("Daily", daily_mapping()),
        true,
    );
    e.service.save_config(single_config.clone()).await.unwrap();
    let multi = ProjectSyncConfig::Multi(MultiSpreadsheetSyncConfig {
        project_id: p,
        spreadsheets: vec![SpreadsheetEntry {
            spreadsheet_id: "demo-marketing".into(),
            spreadsheet_name: None,
            sheets: vec![SheetConfig::new("Daily", daily_mapping())],
        }],
        sync_mode: SyncMode::DailyAggregate,
        auto_sync_enabled: true,
        frequency_minutes: 30,
        state: SyncState::default(),
    });
    e.service.save_config(multi).await.unwrap();

    let jobs = e.service.list_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].scope, ScopeType::Multi);

    // Re-enabling single flips it back.
    e.service.save_config(single_config).await.unwrap();
    let jobs = e.service.list_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].scope, ScopeType::Single);

    e.clock.advance(chrono::Duration::hours(2));
    assert_eq!(e.service.scheduler().tick().fired.len(), 1);
    e.service.scheduler().wait_idle().await;
    assert!(e.service.history(p, ScopeType::Multi, 5).await.unwrap().is_empty());
    assert_eq!(e.service.history(p, ScopeType::Single, 5).await.unwrap().len(), 1);
}
