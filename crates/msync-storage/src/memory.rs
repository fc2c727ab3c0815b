//! In-process store used by tests and database-less runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msync_core::{
    DailyMetric, DateRange, DedupKey, IndividualRecord, MetricRecord, ProjectSyncConfig,
    ScopeType, SheetRef, SyncHistory, SyncMode,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{ConfigStore, MetricsStore, ScheduleUpdate, StatusUpdate, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    configs: BTreeMap<(Uuid, ScopeType), ProjectSyncConfig>,
    history: Vec<SyncHistory>,
    records: HashMap<DedupKey, MetricRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn get_record(&self, key: &DedupKey) -> Option<MetricRecord> {
        self.state.lock().await.records.get(key).cloned()
    }
}

fn in_range(range: Option<DateRange>, record: &MetricRecord) -> bool {
    range.map(|r| r.contains(record.date())).unwrap_or(true)
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_config(
        &self,
        project_id: Uuid,
        scope: ScopeType,
    ) -> Result<Option<ProjectSyncConfig>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .configs
            .get(&(project_id, scope))
            .cloned())
    }

    async fn list_configs(&self) -> Result<Vec<ProjectSyncConfig>, StoreError> {
        Ok(self.state.lock().await.configs.values().cloned().collect())
    }

    async fn save_config(&self, config: ProjectSyncConfig) -> Result<ProjectSyncConfig, StoreError> {
        let mut state = self.state.lock().await;
        state
            .configs
            .insert((config.project_id(), config.scope()), config.clone());
        Ok(config)
    }

    async fn save_settings(
        &self,
        mut config: ProjectSyncConfig,
    ) -> Result<ProjectSyncConfig, StoreError> {
        let mut state = self.state.lock().await;
        let key = (config.project_id(), config.scope());
        if let Some(stored) = state.configs.get(&key) {
            config.adopt_sync_stamps(stored.clone());
        }
        state.configs.insert(key, config.clone());
        Ok(config)
    }

    async fn update_schedule(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        update: ScheduleUpdate,
    ) -> Result<ProjectSyncConfig, StoreError> {
        let mut state = self.state.lock().await;
        let config = state
            .configs
            .get_mut(&(project_id, scope))
            .ok_or(StoreError::ConfigNotFound { project_id, scope })?;
        update.apply(config)?;
        Ok(config.clone())
    }

    async fn delete_config(&self, project_id: Uuid, scope: ScopeType) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .configs
            .remove(&(project_id, scope))
            .is_some())
    }

    async fn update_status(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let config = state
            .configs
            .get_mut(&(project_id, scope))
            .ok_or(StoreError::ConfigNotFound { project_id, scope })?;
        update.apply(config.state_mut());
        Ok(())
    }

    async fn mark_sheet_synced(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        sheet: &SheetRef,
        at: DateTime<Utc>,
        headers: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let config = state
            .configs
            .get_mut(&(project_id, scope))
            .ok_or(StoreError::ConfigNotFound { project_id, scope })?;
        if let Some(sheet_config) = config.sheet_mut(sheet) {
            sheet_config.last_synced_at = Some(at);
            if !headers.is_empty() {
                sheet_config.headers = headers;
            }
        }
        Ok(())
    }

    async fn append_history(&self, row: SyncHistory) -> Result<(), StoreError> {
        self.state.lock().await.history.push(row);
        Ok(())
    }

    async fn list_history(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        limit: usize,
    ) -> Result<Vec<SyncHistory>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .history
            .iter()
            .rev()
            .filter(|h| h.project_id == project_id && h.scope == scope)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn read_existing_keys(
        &self,
        project_id: Uuid,
        mode: SyncMode,
        range: Option<DateRange>,
    ) -> Result<HashSet<DedupKey>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|(key, record)| {
                let mode_matches = match (mode, key) {
                    (SyncMode::DailyAggregate, DedupKey::Aggregate { .. }) => true,
                    (SyncMode::IndividualRecords, DedupKey::Individual { .. }) => true,
                    _ => false,
                };
                mode_matches && record.project_id() == project_id && in_range(range, record)
            })
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn insert_rows(&self, rows: &[MetricRecord]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = rows
            .iter()
            .map(MetricRecord::dedup_key)
            .find(|key| state.records.contains_key(key))
        {
            return Err(StoreError::Conflict(existing));
        }
        for row in rows {
            state.records.insert(row.dedup_key(), row.clone());
        }
        Ok(rows.len())
    }

    async fn update_rows(&self, rows: &[MetricRecord]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for row in rows {
            if let Some(slot) = state.records.get_mut(&row.dedup_key()) {
                *slot = row.clone();
                written += 1;
            }
        }
        Ok(written)
    }

    async fn list_daily_metrics(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<DailyMetric>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .records
            .values()
            .filter(|r| r.project_id() == project_id && in_range(range, r))
            .filter_map(|r| match r {
                MetricRecord::Daily(m) => Some(m.clone()),
                MetricRecord::Individual(_) => None,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| (a.date, &a.metric_key).cmp(&(b.date, &b.metric_key)));
        Ok(out)
    }

    async fn list_individual_records(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<IndividualRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .records
            .values()
            .filter(|r| r.project_id() == project_id && in_range(range, r))
            .filter_map(|r| match r {
                MetricRecord::Individual(rec) => Some(rec.clone()),
                MetricRecord::Daily(_) => None,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| (a.date, &a.unique_id).cmp(&(b.date, &b.unique_id)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use msync_core::{
        ColumnMapping, MetricValue, SheetConfig, SyncConfig, SyncState, SyncStatus,
    };

    fn daily(project_id: Uuid, date: &str, key: &str, value: f64) -> MetricRecord {
        MetricRecord::Daily(DailyMetric {
            project_id,
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            metric_key: key.into(),
            metric_name: key.into(),
            is_custom: false,
            value: MetricValue::Number(value),
            source: SheetRef::new("s", "Daily"),
            synced_at: Utc::now(),
        })
    }

    fn config(project_id: Uuid) -> ProjectSyncConfig {
        ProjectSyncConfig::Single(SyncConfig {
            project_id,
            spreadsheet_id: "s".into(),
            spreadsheet_name: None,
            sheets: vec![SheetConfig::new("Daily", ColumnMapping::new())],
            sync_mode: SyncMode::DailyAggregate,
            auto_sync_enabled: true,
            interval_hours: 1,
            state: SyncState::default(),
        })
    }

    #[tokio::test]
    async fn insert_is_all_or_nothing_on_conflict() {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        store
            .insert_rows(&[daily(project_id, "2024-01-01", "spend", 1.0)])
            .await
            .unwrap();

        let err = store
            .insert_rows(&[
                daily(project_id, "2024-01-02", "spend", 2.0),
                daily(project_id, "2024-01-01", "spend", 3.0),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn existing_keys_respect_project_and_range() {
        let store = MemoryStore::new();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        store
            .insert_rows(&[
                daily(p1, "2024-01-01", "spend", 1.0),
                daily(p1, "2024-02-01", "spend", 1.0),
                daily(p2, "2024-01-01", "spend", 1.0),
            ])
            .await
            .unwrap();

        let range = DateRange {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        };
        let keys = store
            .read_existing_keys(p1, SyncMode::DailyAggregate, Some(range))
            .await
            .unwrap();
        assert_eq!(keys.len(), 1);
        let none = store
            .read_existing_keys(p1, SyncMode::IndividualRecords, None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn status_and_sheet_stamps_apply_to_stored_config() {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        store.save_config(config(project_id)).await.unwrap();

        store
            .update_status(project_id, ScopeType::Single, StatusUpdate::syncing())
            .await
            .unwrap();
        let at = Utc::now();
        store
            .mark_sheet_synced(
                project_id,
                ScopeType::Single,
                &SheetRef::new("s", "Daily"),
                at,
                vec!["Date".into(), "Spend".into()],
            )
            .await
            .unwrap();

        let stored = store
            .get_config(project_id, ScopeType::Single)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state().sync_status, SyncStatus::Syncing);
        let ProjectSyncConfig::Single(single) = stored else {
            panic!("expected single config");
        };
        assert_eq!(single.sheets[0].last_synced_at, Some(at));
        assert_eq!(single.sheets[0].headers, vec!["Date", "Spend"]);

        let missing = store
            .update_status(Uuid::new_v4(), ScopeType::Multi, StatusUpdate::syncing())
            .await;
        assert!(matches!(missing, Err(StoreError::ConfigNotFound { .. })));
    }

    #[tokio::test]
    async fn saving_settings_keeps_status_written_in_between() {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        store.save_config(config(project_id)).await.unwrap();
        let edited = {
            let mut c = config(project_id);
            c.set_interval_minutes(240).unwrap();
            c
        };

        let at = Utc::now();
        store
            .update_status(
                project_id,
                ScopeType::Single,
                StatusUpdate::finished(false, at, Some(at), Some("quota".into())),
            )
            .await
            .unwrap();
        let saved = store.save_settings(edited).await.unwrap();

        assert_eq!(saved.interval_minutes(), 240);
        assert_eq!(saved.state().sync_status, SyncStatus::Error);
        assert_eq!(saved.state().last_sync_at, Some(at));
        assert_eq!(saved.state().last_sync_error.as_deref(), Some("quota"));
        assert_eq!(saved.state().next_sync_at, None);
        let stored = store.get_config(project_id, ScopeType::Single).await.unwrap();
        assert_eq!(stored, Some(saved));
    }

    #[tokio::test]
    async fn schedule_update_needs_a_stored_config() {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        let missing = store
            .update_schedule(project_id, ScopeType::Single, ScheduleUpdate::Disarmed)
            .await;
        assert!(matches!(missing, Err(StoreError::ConfigNotFound { .. })));

        store.save_config(config(project_id)).await.unwrap();
        let next = Utc::now();
        let armed = store
            .update_schedule(
                project_id,
                ScopeType::Single,
                ScheduleUpdate::Armed {
                    interval_minutes: 120,
                    next_sync_at: next,
                },
            )
            .await
            .unwrap();
        assert_eq!(armed.interval_minutes(), 120);
        assert_eq!(armed.state().next_sync_at, Some(next));

        let bad = store
            .update_schedule(
                project_id,
                ScopeType::Single,
                ScheduleUpdate::Armed {
                    interval_minutes: 45,
                    next_sync_at: next,
                },
            )
            .await;
        assert!(matches!(bad, Err(StoreError::Config(_))));
    }
}
