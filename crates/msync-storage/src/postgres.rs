//! Postgres-backed config, history and metrics store.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use msync_core::{
    DailyMetric, DateRange, DedupKey, IndividualRecord, MetricRecord, ProjectSyncConfig,
    ScopeType, SheetRef, SyncHistory, SyncMode,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{ConfigStore, MetricsStore, ScheduleUpdate, StatusUpdate, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Read-modify-write of one config row under a row lock. Nothing is written when `f` fails.
    async fn modify_config<F>(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        f: F,
    ) -> Result<ProjectSyncConfig, StoreError>
    where
        F: FnOnce(&mut ProjectSyncConfig) -> Result<(), StoreError> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let Some(mut config) = lock_config(&mut tx, project_id, scope).await? else {
            return Err(StoreError::ConfigNotFound { project_id, scope });
        };
        f(&mut config)?;
        write_config(&mut tx, &config).await?;
        tx.commit().await?;
        Ok(config)
    }
}

async fn lock_config(
    tx: &mut Transaction<'_, Postgres>,
    project_id: Uuid,
    scope: ScopeType,
) -> Result<Option<ProjectSyncConfig>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT config_json
          FROM sync_configs
         WHERE project_id = $1 AND scope = $2
           FOR UPDATE
        "#,
    )
    .bind(project_id)
    .bind(scope.as_str())
    .fetch_optional(&mut **tx)
    .await?;
    match row {
        Some(row) => {
            let value: serde_json::Value = row.try_get("config_json")?;
            Ok(Some(serde_json::from_value(value)?))
        }
        None => Ok(None),
    }
}

async fn write_config(
    tx: &mut Transaction<'_, Postgres>,
    config: &ProjectSyncConfig,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO sync_configs (project_id, scope, config_json, sync_status, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (project_id, scope) DO UPDATE
           SET config_json = EXCLUDED.config_json,
               sync_status = EXCLUDED.sync_status,
               updated_at = NOW()
        "#,
    )
    .bind(config.project_id())
    .bind(config.scope().as_str())
    .bind(serde_json::to_value(config)?)
    .bind(config.state().sync_status.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_scope(raw: &str) -> Result<ScopeType, StoreError> {
    ScopeType::parse(raw).ok_or_else(|| StoreError::Message(format!("unknown scope {raw:?}")))
}

fn history_from_row(row: &PgRow) -> Result<SyncHistory, StoreError> {
    let scope: String = row.try_get("scope")?;
    let trigger: String = row.try_get("sync_trigger")?;
    let status: String = row.try_get("status")?;
    let sheet_results: serde_json::Value = row.try_get("sheet_results")?;
    let count = |col: &str| -> Result<usize, StoreError> {
        let v: i64 = row.try_get(col)?;
        Ok(usize::try_from(v).unwrap_or_default())
    };
    Ok(SyncHistory {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        scope: parse_scope(&scope)?,
        trigger: serde_json::from_value(serde_json::Value::String(trigger))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: serde_json::from_value(serde_json::Value::String(status))?,
        sheets_synced: count("sheets_synced")?,
        rows_processed: count("rows_processed")?,
        rows_inserted: count("rows_inserted")?,
        rows_updated: count("rows_updated")?,
        rows_skipped: count("rows_skipped")?,
        error_message: row.try_get("error_message")?,
        sheet_results: serde_json::from_value(sheet_results)?,
    })
}

fn daily_from_row(row: &PgRow) -> Result<DailyMetric, StoreError> {
    let value: serde_json::Value = row.try_get("value_json")?;
    Ok(DailyMetric {
        project_id: row.try_get("project_id")?,
        date: row.try_get("metric_date")?,
        metric_key: row.try_get("metric_key")?,
        metric_name: row.try_get("metric_name")?,
        is_custom: row.try_get("is_custom")?,
        value: serde_json::from_value(value)?,
        source: SheetRef::new(
            row.try_get::<String, _>("spreadsheet_id")?,
            row.try_get::<String, _>("sheet_name")?,
        ),
        synced_at: row.try_get("synced_at")?,
    })
}

fn individual_from_row(row: &PgRow) -> Result<IndividualRecord, StoreError> {
    let fields: serde_json::Value = row.try_get("fields_json")?;
    Ok(IndividualRecord {
        project_id: row.try_get("project_id")?,
        unique_id: row.try_get("unique_id")?,
        date: row.try_get("record_date")?,
        fields: serde_json::from_value(fields)?,
        source: SheetRef::new(
            row.try_get::<String, _>("spreadsheet_id")?,
            row.try_get::<String, _>("sheet_name")?,
        ),
        synced_at: row.try_get("synced_at")?,
    })
}

fn range_bounds(range: Option<DateRange>) -> (Option<NaiveDate>, Option<NaiveDate>) {
    match range {
        Some(r) => (Some(r.start), Some(r.end)),
        None => (None, None),
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn get_config(
        &self,
        project_id: Uuid,
        scope: ScopeType,
    ) -> Result<Option<ProjectSyncConfig>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT config_json
              FROM sync_configs
             WHERE project_id = $1 AND scope = $2
            "#,
        )
        .bind(project_id)
        .bind(scope.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("config_json")?;
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }

    async fn list_configs(&self) -> Result<Vec<ProjectSyncConfig>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT config_json
              FROM sync_configs
             ORDER BY project_id, scope
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.try_get("config_json")?;
            out.push(serde_json::from_value(value)?);
        }
        Ok(out)
    }

    async fn save_config(&self, config: ProjectSyncConfig) -> Result<ProjectSyncConfig, StoreError> {
        let mut tx = self.pool.begin().await?;
        write_config(&mut tx, &config).await?;
        tx.commit().await?;
        Ok(config)
    }

    async fn save_settings(
        &self,
        mut config: ProjectSyncConfig,
    ) -> Result<ProjectSyncConfig, StoreError> {
        let mut tx = self.pool.begin().await?;
        if let Some(stored) = lock_config(&mut tx, config.project_id(), config.scope()).await? {
            config.adopt_sync_stamps(stored);
        }
        write_config(&mut tx, &config).await?;
        tx.commit().await?;
        Ok(config)
    }

    async fn update_schedule(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        update: ScheduleUpdate,
    ) -> Result<ProjectSyncConfig, StoreError> {
        self.modify_config(project_id, scope, |config| Ok(update.apply(config)?))
            .await
    }

    async fn delete_config(&self, project_id: Uuid, scope: ScopeType) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sync_configs WHERE project_id = $1 AND scope = $2")
            .bind(project_id)
            .bind(scope.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_status(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        self.modify_config(project_id, scope, |config| {
            update.apply(config.state_mut());
            Ok(())
        })
        .await?;
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
        let sheet = sheet.clone();
        self.modify_config(project_id, scope, move |config| {
            if let Some(sheet_config) = config.sheet_mut(&sheet) {
                sheet_config.last_synced_at = Some(at);
                if !headers.is_empty() {
                    sheet_config.headers = headers;
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn append_history(&self, row: SyncHistory) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_history (
                id, project_id, scope, sync_trigger, started_at, finished_at, status,
                sheets_synced, rows_processed, rows_inserted, rows_updated, rows_skipped,
                error_message, sheet_results
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(row.id)
        .bind(row.project_id)
        .bind(row.scope.as_str())
        .bind(enum_text(&row.trigger)?)
        .bind(row.started_at)
        .bind(row.finished_at)
        .bind(row.status.as_str())
        .bind(row.sheets_synced as i64)
        .bind(row.rows_processed as i64)
        .bind(row.rows_inserted as i64)
        .bind(row.rows_updated as i64)
        .bind(row.rows_skipped as i64)
        .bind(&row.error_message)
        .bind(serde_json::to_value(&row.sheet_results)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_history(
        &self,
        project_id: Uuid,
        scope: ScopeType,
        limit: usize,
    ) -> Result<Vec<SyncHistory>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, scope, sync_trigger, started_at, finished_at, status,
                   sheets_synced, rows_processed, rows_inserted, rows_updated, rows_skipped,
                   error_message, sheet_results
              FROM sync_history
             WHERE project_id = $1 AND scope = $2
             ORDER BY started_at DESC
             LIMIT $3
            "#,
        )
        .bind(project_id)
        .bind(scope.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }
}

/// A duplicate key aborts the whole batch; the transaction rolls back on drop.
fn insert_error(err: sqlx::Error, record: &MetricRecord) -> StoreError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::Conflict(record.dedup_key()),
        _ => StoreError::Database(err),
    }
}

fn enum_text<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Message(format!("expected string enum, got {other}"))),
    }
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn read_existing_keys(
        &self,
        project_id: Uuid,
        mode: SyncMode,
        range: Option<DateRange>,
    ) -> Result<HashSet<DedupKey>, StoreError> {
        let (start, end) = range_bounds(range);
        let mut keys = HashSet::new();
        match mode {
            SyncMode::DailyAggregate => {
                let rows = sqlx::query(
                    r#"
                    SELECT metric_date, metric_key
                      FROM daily_metrics
                     WHERE project_id = $1
                       AND ($2::date IS NULL OR metric_date >= $2)
                       AND ($3::date IS NULL OR metric_date <= $3)
                    "#,
                )
                .bind(project_id)
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await?;
                for row in rows {
                    keys.insert(DedupKey::Aggregate {
                        project_id,
                        date: row.try_get("metric_date")?,
                        metric_key: row.try_get("metric_key")?,
                    });
                }
            }
            SyncMode::IndividualRecords => {
                let rows = sqlx::query(
                    r#"
                    SELECT unique_id
                      FROM individual_records
                     WHERE project_id = $1
                       AND ($2::date IS NULL OR record_date >= $2)
                       AND ($3::date IS NULL OR record_date <= $3)
                    "#,
                )
                .bind(project_id)
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await?;
                for row in rows {
                    keys.insert(DedupKey::Individual {
                        project_id,
                        unique_id: row.try_get("unique_id")?,
                    });
                }
            }
        }
        debug!(%project_id, mode = mode.as_str(), keys = keys.len(), "loaded existing keys");
        Ok(keys)
    }

    async fn insert_rows(&self, rows: &[MetricRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in rows {
            match record {
                MetricRecord::Daily(m) => {
                    sqlx::query(
                        r#"
                        INSERT INTO daily_metrics (
                            id, project_id, metric_date, metric_key, metric_name, is_custom,
                            value_json, spreadsheet_id, sheet_name, synced_at
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                        "#,
                    )
                    .bind(record.record_id())
                    .bind(m.project_id)
                    .bind(m.date)
                    .bind(&m.metric_key)
                    .bind(&m.metric_name)
                    .bind(m.is_custom)
                    .bind(serde_json::to_value(&m.value)?)
                    .bind(&m.source.spreadsheet_id)
                    .bind(&m.source.sheet_name)
                    .bind(m.synced_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| insert_error(err, record))?;
                }
                MetricRecord::Individual(r) => {
                    sqlx::query(
                        r#"
                        INSERT INTO individual_records (
                            id, project_id, unique_id, record_date, fields_json,
                            spreadsheet_id, sheet_name, synced_at
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(record.record_id())
                    .bind(r.project_id)
                    .bind(&r.unique_id)
                    .bind(r.date)
                    .bind(serde_json::to_value(&r.fields)?)
                    .bind(&r.source.spreadsheet_id)
                    .bind(&r.source.sheet_name)
                    .bind(r.synced_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| insert_error(err, record))?;
                }
            }
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn update_rows(&self, rows: &[MetricRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for record in rows {
            let result = match record {
                MetricRecord::Daily(m) => {
                    sqlx::query(
                        r#"
                        UPDATE daily_metrics
                           SET metric_name = $4,
                               is_custom = $5,
                               value_json = $6,
                               spreadsheet_id = $7,
                               sheet_name = $8,
                               synced_at = $9
                         WHERE project_id = $1 AND metric_date = $2 AND metric_key = $3
                        "#,
                    )
                    .bind(m.project_id)
                    .bind(m.date)
                    .bind(&m.metric_key)
                    .bind(&m.metric_name)
                    .bind(m.is_custom)
                    .bind(serde_json::to_value(&m.value)?)
                    .bind(&m.source.spreadsheet_id)
                    .bind(&m.source.sheet_name)
                    .bind(m.synced_at)
                    .execute(&mut *tx)
                    .await?
                }
                MetricRecord::Individual(r) => {
                    sqlx::query(
                        r#"
                        UPDATE individual_records
                           SET record_date = $3,
                               fields_json = $4,
                               spreadsheet_id = $5,
                               sheet_name = $6,
                               synced_at = $7
                         WHERE project_id = $1 AND unique_id = $2
                        "#,
                    )
                    .bind(r.project_id)
                    .bind(&r.unique_id)
                    .bind(r.date)
                    .bind(serde_json::to_value(&r.fields)?)
                    .bind(&r.source.spreadsheet_id)
                    .bind(&r.source.sheet_name)
                    .bind(r.synced_at)
                    .execute(&mut *tx)
                    .await?
                }
            };
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written as usize)
    }

    async fn list_daily_metrics(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<DailyMetric>, StoreError> {
        let (start, end) = range_bounds(range);
        let rows = sqlx::query(
            r#"
            SELECT project_id, metric_date, metric_key, metric_name, is_custom, value_json,
                   spreadsheet_id, sheet_name, synced_at
              FROM daily_metrics
             WHERE project_id = $1
               AND ($2::date IS NULL OR metric_date >= $2)
               AND ($3::date IS NULL OR metric_date <= $3)
             ORDER BY metric_date, metric_key
            "#,
        )
        .bind(project_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(daily_from_row).collect()
    }

    async fn list_individual_records(
        &self,
        project_id: Uuid,
        range: Option<DateRange>,
    ) -> Result<Vec<IndividualRecord>, StoreError> {
        let (start, end) = range_bounds(range);
        let rows = sqlx::query(
            r#"
            SELECT project_id, unique_id, record_date, fields_json,
                   spreadsheet_id, sheet_name, synced_at
              FROM individual_records
             WHERE project_id = $1
               AND ($2::date IS NULL OR record_date >= $2)
               AND ($3::date IS NULL OR record_date <= $3)
             ORDER BY record_date, unique_id
            "#,
        )
        .bind(project_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(individual_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msync_core::{
        ColumnMapping, MetricValue, SheetConfig, SyncConfig, SyncResult, SyncState, SyncStatus,
        SyncTrigger,
    };

    /// Connects to `DATABASE_URL` and migrates; `None` skips the test.
    async fn store_from_env() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    fn config(project_id: Uuid) -> ProjectSyncConfig {
        ProjectSyncConfig::Single(SyncConfig {
            project_id,
            spreadsheet_id: "pg-sheet".into(),
            spreadsheet_name: None,
            sheets: vec![SheetConfig::new("Daily", ColumnMapping::new())],
            sync_mode: SyncMode::DailyAggregate,
            auto_sync_enabled: true,
            interval_hours: 1,
            state: SyncState::default(),
        })
    }

    fn daily(project_id: Uuid, date: &str, value: f64) -> MetricRecord {
        MetricRecord::Daily(DailyMetric {
            project_id,
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            metric_key: "spend".into(),
            metric_name: "Spend".into(),
            is_custom: false,
            value: MetricValue::Number(value),
            source: SheetRef::new("pg-sheet", "Daily"),
            synced_at: Utc::now(),
        })
    }

    #[test]
    fn enum_text_matches_serde_names() {
        assert_eq!(enum_text(&SyncTrigger::Scheduled).unwrap(), "scheduled");
        assert_eq!(enum_text(&SyncStatus::Syncing).unwrap(), "syncing");
        assert!(matches!(enum_text(&42), Err(StoreError::Message(_))));
    }

    #[tokio::test]
    async fn row_locked_writes_keep_each_other() {
        let Some(store) = store_from_env().await else {
            return;
        };
        let project_id = Uuid::new_v4();
        store.save_config(config(project_id)).await.unwrap();

        let at = Utc::now();
        store
            .update_status(
                project_id,
                ScopeType::Single,
                StatusUpdate::finished(false, at, Some(at), Some("quota".into())),
            )
            .await
            .unwrap();
        store
            .mark_sheet_synced(
                project_id,
                ScopeType::Single,
                &SheetRef::new("pg-sheet", "Daily"),
                at,
                vec!["Date".into()],
            )
            .await
            .unwrap();

        let mut edited = config(project_id);
        edited.set_interval_minutes(180).unwrap();
        let saved = store.save_settings(edited).await.unwrap();
        assert_eq!(saved.interval_minutes(), 180);
        assert_eq!(saved.state().sync_status, SyncStatus::Error);
        assert_eq!(saved.state().last_sync_error.as_deref(), Some("quota"));

        let bad = store
            .update_schedule(
                project_id,
                ScopeType::Single,
                ScheduleUpdate::Armed {
                    interval_minutes: 7,
                    next_sync_at: at,
                },
            )
            .await;
        assert!(matches!(bad, Err(StoreError::Config(_))));

        let mut stored = store
            .get_config(project_id, ScopeType::Single)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.interval_minutes(), 180);
        let sheet = stored.sheet_mut(&SheetRef::new("pg-sheet", "Daily")).unwrap();
        assert_eq!(sheet.headers, vec!["Date"]);
        assert!(sheet.last_synced_at.is_some());

        let missing = store
            .update_status(Uuid::new_v4(), ScopeType::Multi, StatusUpdate::syncing())
            .await;
        assert!(matches!(missing, Err(StoreError::ConfigNotFound { .. })));
        assert!(store.delete_config(project_id, ScopeType::Single).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_conflict_and_rolls_back() {
        let Some(store) = store_from_env().await else {
            return;
        };
        let project_id = Uuid::new_v4();
        store
            .insert_rows(&[daily(project_id, "2024-01-01", 1.0)])
            .await
            .unwrap();

        let err = store
            .insert_rows(&[
                daily(project_id, "2024-01-02", 2.0),
                daily(project_id, "2024-01-01", 3.0),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(DedupKey::Aggregate { .. })));

        let keys = store
            .read_existing_keys(project_id, SyncMode::DailyAggregate, None)
            .await
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(store.update_rows(&[daily(project_id, "2024-01-01", 4.0)]).await.unwrap(), 1);
        let metrics = store.list_daily_metrics(project_id, None).await.unwrap();
        assert_eq!(metrics[0].value, MetricValue::Number(4.0));
    }

    #[tokio::test]
    async fn history_reads_back_newest_first() {
        let Some(store) = store_from_env().await else {
            return;
        };
        let project_id = Uuid::new_v4();
        let started = Utc::now();
        for (offset, trigger) in [(0, SyncTrigger::Scheduled), (1, SyncTrigger::Manual)] {
            let at = started + chrono::Duration::minutes(offset);
            let result = SyncResult {
                run_id: Uuid::new_v4(),
                project_id,
                scope: ScopeType::Multi,
                trigger,
                started_at: at,
                finished_at: at,
                total_inserted: 2,
                total_updated: 0,
                total_skipped: 1,
                success: true,
                error: None,
                per_sheet_results: vec![],
            };
            store.append_history(SyncHistory::from_result(&result)).await.unwrap();
        }

        let rows = store
            .list_history(project_id, ScopeType::Multi, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].trigger, SyncTrigger::Manual);
        assert_eq!(rows[1].trigger, SyncTrigger::Scheduled);
        assert_eq!(rows[1].rows_inserted, 2);
        assert_eq!(rows[1].status, SyncStatus::Success);
    }
}
