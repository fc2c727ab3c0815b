//! One (spreadsheet, sheet) pass: fetch, map, reconcile, persist.

use std::sync::Arc;
use std::time::Duration;

use msync_adapters::{map_sheet, CredentialProvider, FetchError, SheetFetcher};
use msync_core::{
    ColumnMapping, DateRange, MetricRecord, SheetError, SheetRef, SheetResult, SyncMode,
};
use msync_storage::MetricsStore;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::reconcile::reconcile;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub fetch_timeout: Duration,
    /// Rows per atomic insert/update call.
    pub write_batch_size: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            write_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetExecution {
    pub result: SheetResult,
    /// Header row seen on this fetch; empty when the fetch failed.
    pub headers: Vec<String>,
}

impl SheetExecution {
    fn failed(sheet: &SheetRef, error: SheetError) -> Self {
        Self {
            result: SheetResult::failed(sheet.clone(), error),
            headers: Vec::new(),
        }
    }
}

pub struct SheetSyncExecutor {
    fetcher: Arc<dyn SheetFetcher>,
    credentials: Arc<dyn CredentialProvider>,
    metrics: Arc<dyn MetricsStore>,
    clock: Arc<dyn Clock>,
    settings: ExecutorSettings,
}

impl SheetSyncExecutor {
    pub fn new(
        fetcher: Arc<dyn SheetFetcher>,
        credentials: Arc<dyn CredentialProvider>,
        metrics: Arc<dyn MetricsStore>,
        clock: Arc<dyn Clock>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            fetcher,
            credentials,
            metrics,
            clock,
            settings,
        }
    }

    /// Never fails past this boundary: every problem lands in the returned `SheetResult`.
    pub async fn execute(
        &self,
        project_id: Uuid,
        sheet: &SheetRef,
        mapping: &ColumnMapping,
        mode: SyncMode,
    ) -> SheetExecution {
        let span = tracing::info_span!(
            "sheet_sync",
            %project_id,
            spreadsheet_id = %sheet.spreadsheet_id,
            sheet_name = %sheet.sheet_name,
            mode = mode.as_str()
        );
        let execution = self
            .execute_inner(project_id, sheet, mapping, mode)
            .instrument(span.clone())
            .await;

        span.in_scope(|| match &execution.result.error {
            Some(err) => warn!(error = %err, "sheet sync failed"),
            None => info!(
                rows_read = execution.result.rows_read,
                inserted = execution.result.inserted,
                updated = execution.result.updated,
                skipped = execution.result.skipped,
                "sheet synced"
            ),
        });
        execution
    }

    async fn execute_inner(
        &self,
        project_id: Uuid,
        sheet: &SheetRef,
        mapping: &ColumnMapping,
        mode: SyncMode,
    ) -> SheetExecution {
        if let Err(err) = mapping.validate(&sheet.to_string(), mode) {
            return SheetExecution::failed(
                sheet,
                SheetError::Config {
                    message: err.to_string(),
                },
            );
        }

        let credentials = match self.credentials.credentials(project_id).await {
            Ok(c) => c,
            Err(err) => return SheetExecution::failed(sheet, err.into()),
        };

        let fetch = self
            .fetcher
            .fetch_rows(&sheet.spreadsheet_id, &sheet.sheet_name, &credentials);
        let values = match tokio::time::timeout(self.settings.fetch_timeout, fetch).await {
            Ok(Ok(values)) => values,
            Ok(Err(err)) => return SheetExecution::failed(sheet, err.into()),
            Err(_) => {
                let err = FetchError::Timeout(format!(
                    "fetch exceeded {}s",
                    self.settings.fetch_timeout.as_secs_f64()
                ));
                return SheetExecution::failed(sheet, err.into());
            }
        };

        let mapped = map_sheet(&values, mapping, mode);
        let mut result = SheetResult::empty(sheet.clone());
        result.rows_read = values.len().saturating_sub(1);
        result.skipped = mapped.skipped;
        result.field_errors = mapped.field_errors;
        let headers = mapped.headers;

        let synced_at = self.clock.now();
        let records = mapped
            .records
            .into_iter()
            .flat_map(|r| r.into_records(project_id, sheet, synced_at))
            .collect::<Vec<_>>();
        if records.is_empty() {
            debug!("no mapped records");
            return SheetExecution { result, headers };
        }

        let range = match mode {
            SyncMode::DailyAggregate => DateRange::covering(records.iter().map(MetricRecord::date)),
            SyncMode::IndividualRecords => None,
        };
        let existing = match self.metrics.read_existing_keys(project_id, mode, range).await {
            Ok(keys) => keys,
            Err(err) => {
                result.error = Some(SheetError::Persist {
                    message: format!("reading existing keys: {err}"),
                });
                return SheetExecution { result, headers };
            }
        };

        let plan = reconcile(records, &existing);
        debug!(
            inserts = plan.to_insert.len(),
            updates = plan.to_update.len(),
            superseded = plan.superseded,
            "reconciled batch"
        );

        let batch = self.settings.write_batch_size.max(1);
        for chunk in plan.to_insert.chunks(batch) {
            match self.metrics.insert_rows(chunk).await {
                Ok(n) => result.inserted += n,
                Err(err) => {
                    result.error = Some(SheetError::Persist {
                        message: format!("inserting rows: {err}"),
                    });
                    return SheetExecution { result, headers };
                }
            }
        }
        for chunk in plan.to_update.chunks(batch) {
            match self.metrics.update_rows(chunk).await {
                Ok(n) => result.updated += n,
                Err(err) => {
                    result.error = Some(SheetError::Persist {
                        message: format!("updating rows: {err}"),
                    });
                    return SheetExecution { result, headers };
                }
            }
        }

        SheetExecution { result, headers }
    }
}
