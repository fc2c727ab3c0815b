//! Core domain model for msync: canonical metric records, sync results and history.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod clock;
pub mod config;

pub use clock::{Clock, SystemClock};
pub use config::{
    column_index, ColumnMapping, ConfigError, MetricColumn, MultiSpreadsheetSyncConfig,
    ProjectSyncConfig, SheetConfig, SheetTarget, SpreadsheetEntry, SyncConfig, SyncState,
    ValueType, DATE_KEY, UNIQUE_ID_KEY,
};

pub const CRATE_NAME: &str = "msync-core";

/// How fetched rows are shaped and deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// One row per day; every mapped metric column becomes a `DailyMetric`.
    DailyAggregate,
    /// One row per event, keyed by a unique identifier column.
    IndividualRecords,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyAggregate => "daily_aggregate",
            Self::IndividualRecords => "individual_records",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Whether a project's auto sync covers one spreadsheet or an ordered set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Single,
    Multi,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "multi" => Some(Self::Multi),
            _ => None,
        }
    }

    /// The scope a project's auto sync is exclusive with.
    pub fn other(self) -> Self {
        match self {
            Self::Single => Self::Multi,
            Self::Multi => Self::Single,
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
}

/// Identifies one sheet (tab) inside one spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetRef {
    pub spreadsheet_id: String,
    pub sheet_name: String,
}

impl SheetRef {
    pub fn new(spreadsheet_id: impl Into<String>, sheet_name: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: sheet_name.into(),
        }
    }
}

impl fmt::Display for SheetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.spreadsheet_id, self.sheet_name)
    }
}

/// A parsed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetric {
    pub project_id: Uuid,
    pub date: NaiveDate,
    pub metric_key: String,
    pub metric_name: String,
    pub is_custom: bool,
    pub value: MetricValue,
    pub source: SheetRef,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualRecord {
    pub project_id: Uuid,
    pub unique_id: String,
    pub date: NaiveDate,
    pub fields: BTreeMap<String, MetricValue>,
    pub source: SheetRef,
    pub synced_at: DateTime<Utc>,
}

/// Reconciled row ready for persistence, tagged by sync mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MetricRecord {
    Daily(DailyMetric),
    Individual(IndividualRecord),
}

impl MetricRecord {
    pub fn dedup_key(&self) -> DedupKey {
        match self {
            Self::Daily(m) => DedupKey::Aggregate {
                project_id: m.project_id,
                date: m.date,
                metric_key: m.metric_key.clone(),
            },
            Self::Individual(r) => DedupKey::Individual {
                project_id: r.project_id,
                unique_id: r.unique_id.clone(),
            },
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Daily(m) => m.date,
            Self::Individual(r) => r.date,
        }
    }

    pub fn project_id(&self) -> Uuid {
        match self {
            Self::Daily(m) => m.project_id,
            Self::Individual(r) => r.project_id,
        }
    }

    /// Deterministic row id derived from the dedup key.
    pub fn record_id(&self) -> Uuid {
        self.dedup_key().stable_id()
    }
}

/// Attribute tuple deciding whether a fetched row is new or already known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DedupKey {
    Aggregate {
        project_id: Uuid,
        date: NaiveDate,
        metric_key: String,
    },
    Individual {
        project_id: Uuid,
        unique_id: String,
    },
}

impl DedupKey {
    pub fn stable_id(&self) -> Uuid {
        let source = match self {
            Self::Aggregate {
                project_id,
                date,
                metric_key,
            } => format!("daily:{project_id}:{date}:{metric_key}"),
            Self::Individual {
                project_id,
                unique_id,
            } => format!("individual:{project_id}:{unique_id}"),
        };
        Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes())
    }
}

/// Inclusive date window used to narrow existing-key lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn covering(dates: impl IntoIterator<Item = NaiveDate>) -> Option<Self> {
        let mut iter = dates.into_iter();
        let first = iter.next()?;
        let (start, end) = iter.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Unauthorized,
    NotFound,
    RateLimited,
    Network,
    Timeout,
}

/// Why one sheet of a run produced no (or partial) data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SheetError {
    Fetch { kind: FetchErrorKind, message: String },
    Persist { message: String },
    Config { message: String },
}

impl SheetError {
    /// Configuration and auth failures fail the whole run; the rest only reduce totals.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::Fetch {
                    kind: FetchErrorKind::Unauthorized,
                    ..
                }
        )
    }
}

impl fmt::Display for SheetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch { kind, message } => write!(f, "fetch error ({kind:?}): {message}"),
            Self::Persist { message } => write!(f, "persist error: {message}"),
            Self::Config { message } => write!(f, "configuration error: {message}"),
        }
    }
}

/// Outcome of syncing one sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetResult {
    pub sheet: SheetRef,
    pub rows_read: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub field_errors: usize,
    pub error: Option<SheetError>,
}

impl SheetResult {
    pub fn empty(sheet: SheetRef) -> Self {
        Self {
            sheet,
            rows_read: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            field_errors: 0,
            error: None,
        }
    }

    pub fn failed(sheet: SheetRef, error: SheetError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(sheet)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Aggregated outcome of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub project_id: Uuid,
    pub scope: ScopeType,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub per_sheet_results: Vec<SheetResult>,
    pub total_inserted: usize,
    pub total_updated: usize,
    pub total_skipped: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl SyncResult {
    /// A run that failed before any sheet was attempted.
    pub fn aborted(
        project_id: Uuid,
        scope: ScopeType,
        trigger: SyncTrigger,
        at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project_id,
            scope,
            trigger,
            started_at: at,
            finished_at: at,
            per_sheet_results: Vec::new(),
            total_inserted: 0,
            total_updated: 0,
            total_skipped: 0,
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn sheets_synced(&self) -> usize {
        self.per_sheet_results.iter().filter(|r| !r.is_error()).count()
    }

    pub fn rows_processed(&self) -> usize {
        self.per_sheet_results.iter().map(|r| r.rows_read).sum()
    }
}

/// Append-only audit row, one per orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistory {
    pub id: Uuid,
    pub project_id: Uuid,
    pub scope: ScopeType,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub sheets_synced: usize,
    pub rows_processed: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_skipped: usize,
    pub error_message: Option<String>,
    pub sheet_results: Vec<SheetResult>,
}

impl SyncHistory {
    pub fn from_result(result: &SyncResult) -> Self {
        Self {
            id: result.run_id,
            project_id: result.project_id,
            scope: result.scope,
            trigger: result.trigger,
            started_at: result.started_at,
            finished_at: result.finished_at,
            status: if result.success {
                SyncStatus::Success
            } else {
                SyncStatus::Error
            },
            sheets_synced: result.sheets_synced(),
            rows_processed: result.rows_processed(),
            rows_inserted: result.total_inserted,
            rows_updated: result.total_updated,
            rows_skipped: result.total_skipped,
            error_message: result.error.clone(),
            sheet_results: result.per_sheet_results.clone(),
        }
    }
}
