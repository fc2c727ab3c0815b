//! Persisted sync configuration: spreadsheets, sheets, column mappings and status.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{ScopeType, SheetRef, SyncMode, SyncStatus};

/// Metric key reserved for the row date column.
pub const DATE_KEY: &str = "date";
/// Metric key reserved for the record identifier column (individual-records mode).
pub const UNIQUE_ID_KEY: &str = "unique_id";

pub const MAX_INTERVAL_HOURS: u32 = 24 * 7;
pub const MIN_FREQUENCY_MINUTES: u32 = 5;
pub const MAX_FREQUENCY_MINUTES: u32 = 60 * 24 * 7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid sync interval {value} {unit}")]
    InvalidInterval { value: u32, unit: &'static str },
    #[error("spreadsheet id must not be empty")]
    EmptySpreadsheetId,
    #[error("spreadsheet {spreadsheet_id} is configured more than once")]
    DuplicateSpreadsheet { spreadsheet_id: String },
    #[error("sheet {sheet}: invalid column letter {column:?}")]
    InvalidColumnLetter { sheet: String, column: String },
    #[error("sheet {sheet}: mapping has no date column")]
    MissingDateColumn { sheet: String },
    #[error("sheet {sheet}: individual records mode requires a unique id column")]
    MissingUniqueIdColumn { sheet: String },
    #[error("sheet {sheet}: mapping has no metric columns")]
    NoMetricColumns { sheet: String },
    #[error("sheet {sheet}: metric key {metric_key:?} is mapped more than once")]
    DuplicateMetricKey { sheet: String, metric_key: String },
    #[error("auto sync is enabled but no sheets are selected")]
    NoSheetsSelected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Numeric,
    Text,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricColumn {
    pub metric_key: String,
    pub metric_name: String,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default)]
    pub value_type: ValueType,
}

impl MetricColumn {
    pub fn new(metric_key: impl Into<String>, metric_name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            metric_key: metric_key.into(),
            metric_name: metric_name.into(),
            is_custom: false,
            value_type,
        }
    }

    pub fn custom(mut self) -> Self {
        self.is_custom = true;
        self
    }

    pub fn is_reserved(&self) -> bool {
        self.metric_key == DATE_KEY || self.metric_key == UNIQUE_ID_KEY
    }
}

/// Column letter (`A`, `B`, ..., `AA`) to metric mapping for one sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ColumnMapping {
    pub columns: BTreeMap<String, MetricColumn>,
}

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, metric: MetricColumn) -> Self {
        self.columns.insert(column.trim().to_ascii_uppercase(), metric);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_for(&self, metric_key: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(_, m)| m.metric_key == metric_key)
            .map(|(letter, _)| letter.as_str())
    }

    /// Mapped columns with their zero-based indices, in column order.
    pub fn resolved(&self) -> Vec<(usize, &MetricColumn)> {
        let mut out = self
            .columns
            .iter()
            .filter_map(|(letter, metric)| column_index(letter).map(|idx| (idx, metric)))
            .collect::<Vec<_>>();
        out.sort_by_key(|(idx, _)| *idx);
        out
    }

    pub fn validate(&self, sheet: &str, mode: SyncMode) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (letter, metric) in &self.columns {
            if column_index(letter).is_none() {
                return Err(ConfigError::InvalidColumnLetter {
                    sheet: sheet.to_string(),
                    column: letter.clone(),
                });
            }
            if !seen.insert(metric.metric_key.as_str()) {
                return Err(ConfigError::DuplicateMetricKey {
                    sheet: sheet.to_string(),
                    metric_key: metric.metric_key.clone(),
                });
            }
        }

        if self.column_for(DATE_KEY).is_none() {
            return Err(ConfigError::MissingDateColumn {
                sheet: sheet.to_string(),
            });
        }

        match mode {
            SyncMode::DailyAggregate => {
                if !self.columns.values().any(|m| !m.is_reserved()) {
                    return Err(ConfigError::NoMetricColumns {
                        sheet: sheet.to_string(),
                    });
                }
            }
            SyncMode::IndividualRecords => {
                if self.column_for(UNIQUE_ID_KEY).is_none() {
                    return Err(ConfigError::MissingUniqueIdColumn {
                        sheet: sheet.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Zero-based index of a spreadsheet column letter (`A` → 0, `Z` → 25, `AA` → 26).
pub fn column_index(letter: &str) -> Option<usize> {
    let letter = letter.trim();
    if letter.is_empty() || letter.len() > 3 {
        return None;
    }
    let mut index = 0usize;
    for ch in letter.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        let digit = (ch.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        index = index * 26 + digit;
    }
    Some(index - 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetConfig {
    pub sheet_name: String,
    #[serde(default)]
    pub sheet_id: Option<i64>,
    #[serde(default = "default_selected")]
    pub selected: bool,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mapping: ColumnMapping,
}

fn default_selected() -> bool {
    true
}

impl SheetConfig {
    pub fn new(sheet_name: impl Into<String>, mapping: ColumnMapping) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            sheet_id: None,
            selected: true,
            headers: Vec::new(),
            last_synced_at: None,
            mapping,
        }
    }
}

/// Status fields shared by both config kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncState {
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync_error: Option<String>,
}

/// Auto sync of a single spreadsheet; interval expressed in hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub project_id: Uuid,
    pub spreadsheet_id: String,
    #[serde(default)]
    pub spreadsheet_name: Option<String>,
    #[serde(default)]
    pub sheets: Vec<SheetConfig>,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub auto_sync_enabled: bool,
    pub interval_hours: u32,
    #[serde(flatten)]
    pub state: SyncState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadsheetEntry {
    pub spreadsheet_id: String,
    #[serde(default)]
    pub spreadsheet_name: Option<String>,
    #[serde(default)]
    pub sheets: Vec<SheetConfig>,
}

/// Auto sync over an ordered list of spreadsheets; frequency expressed in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSpreadsheetSyncConfig {
    pub project_id: Uuid,
    #[serde(default)]
    pub spreadsheets: Vec<SpreadsheetEntry>,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub auto_sync_enabled: bool,
    pub frequency_minutes: u32,
    #[serde(flatten)]
    pub state: SyncState,
}

/// One selected sheet of a config, flattened in processing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTarget {
    pub sheet: SheetRef,
    pub mapping: ColumnMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProjectSyncConfig {
    Single(SyncConfig),
    Multi(MultiSpreadsheetSyncConfig),
}

impl ProjectSyncConfig {
    pub fn project_id(&self) -> Uuid {
        match self {
            Self::Single(c) => c.project_id,
            Self::Multi(c) => c.project_id,
        }
    }

    pub fn scope(&self) -> ScopeType {
        match self {
            Self::Single(_) => ScopeType::Single,
            Self::Multi(_) => ScopeType::Multi,
        }
    }

    pub fn sync_mode(&self) -> SyncMode {
        match self {
            Self::Single(c) => c.sync_mode,
            Self::Multi(c) => c.sync_mode,
        }
    }

    pub fn auto_sync_enabled(&self) -> bool {
        match self {
            Self::Single(c) => c.auto_sync_enabled,
            Self::Multi(c) => c.auto_sync_enabled,
        }
    }

    pub fn interval_minutes(&self) -> u32 {
        match self {
            Self::Single(c) => c.interval_hours.saturating_mul(60),
            Self::Multi(c) => c.frequency_minutes,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes()))
    }

    pub fn state(&self) -> &SyncState {
        match self {
            Self::Single(c) => &c.state,
            Self::Multi(c) => &c.state,
        }
    }

    pub fn state_mut(&mut self) -> &mut SyncState {
        match self {
            Self::Single(c) => &mut c.state,
            Self::Multi(c) => &mut c.state,
        }
    }

    /// Selected sheets of every spreadsheet, in configured order.
    pub fn sheet_targets(&self) -> Vec<SheetTarget> {
        let selected = |spreadsheet_id: &str, sheets: &[SheetConfig]| {
            sheets
                .iter()
                .filter(|s| s.selected)
                .map(|s| SheetTarget {
                    sheet: SheetRef::new(spreadsheet_id, s.sheet_name.clone()),
                    mapping: s.mapping.clone(),
                })
                .collect::<Vec<_>>()
        };
        match self {
            Self::Single(c) => selected(&c.spreadsheet_id, &c.sheets),
            Self::Multi(c) => c
                .spreadsheets
                .iter()
                .flat_map(|entry| selected(&entry.spreadsheet_id, &entry.sheets))
                .collect(),
        }
    }

    pub fn sheet_mut(&mut self, sheet: &SheetRef) -> Option<&mut SheetConfig> {
        let sheets = match self {
            Self::Single(c) if c.spreadsheet_id == sheet.spreadsheet_id => &mut c.sheets,
            Self::Single(_) => return None,
            Self::Multi(c) => {
                &mut c
                    .spreadsheets
                    .iter_mut()
                    .find(|e| e.spreadsheet_id == sheet.spreadsheet_id)?
                    .sheets
            }
        };
        sheets.iter_mut().find(|s| s.sheet_name == sheet.sheet_name)
    }

    pub fn set_auto_sync(&mut self, enabled: bool) {
        match self {
            Self::Single(c) => c.auto_sync_enabled = enabled,
            Self::Multi(c) => c.auto_sync_enabled = enabled,
        }
    }

    /// Single configs run on whole hours; anything else is rejected.
    pub fn set_interval_minutes(&mut self, minutes: u32) -> Result<(), ConfigError> {
        let invalid = ConfigError::InvalidInterval {
            value: minutes,
            unit: "minutes",
        };
        match self {
            Self::Single(c) => {
                let hours = minutes / 60;
                if minutes % 60 != 0 || hours == 0 || hours > MAX_INTERVAL_HOURS {
                    return Err(invalid);
                }
                c.interval_hours = hours;
            }
            Self::Multi(c) => {
                if !(MIN_FREQUENCY_MINUTES..=MAX_FREQUENCY_MINUTES).contains(&minutes) {
                    return Err(invalid);
                }
                c.frequency_minutes = minutes;
            }
        }
        Ok(())
    }

    /// Takes sync status, last-run fields and per-sheet stamps from `stored`. Settings and
    /// `next_sync_at` stay as they are on `self`.
    pub fn adopt_sync_stamps(&mut self, mut stored: ProjectSyncConfig) {
        let next_sync_at = self.state().next_sync_at;
        *self.state_mut() = stored.state().clone();
        self.state_mut().next_sync_at = next_sync_at;
        for target in stored.sheet_targets() {
            let (Some(from), Some(to)) = (stored.sheet_mut(&target.sheet), self.sheet_mut(&target.sheet))
            else {
                continue;
            };
            if to.last_synced_at.is_none() {
                to.last_synced_at = from.last_synced_at;
            }
            if to.headers.is_empty() {
                to.headers = std::mem::take(&mut from.headers);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Single(c) => {
                if c.interval_hours == 0 || c.interval_hours > MAX_INTERVAL_HOURS {
                    return Err(ConfigError::InvalidInterval {
                        value: c.interval_hours,
                        unit: "hours",
                    });
                }
                if c.spreadsheet_id.trim().is_empty() {
                    return Err(ConfigError::EmptySpreadsheetId);
                }
            }
            Self::Multi(c) => {
                if !(MIN_FREQUENCY_MINUTES..=MAX_FREQUENCY_MINUTES).contains(&c.frequency_minutes) {
                    return Err(ConfigError::InvalidInterval {
                        value: c.frequency_minutes,
                        unit: "minutes",
                    });
                }
                let mut seen = HashSet::new();
                for entry in &c.spreadsheets {
                    if entry.spreadsheet_id.trim().is_empty() {
                        return Err(ConfigError::EmptySpreadsheetId);
                    }
                    if !seen.insert(entry.spreadsheet_id.as_str()) {
                        return Err(ConfigError::DuplicateSpreadsheet {
                            spreadsheet_id: entry.spreadsheet_id.clone(),
                        });
                    }
                }
            }
        }

        let targets = self.sheet_targets();
        for target in &targets {
            target
                .mapping
                .validate(&target.sheet.to_string(), self.sync_mode())?;
        }
        if self.auto_sync_enabled() && targets.is_empty() {
            return Err(ConfigError::NoSheetsSelected);
        }
        Ok(())
    }
}
