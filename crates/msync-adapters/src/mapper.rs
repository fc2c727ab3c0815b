//! Column mapper: raw sheet rows to typed rows shaped by sync mode.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use msync_core::{
    ColumnMapping, DailyMetric, IndividualRecord, MetricColumn, MetricRecord, MetricValue,
    SheetRef, SyncMode, ValueType, DATE_KEY, UNIQUE_ID_KEY,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Largest serial day number Sheets renders (9999-12-31).
const MAX_SERIAL_DAY: f64 = 2_958_465.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub row_number: usize,
    pub column: String,
    pub metric_key: String,
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedValue {
    pub metric_key: String,
    pub metric_name: String,
    pub is_custom: bool,
    pub value: MetricValue,
}

/// Typed cells of one row, before the sync mode decides its shape.
#[derive(Debug, Default)]
struct RowCells {
    date: Option<NaiveDate>,
    unique_id: Option<String>,
    values: Vec<MappedValue>,
    field_errors: Vec<FieldError>,
}

/// A data row shaped for its sync mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum MappedRow {
    /// One day of metrics; fans out to one `DailyMetric` per value.
    Daily {
        row_number: usize,
        date: NaiveDate,
        values: Vec<MappedValue>,
    },
    /// One event keyed by its unique id; the values become its fields.
    Individual {
        row_number: usize,
        date: NaiveDate,
        unique_id: String,
        fields: Vec<MappedValue>,
    },
}

impl MappedRow {
    /// One-based row number in the sheet.
    pub fn row_number(&self) -> usize {
        match self {
            Self::Daily { row_number, .. } | Self::Individual { row_number, .. } => *row_number,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Daily { date, .. } | Self::Individual { date, .. } => *date,
        }
    }

    pub fn unique_id(&self) -> Option<&str> {
        match self {
            Self::Daily { .. } => None,
            Self::Individual { unique_id, .. } => Some(unique_id),
        }
    }

    pub fn values(&self) -> &[MappedValue] {
        match self {
            Self::Daily { values, .. } => values,
            Self::Individual { fields, .. } => fields,
        }
    }

    pub fn into_records(
        self,
        project_id: Uuid,
        source: &SheetRef,
        synced_at: DateTime<Utc>,
    ) -> Vec<MetricRecord> {
        match self {
            Self::Daily { date, values, .. } => values
                .into_iter()
                .map(|v| {
                    MetricRecord::Daily(DailyMetric {
                        project_id,
                        date,
                        metric_key: v.metric_key,
                        metric_name: v.metric_name,
                        is_custom: v.is_custom,
                        value: v.value,
                        source: source.clone(),
                        synced_at,
                    })
                })
                .collect(),
            Self::Individual {
                date,
                unique_id,
                fields,
                ..
            } => vec![MetricRecord::Individual(IndividualRecord {
                project_id,
                unique_id,
                date,
                fields: fields
                    .into_iter()
                    .map(|v| (v.metric_key, v.value))
                    .collect::<BTreeMap<_, _>>(),
                source: source.clone(),
                synced_at,
            })],
        }
    }
}

/// Mapping outcome for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMapping {
    pub row_number: usize,
    /// `None` when a key field the mode needs is empty or unparseable.
    pub row: Option<MappedRow>,
    pub field_errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappedSheet {
    pub headers: Vec<String>,
    pub records: Vec<MappedRow>,
    pub skipped: usize,
    pub field_errors: usize,
}

/// Maps one row for `mode`. Aggregate rows need a date; individual rows need a date and a
/// unique id.
pub fn map_row(
    row_number: usize,
    raw_row: &[String],
    mapping: &ColumnMapping,
    mode: SyncMode,
) -> RowMapping {
    let cells = read_cells(row_number, raw_row, mapping);
    let row = match (mode, cells.date, cells.unique_id) {
        (SyncMode::DailyAggregate, Some(date), _) => Some(MappedRow::Daily {
            row_number,
            date,
            values: cells.values,
        }),
        (SyncMode::IndividualRecords, Some(date), Some(unique_id)) => {
            Some(MappedRow::Individual {
                row_number,
                date,
                unique_id,
                fields: cells.values,
            })
        }
        _ => None,
    };
    RowMapping {
        row_number,
        row,
        field_errors: cells.field_errors,
    }
}

fn read_cells(row_number: usize, raw_row: &[String], mapping: &ColumnMapping) -> RowCells {
    let mut cells = RowCells::default();
    for (letter, metric) in &mapping.columns {
        let Some(index) = msync_core::column_index(letter) else {
            continue;
        };
        let Some(raw) = raw_row.get(index).map(|c| c.trim()).filter(|c| !c.is_empty()) else {
            continue;
        };

        let parsed = match metric.metric_key.as_str() {
            DATE_KEY => parse_date(raw).map(|d| {
                cells.date = Some(d);
            }),
            UNIQUE_ID_KEY => {
                cells.unique_id = Some(raw.to_string());
                Ok(())
            }
            _ => parse_value(raw, metric.value_type).map(|value| {
                cells.values.push(mapped(metric, value));
            }),
        };

        if let Err(reason) = parsed {
            cells.field_errors.push(FieldError {
                row_number,
                column: letter.clone(),
                metric_key: metric.metric_key.clone(),
                raw: raw.to_string(),
                reason,
            });
        }
    }
    cells
        .values
        .sort_by_key(|v| mapping.column_for(&v.metric_key).and_then(msync_core::column_index));
    cells
}

fn mapped(metric: &MetricColumn, value: MetricValue) -> MappedValue {
    MappedValue {
        metric_key: metric.metric_key.clone(),
        metric_name: metric.metric_name.clone(),
        is_custom: metric.is_custom,
        value,
    }
}

/// Maps data rows; `first_row_number` is the sheet row of `rows[0]`.
pub fn map_rows(
    rows: &[Vec<String>],
    first_row_number: usize,
    mapping: &ColumnMapping,
    mode: SyncMode,
) -> MappedSheet {
    let mut out = MappedSheet::default();
    for (offset, row) in rows.iter().enumerate() {
        let mapping = map_row(first_row_number + offset, row, mapping, mode);
        out.field_errors += mapping.field_errors.len();
        match mapping.row {
            Some(row) => out.records.push(row),
            None => out.skipped += 1,
        }
    }
    out
}

/// Maps a full sheet whose first row is the header row.
pub fn map_sheet(values: &[Vec<String>], mapping: &ColumnMapping, mode: SyncMode) -> MappedSheet {
    let Some((header, data)) = values.split_first() else {
        return MappedSheet::default();
    };
    let mut out = map_rows(data, 2, mapping, mode);
    out.headers = header.iter().map(|h| h.trim().to_string()).collect();
    out
}

pub fn parse_value(raw: &str, value_type: ValueType) -> Result<MetricValue, String> {
    match value_type {
        ValueType::Numeric => parse_number(raw).map(MetricValue::Number),
        ValueType::Text => Ok(MetricValue::Text(raw.trim().to_string())),
        ValueType::Date => parse_date(raw).map(MetricValue::Date),
    }
}

/// Accepts `$1,234.50`, ` 12 `, `3.5%` and accounting negatives like `(40)`.
pub fn parse_number(raw: &str) -> Result<f64, String> {
    let mut text = raw.trim();
    let negative = text.starts_with('(') && text.ends_with(')');
    if negative {
        text = &text[1..text.len() - 1];
    }
    text = text.strip_suffix('%').unwrap_or(text);

    let cleaned = text
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | '¥' | ',' | ' ' | '\u{a0}'))
        .collect::<String>();
    if cleaned.is_empty() {
        return Err(format!("not a number: {raw:?}"));
    }
    let value = cleaned
        .parse::<f64>()
        .map_err(|_| format!("not a number: {raw:?}"))?;
    if !value.is_finite() {
        return Err(format!("not a finite number: {raw:?}"));
    }
    Ok(if negative { -value } else { value })
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    let text = raw.trim();
    // Datetime cells: keep the date part.
    let date_part = text
        .split(|c: char| c == ' ' || c == 'T')
        .next()
        .unwrap_or(text);

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, format) {
            return Ok(date);
        }
    }

    if let Ok(serial) = date_part.parse::<f64>() {
        if serial >= 1.0 && serial <= MAX_SERIAL_DAY {
            let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)
                .ok_or_else(|| "invalid serial epoch".to_string())?;
            return epoch
                .checked_add_signed(Duration::days(serial.trunc() as i64))
                .ok_or_else(|| format!("serial date out of range: {raw:?}"));
        }
    }

    Err(format!("unrecognized date: {raw:?}"))
}
