//! Fixture-backed sheet fetcher for offline runs and tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{FetchError, SheetCredentials, SheetFetcher, SheetInfo};

/// One spreadsheet as stored under the fixtures directory (`<name>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureSpreadsheet {
    pub spreadsheet_id: String,
    #[serde(default)]
    pub spreadsheet_name: Option<String>,
    #[serde(default)]
    pub sheets: Vec<FixtureSheet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureSheet {
    #[serde(default)]
    pub sheet_id: Option<i64>,
    pub sheet_name: String,
    /// Header row first, then data rows.
    #[serde(default)]
    pub values: Vec<Vec<String>>,
}

type SheetKey = (String, String);

#[derive(Debug, Default)]
pub struct FixtureSheetFetcher {
    spreadsheets: RwLock<HashMap<String, Vec<SheetInfo>>>,
    rows: RwLock<HashMap<SheetKey, Vec<Vec<String>>>>,
    failures: RwLock<HashMap<SheetKey, FetchError>>,
    delay: RwLock<Option<Duration>>,
    fetches: AtomicUsize,
}

impl FixtureSheetFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.json` spreadsheet fixture in `dir`, in file name order.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading fixtures dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut spreadsheets = HashMap::new();
        let mut rows = HashMap::new();
        for path in paths {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let fixture: FixtureSpreadsheet = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            index_fixture(&mut spreadsheets, &mut rows, fixture);
        }
        debug!(dir = %dir.display(), spreadsheets = spreadsheets.len(), "loaded sheet fixtures");

        Ok(Self {
            spreadsheets: RwLock::new(spreadsheets),
            rows: RwLock::new(rows),
            ..Self::default()
        })
    }

    pub async fn add_spreadsheet(&self, fixture: FixtureSpreadsheet) {
        let mut spreadsheets = self.spreadsheets.write().await;
        let mut rows = self.rows.write().await;
        index_fixture(&mut spreadsheets, &mut rows, fixture);
    }

    /// Sets (or replaces) one sheet's values, registering the sheet if needed.
    pub async fn set_rows(&self, spreadsheet_id: &str, sheet_name: &str, values: Vec<Vec<String>>) {
        let mut spreadsheets = self.spreadsheets.write().await;
        let sheets = spreadsheets.entry(spreadsheet_id.to_string()).or_default();
        if !sheets.iter().any(|s| s.title == sheet_name) {
            sheets.push(SheetInfo {
                sheet_id: None,
                title: sheet_name.to_string(),
            });
        }
        self.rows
            .write()
            .await
            .insert((spreadsheet_id.to_string(), sheet_name.to_string()), values);
    }

    /// Makes every fetch of one sheet fail with `error` until cleared.
    pub async fn fail_sheet(&self, spreadsheet_id: &str, sheet_name: &str, error: FetchError) {
        self.failures
            .write()
            .await
            .insert((spreadsheet_id.to_string(), sheet_name.to_string()), error);
    }

    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    /// Delays every fetch, for timeout and overlap scenarios.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

fn index_fixture(
    spreadsheets: &mut HashMap<String, Vec<SheetInfo>>,
    rows: &mut HashMap<SheetKey, Vec<Vec<String>>>,
    fixture: FixtureSpreadsheet,
) {
    let infos = fixture
        .sheets
        .iter()
        .map(|s| SheetInfo {
            sheet_id: s.sheet_id,
            title: s.sheet_name.clone(),
        })
        .collect();
    for sheet in fixture.sheets {
        rows.insert(
            (fixture.spreadsheet_id.clone(), sheet.sheet_name),
            sheet.values,
        );
    }
    spreadsheets.insert(fixture.spreadsheet_id, infos);
}

#[async_trait]
impl SheetFetcher for FixtureSheetFetcher {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch_rows(
        &self,
        spreadsheet_id: &str,
        sheet_name: &str,
        _credentials: &SheetCredentials,
    ) -> Result<Vec<Vec<String>>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let key = (spreadsheet_id.to_string(), sheet_name.to_string());
        if let Some(err) = self.failures.read().await.get(&key) {
            return Err(err.clone());
        }
        self.rows
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(format!("{spreadsheet_id}/{sheet_name}")))
    }

    async fn list_sheets(
        &self,
        spreadsheet_id: &str,
        _credentials: &SheetCredentials,
    ) -> Result<Vec<SheetInfo>, FetchError> {
        self.spreadsheets
            .read()
            .await
            .get(spreadsheet_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(spreadsheet_id.to_string()))
    }
}
