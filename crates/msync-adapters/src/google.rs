//! Google Sheets v4 values API fetcher.

use anyhow::{Context, Result};
use async_trait::async_trait;
use msync_storage::{HttpClient, HttpClientConfig, HttpError};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{FetchError, SheetCredentials, SheetFetcher, SheetInfo};

pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";

#[derive(Debug)]
pub struct GoogleSheetsFetcher {
    http: HttpClient,
    api_base: Url,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMetadata {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    #[serde(default)]
    sheet_id: Option<i64>,
    title: String,
}

impl GoogleSheetsFetcher {
    pub fn new(api_base: &str, http_config: HttpClientConfig) -> Result<Self> {
        let api_base =
            Url::parse(api_base).with_context(|| format!("parsing sheets api base {api_base:?}"))?;
        Ok(Self {
            http: HttpClient::new(http_config)?,
            api_base,
        })
    }

    fn spreadsheet_url(&self, spreadsheet_id: &str, tail: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.api_base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| FetchError::Network("sheets api base cannot hold a path".into()))?;
            segments.pop_if_empty().extend(["v4", "spreadsheets", spreadsheet_id]);
            segments.extend(tail);
        }
        Ok(url)
    }

    pub fn values_url(&self, spreadsheet_id: &str, sheet_name: &str) -> Result<Url, FetchError> {
        let range = a1_sheet_range(sheet_name);
        let mut url = self.spreadsheet_url(spreadsheet_id, &["values", range.as_str()])?;
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "FORMATTED_VALUE");
        Ok(url)
    }

    pub fn metadata_url(&self, spreadsheet_id: &str) -> Result<Url, FetchError> {
        let mut url = self.spreadsheet_url(spreadsheet_id, &[])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        spreadsheet_id: &str,
        url: Url,
        credentials: &SheetCredentials,
    ) -> Result<T, FetchError> {
        let response = self
            .http
            .get(spreadsheet_id, url.as_str(), Some(&credentials.access_token))
            .await
            .map_err(fetch_error_from_http)?;
        serde_json::from_slice(&response.body)
            .map_err(|e| FetchError::Network(format!("decoding sheets response: {e}")))
    }
}

/// Quoted A1 range selecting a whole sheet: `'Q1 ''24'`.
pub fn a1_sheet_range(sheet_name: &str) -> String {
    format!("'{}'", sheet_name.replace('\'', "''"))
}

pub fn fetch_error_from_http(err: HttpError) -> FetchError {
    match err {
        HttpError::Status { status, url, .. } => match status {
            401 | 403 => FetchError::Unauthorized(format!("status {status} for {url}")),
            404 => FetchError::NotFound(url),
            429 => FetchError::RateLimited(format!("status {status} for {url}")),
            _ => FetchError::Network(format!("status {status} for {url}")),
        },
        err if err.is_timeout() => FetchError::Timeout(err.to_string()),
        err => FetchError::Network(err.to_string()),
    }
}

/// Formatted cells come back as strings; anything else is rendered to text.
pub fn cell_to_string(cell: &JsonValue) -> String {
    match cell {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetFetcher for GoogleSheetsFetcher {
    fn source_id(&self) -> &'static str {
        "google_sheets"
    }

    async fn fetch_rows(
        &self,
        spreadsheet_id: &str,
        sheet_name: &str,
        credentials: &SheetCredentials,
    ) -> Result<Vec<Vec<String>>, FetchError> {
        let url = self.values_url(spreadsheet_id, sheet_name)?;
        let range: ValueRange = self.get_json(spreadsheet_id, url, credentials).await?;
        debug!(spreadsheet_id, sheet_name, rows = range.values.len(), "fetched sheet values");
        Ok(range
            .values
            .iter()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect())
    }

    async fn list_sheets(
        &self,
        spreadsheet_id: &str,
        credentials: &SheetCredentials,
    ) -> Result<Vec<SheetInfo>, FetchError> {
        let url = self.metadata_url(spreadsheet_id)?;
        let meta: SpreadsheetMetadata = self.get_json(spreadsheet_id, url, credentials).await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|s| SheetInfo {
                sheet_id: s.properties.sheet_id,
                title: s.properties.title,
            })
            .collect())
    }
}
