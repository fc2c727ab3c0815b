//! Spreadsheet source contracts, fetcher implementations, credentials and the column mapper.

use async_trait::async_trait;
use msync_core::{FetchErrorKind, SheetError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod credentials;
pub mod fixtures;
pub mod google;
pub mod mapper;

pub use credentials::{CredentialProvider, SheetCredentials, StaticCredentialProvider};
pub use fixtures::{FixtureSheet, FixtureSheetFetcher, FixtureSpreadsheet};
pub use google::GoogleSheetsFetcher;
pub use mapper::{
    map_row, map_rows, map_sheet, FieldError, MappedRow, MappedSheet, MappedValue, RowMapping,
};

pub const CRATE_NAME: &str = "msync-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Unauthorized(_) => FetchErrorKind::Unauthorized,
            Self::NotFound(_) => FetchErrorKind::NotFound,
            Self::RateLimited(_) => FetchErrorKind::RateLimited,
            Self::Network(_) => FetchErrorKind::Network,
            Self::Timeout(_) => FetchErrorKind::Timeout,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unauthorized(m)
            | Self::NotFound(m)
            | Self::RateLimited(m)
            | Self::Network(m)
            | Self::Timeout(m) => m,
        }
    }
}

impl From<FetchError> for SheetError {
    fn from(err: FetchError) -> Self {
        SheetError::Fetch {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

/// A tab inside a spreadsheet, as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetInfo {
    pub sheet_id: Option<i64>,
    pub title: String,
}

#[async_trait]
pub trait SheetFetcher: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Rows in sheet order; the first row is the header row.
    async fn fetch_rows(
        &self,
        spreadsheet_id: &str,
        sheet_name: &str,
        credentials: &SheetCredentials,
    ) -> Result<Vec<Vec<String>>, FetchError>;

    async fn list_sheets(
        &self,
        spreadsheet_id: &str,
        credentials: &SheetCredentials,
    ) -> Result<Vec<SheetInfo>, FetchError>;
}
