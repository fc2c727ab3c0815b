//! Per-project access tokens for the spreadsheet source. Acquisition and refresh live elsewhere.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msync_core::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::FetchError;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetCredentials {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SheetCredentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for SheetCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetCredentials")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Missing or expired credentials surface as `FetchError::Unauthorized`.
    async fn credentials(&self, project_id: Uuid) -> Result<SheetCredentials, FetchError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsFile {
    #[serde(default)]
    pub default: Option<SheetCredentials>,
    #[serde(default)]
    pub projects: HashMap<Uuid, SheetCredentials>,
}

/// Fixed credentials loaded once from YAML (or built in code).
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    file: CredentialsFile,
    clock: Arc<dyn Clock>,
}

impl Default for StaticCredentialProvider {
    fn default() -> Self {
        Self::from_file(CredentialsFile::default())
    }
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(file: CredentialsFile) -> Self {
        Self {
            file,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used for the expiry check.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default(mut self, credentials: SheetCredentials) -> Self {
        self.file.default = Some(credentials);
        self
    }

    pub fn with_project(mut self, project_id: Uuid, credentials: SheetCredentials) -> Self {
        self.file.projects.insert(project_id, credentials);
        self
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: CredentialsFile =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_file(file))
    }

    pub fn project_count(&self) -> usize {
        self.file.projects.len()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(&self, project_id: Uuid) -> Result<SheetCredentials, FetchError> {
        let creds = self
            .file
            .projects
            .get(&project_id)
            .or(self.file.default.as_ref())
            .ok_or_else(|| {
                FetchError::Unauthorized(format!("no credentials for project {project_id}"))
            })?;
        if creds.is_expired(self.clock.now()) {
            return Err(FetchError::Unauthorized(format!(
                "credentials for project {project_id} expired"
            )));
        }
        Ok(creds.clone())
    }
}
