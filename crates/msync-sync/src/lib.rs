//! Sync engine: reconciler, per-sheet executor, orchestrator, job scheduler and service facade.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use msync_adapters::{
    CredentialProvider, FixtureSheetFetcher, GoogleSheetsFetcher, SheetFetcher,
    StaticCredentialProvider,
};
use msync_storage::{
    ConfigStore, HttpClientConfig, MemoryStore, MetricsStore, PgStore, TokenBucketConfig,
};
use tracing::{info, warn};

pub mod executor;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod service;

pub use msync_core::clock::{self, Clock, SystemClock};
#[cfg(any(test, feature = "test-util"))]
pub use msync_core::clock::ManualClock;
pub use executor::{ExecutorSettings, SheetExecution, SheetSyncExecutor};
pub use orchestrator::{run_error, JobRunner, SyncOrchestrator};
pub use reconcile::{reconcile, Reconciliation};
pub use scheduler::{
    JobKey, JobRunSummary, JobStatus, SchedulerError, SyncScheduler, TickOutcome, DEFAULT_TICK,
};
pub use service::{EngineParts, SyncError, SyncService};

pub const CRATE_NAME: &str = "msync-sync";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Postgres when set; the in-memory store otherwise.
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub tick_secs: u64,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    pub sheets_api_base: String,
    pub sheets_requests_per_minute: u32,
    pub write_batch_size: usize,
    pub credentials_path: PathBuf,
    /// Serve sheets from JSON fixtures instead of the Sheets API.
    pub fixtures_dir: Option<PathBuf>,
    pub web_port: u16,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            scheduler_enabled: lookup("MSYNC_SCHEDULER_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            tick_secs: parse_or(lookup("MSYNC_TICK_SECS"), 60),
            fetch_timeout_secs: parse_or(lookup("MSYNC_FETCH_TIMEOUT_SECS"), 30),
            user_agent: lookup("MSYNC_USER_AGENT").unwrap_or_else(|| "msync/0.1".to_string()),
            sheets_api_base: lookup("MSYNC_SHEETS_API_BASE")
                .unwrap_or_else(|| msync_adapters::google::DEFAULT_API_BASE.to_string()),
            sheets_requests_per_minute: parse_or(lookup("MSYNC_SHEETS_REQUESTS_PER_MINUTE"), 60),
            write_batch_size: parse_or(lookup("MSYNC_WRITE_BATCH_SIZE"), 500),
            credentials_path: lookup("MSYNC_CREDENTIALS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("credentials.yaml")),
            fixtures_dir: lookup("MSYNC_FIXTURES_DIR").map(PathBuf::from),
            web_port: parse_or(lookup("MSYNC_WEB_PORT"), 8000),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            write_batch_size: self.write_batch_size.max(1),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: TokenBucketConfig::per_minute(self.sheets_requests_per_minute),
            ..HttpClientConfig::default()
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Wires stores, fetcher and credentials from settings. Does not start the scheduler.
pub async fn build_service(settings: &EngineSettings) -> Result<SyncService> {
    let (configs, metrics): (Arc<dyn ConfigStore>, Arc<dyn MetricsStore>) =
        match &settings.database_url {
            Some(url) => {
                let store = PgStore::connect(url)
                    .await
                    .context("connecting to postgres")?;
                store.migrate().await.context("running migrations")?;
                let store = Arc::new(store);
                (store.clone() as Arc<dyn ConfigStore>, store as Arc<dyn MetricsStore>)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory store");
                let store = Arc::new(MemoryStore::new());
                (store.clone() as Arc<dyn ConfigStore>, store as Arc<dyn MetricsStore>)
            }
        };

    let fetcher: Arc<dyn SheetFetcher> = match &settings.fixtures_dir {
        Some(dir) => Arc::new(FixtureSheetFetcher::from_dir(dir)?),
        None => Arc::new(
            GoogleSheetsFetcher::new(&settings.sheets_api_base, settings.http_client_config())
                .context("building sheets client")?,
        ),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let credentials: Arc<dyn CredentialProvider> = if settings.credentials_path.exists() {
        let provider = StaticCredentialProvider::from_yaml_file(&settings.credentials_path)?
            .with_clock(clock.clone());
        info!(
            path = %settings.credentials_path.display(),
            projects = provider.project_count(),
            "loaded sheet credentials"
        );
        Arc::new(provider)
    } else {
        warn!(
            path = %settings.credentials_path.display(),
            "credentials file missing; fetches will be unauthorized"
        );
        Arc::new(StaticCredentialProvider::new().with_clock(clock.clone()))
    };

    info!(source = fetcher.source_id(), "sync engine wired");
    Ok(SyncService::new(
        EngineParts {
            configs,
            metrics,
            fetcher,
            credentials,
            clock,
        },
        settings.executor_settings(),
        settings.tick(),
    ))
}
