//! Axum JSON API over the sync service.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use msync_adapters::FetchError;
use msync_core::{DateRange, ProjectSyncConfig, ScopeType};
use msync_storage::StoreError;
use msync_sync::{EngineSettings, SchedulerError, SyncError, SyncService};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "msync-web";

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
}

impl AppState {
    pub fn new(service: SyncService) -> Self {
        Self { service }
    }
}

/// Error body is always `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Sync(SyncError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Sync(err) => match err {
                SyncError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
                SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
                SyncError::Scheduler(SchedulerError::AlreadyRunning { .. }) => StatusCode::CONFLICT,
                SyncError::Scheduler(SchedulerError::JobNotFound { .. }) => StatusCode::NOT_FOUND,
                SyncError::Scheduler(SchedulerError::InvalidInterval(_)) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                SyncError::Store(StoreError::ConfigNotFound { .. }) => StatusCode::NOT_FOUND,
                SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                SyncError::Fetch(FetchError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
                SyncError::Fetch(FetchError::NotFound(_)) => StatusCode::NOT_FOUND,
                SyncError::Fetch(FetchError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
                SyncError::Fetch(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::BadRequest(m) | Self::NotFound(m) => m.clone(),
            Self::Sync(err) => err.to_string(),
        };
        if status.is_server_error() {
            error!(%status, error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(list_jobs_handler))
        .route(
            "/jobs/{project_id}/{scope}",
            get(job_status_handler)
                .put(upsert_job_handler)
                .delete(remove_job_handler),
        )
        .route("/projects/{project_id}/sync/{scope}", post(trigger_sync_handler))
        .route(
            "/projects/{project_id}/config/{scope}",
            get(get_config_handler)
                .put(save_config_handler)
                .delete(delete_config_handler),
        )
        .route("/projects/{project_id}/history/{scope}", get(history_handler))
        .route(
            "/projects/{project_id}/spreadsheets/{spreadsheet_id}/sheets",
            get(discover_sheets_handler),
        )
        .route("/projects/{project_id}/metrics/daily", get(daily_metrics_handler))
        .route("/projects/{project_id}/metrics/records", get(individual_records_handler))
        .with_state(Arc::new(state))
}

/// Builds the engine from env, restores jobs, starts the scheduler (if enabled) and serves.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let settings = EngineSettings::from_env();
    let service = msync_sync::build_service(&settings).await?;
    service.restore_jobs().await?;
    if settings.scheduler_enabled {
        service.start();
    }
    serve(service, settings.web_port).await
}

pub async fn serve(service: SyncService, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(service.clone())))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "installing ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    scheduler_running: bool,
    jobs: usize,
    in_flight: usize,
    source: &'static str,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Health> {
    let scheduler = state.service.scheduler();
    Json(Health {
        status: "ok",
        scheduler_running: scheduler.is_started(),
        jobs: scheduler.list_jobs().len(),
        in_flight: scheduler.in_flight_count(),
        source: state.service.fetcher_source(),
    })
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.list_jobs())
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, scope)): Path<(Uuid, ScopeType)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .service
        .job_status(project_id, scope)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no {scope} sync job for project {project_id}")))
}

#[derive(Debug, Deserialize)]
struct UpsertJobBody {
    interval_minutes: u32,
}

async fn upsert_job_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, scope)): Path<(Uuid, ScopeType)>,
    Json(body): Json<UpsertJobBody>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .service
        .register_or_update_job(project_id, scope, body.interval_minutes)
        .await?;
    Ok(Json(status))
}

async fn remove_job_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, scope)): Path<(Uuid, ScopeType)>,
) -> Result<StatusCode, ApiError> {
    state.service.remove_job(project_id, scope).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, scope)): Path<(Uuid, ScopeType)>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.service.trigger_manual_sync(project_id, scope).await?;
    Ok(Json(result))
}

async fn get_config_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, scope)): Path<(Uuid, ScopeType)>,
) -> ApiResult<ProjectSyncConfig> {
    state
        .service
        .get_config(project_id, scope)
        .await?
        .map(Json)
        .ok_or(ApiError::Sync(SyncError::NotFound { project_id, scope }))
}

async fn save_config_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, scope)): Path<(Uuid, ScopeType)>,
    Json(config): Json<ProjectSyncConfig>,
) -> ApiResult<ProjectSyncConfig> {
    if config.project_id() != project_id || config.scope() != scope {
        return Err(ApiError::BadRequest(format!(
            "body describes the {} config of project {}, path names {scope} of {project_id}",
            config.scope(),
            config.project_id()
        )));
    }
    Ok(Json(state.service.save_config(config).await?))
}

async fn delete_config_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, scope)): Path<(Uuid, ScopeType)>,
) -> Result<StatusCode, ApiError> {
    if state.service.delete_config(project_id, scope).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::Sync(SyncError::NotFound { project_id, scope }))
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, scope)): Path<(Uuid, ScopeType)>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.service.history(project_id, scope, limit).await?))
}

async fn discover_sheets_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, spreadsheet_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .service
            .discover_sheets(project_id, &spreadsheet_id)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
struct RangeQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

impl RangeQuery {
    fn range(&self) -> Result<Option<DateRange>, ApiError> {
        if self.from.is_none() && self.to.is_none() {
            return Ok(None);
        }
        let start = self.from.unwrap_or(NaiveDate::MIN);
        let end = self.to.unwrap_or(NaiveDate::MAX);
        if start > end {
            return Err(ApiError::BadRequest(format!("from {start} is after to {end}")));
        }
        Ok(Some(DateRange { start, end }))
    }
}

async fn daily_metrics_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<RangeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let range = query.range()?;
    Ok(Json(state.service.list_daily_metrics(project_id, range).await?))
}

async fn individual_records_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<RangeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let range = query.range()?;
    Ok(Json(
        state
            .service
            .list_individual_records(project_id, range)
            .await?,
    ))
}
