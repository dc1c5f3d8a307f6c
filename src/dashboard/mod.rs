//! HTTP adapter over a [`JobStore`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{ErrorKind, StoreError};
use crate::models::{Job, JobHistory, JobSpec, JobState, JobWithInfo};
use crate::store::{JobHistoryFilter, JobQuery, JobSortField, JobStore};

#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn JobStore>,
}

#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: String,
}

/// HTTP status for a store error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists
        | ErrorKind::InvalidState
        | ErrorKind::InvalidVersion
        | ErrorKind::AlreadyTerminal => StatusCode::CONFLICT,
        ErrorKind::Ambiguous => StatusCode::BAD_REQUEST,
        ErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Store(err) => {
                let kind = err.kind();
                if kind == ErrorKind::StorageFailure {
                    tracing::error!(error = %err, "Job store failure");
                }
                (
                    status_for(kind),
                    ErrorBody {
                        error: err.to_string(),
                        kind: kind.to_string(),
                    },
                )
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: message,
                    kind: "bad_request".to_string(),
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    /// Generated when absent.
    #[serde(default)]
    id: Option<String>,
    client_id: String,
    spec: JobSpec,
}

#[derive(Deserialize, Default)]
struct ListJobsParams {
    client_id: Option<String>,
    /// Comma-separated.
    include_tags: Option<String>,
    /// Comma-separated.
    exclude_tags: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    all: Option<bool>,
    sort_by: Option<String>,
    reverse: Option<bool>,
}

#[derive(Serialize)]
struct ListJobsResponse {
    jobs: Vec<Job>,
    total_count: usize,
}

#[derive(Deserialize, Default)]
struct HistoryParams {
    since: Option<DateTime<Utc>>,
    exclude_job_level: Option<bool>,
    exclude_execution_level: Option<bool>,
}

fn split_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| {
        t.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

impl ListJobsParams {
    fn into_query(self) -> Result<JobQuery, ApiError> {
        let sort_by = self
            .sort_by
            .map(|s| s.parse::<JobSortField>())
            .transpose()
            .map_err(ApiError::BadRequest)?;
        Ok(JobQuery {
            id: None,
            client_id: self.client_id,
            include_tags: split_tags(self.include_tags),
            exclude_tags: split_tags(self.exclude_tags),
            limit: self.limit.unwrap_or(0),
            offset: self.offset.unwrap_or(0),
            return_all: self.all.unwrap_or(false),
            sort_by,
            sort_reverse: self.reverse.unwrap_or(false),
        })
    }
}

/// Builds the API router. Exposed separately from [`run_dashboard`] so it can
/// be driven without a socket.
pub fn router(store: Arc<dyn JobStore>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}", get(get_job_handler))
        .route("/api/jobs/{id}/state", get(job_state_handler))
        .route("/api/jobs/{id}/history", get(job_history_handler))
        .route("/api/in-progress", get(in_progress_handler))
        .layer(cors)
        .with_state(DashboardState { store })
}

/// Serves the API until `shutdown` is cancelled.
pub async fn run_dashboard(
    addr: SocketAddr,
    store: Arc<dyn JobStore>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(store);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting job store API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Job store API server stopped");
    Ok(())
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = match payload.id {
        Some(id) => Job::with_id(id, payload.client_id, payload.spec),
        None => Job::new(payload.client_id, payload.spec),
    };
    let job = state.store.create_job(job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let query = params.into_query()?;
    let jobs = state.store.get_jobs(&query).await?;
    let total_count = state.store.get_jobs_count(&query).await?;
    Ok(Json(ListJobsResponse { jobs, total_count }))
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.store.get_job(&id).await?))
}

async fn job_state_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<JobState>, ApiError> {
    Ok(Json(state.store.get_job_state(&id).await?))
}

async fn job_history_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<JobHistory>>, ApiError> {
    let filter = JobHistoryFilter {
        since: params.since,
        exclude_job_level: params.exclude_job_level.unwrap_or(false),
        exclude_execution_level: params.exclude_execution_level.unwrap_or(false),
    };
    Ok(Json(state.store.get_job_history(&id, &filter).await?))
}

async fn in_progress_handler(
    State(state): State<DashboardState>,
) -> Result<Json<Vec<JobWithInfo>>, ApiError> {
    Ok(Json(state.store.get_in_progress_jobs().await?))
}
