//! Job endpoints under `/api/v1/jobs`.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use docconv_core::{JobPayload, JobType, PageMode, StateFilter};
use docconv_jobs::{CancelOutcome, EnqueueOptions, JobStatusView};

use crate::{ApiError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(enqueue_job).get(list_jobs))
        .route("/stats", get(queue_stats))
        .route("/types", get(job_types))
        .route("/:id", get(get_job).delete(cancel_job))
        .route("/:id/download", get(download_job))
}

// =============================================================================
// REQUEST / RESPONSE TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    /// Path of the uploaded input file.
    pub input: String,
    #[serde(default)]
    pub options: JsonMap<String, JsonValue>,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    pub status_url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// `per-state` or `global`.
    pub pagination: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobStatusView>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub pagination: PageMode,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
    pub outcome: &'static str,
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn enqueue_job(
    State(state): State<AppState>,
    Json(body): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_type: JobType = body.job_type.parse()?;
    let mut payload = JobPayload::new(body.input);
    payload.options = body.options;

    let job_id = state
        .jobs
        .enqueue(
            job_type,
            payload,
            EnqueueOptions {
                max_attempts: body.max_attempts,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(EnqueueResponse {
            job_id,
            status_url: format!("/api/v1/jobs/{}", job_id),
        }),
    ))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter: StateFilter = query.state.as_deref().unwrap_or("all").parse()?;
    let mode = match query.pagination.as_deref() {
        Some(mode) => mode.parse()?,
        None => state.default_page_mode,
    };

    let page = state
        .jobs
        .list(filter, query.limit, query.offset, mode)
        .await?;

    Ok(Json(JobListResponse {
        jobs: page.jobs.iter().map(JobStatusView::from).collect(),
        total: page.total,
        limit: page.limit,
        offset: page.offset,
        pagination: mode,
    }))
}

async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.jobs.stats().await?))
}

async fn job_types(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "types": state.jobs.dispatcher().job_types() }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobStatusView>, ApiError> {
    Ok(Json(state.jobs.status(id).await?))
}

async fn download_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let download = state.jobs.download(id).await?;
    debug!(
        subsystem = "api",
        job_id = %id,
        output_bytes = download.bytes.len(),
        "Serving conversion result"
    );
    let disposition = format!("attachment; filename=\"{}\"", download.file_name);
    Ok((
        [
            (header::CONTENT_TYPE, download.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.bytes,
    ))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.jobs.cancel(id).await?;
    let (status, name) = match outcome {
        CancelOutcome::Removed => (StatusCode::OK, "removed"),
        CancelOutcome::Cancelled => (StatusCode::OK, "cancelled"),
        CancelOutcome::Pending => (StatusCode::ACCEPTED, "pending"),
    };
    Ok((
        status,
        Json(CancelResponse {
            success: true,
            message: outcome.message().to_string(),
            outcome: name,
        }),
    ))
}
