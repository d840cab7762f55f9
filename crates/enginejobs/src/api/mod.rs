use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::api::models::{
    DeadQuery, JobRunsResponse, ListJobsQuery, ListJobsResponse, MetricsQuery, ReplayRequest,
    ReplayResponse, RequeueStaleRequest, RequeueStaleResponse,
};
use crate::jobs::{EnqueueResult, Job, JobStatus, JobsRepo, Metrics, MetricsRepo, NewJob, RunsRepo};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobsRepo,
    pub runs: RunsRepo,
    pub metrics: MetricsRepo,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Producer
        .route("/jobs", get(list_jobs).post(enqueue_job))
        // Admin / inspect
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/runs", get(list_runs))
        .route("/jobs/:id/replay", post(replay_job))
        .route("/dead", get(list_dead))
        // Operator
        .route("/maintenance/requeue-stale", post(requeue_stale))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn internal_err(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "admin api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

fn not_found(job_id: i64) -> ApiError {
    (StatusCode::NOT_FOUND, format!("job {job_id} not found"))
}

fn parse_status(status: Option<&str>) -> Result<Option<JobStatus>, ApiError> {
    status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn enqueue_job(
    State(state): State<ApiState>,
    Json(body): Json<NewJob>,
) -> Result<Json<EnqueueResult>, ApiError> {
    body.validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let res = state.jobs.enqueue(body).await.map_err(internal_err)?;
    Ok(Json(res))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let status = parse_status(q.status.as_deref())?;

    let items = state
        .jobs
        .list_jobs(
            q.workspace_id.as_deref(),
            status,
            q.limit.unwrap_or(100),
            q.before_id,
        )
        .await
        .map_err(internal_err)?;

    let next_before_id = items.last().map(|j| j.id);

    Ok(Json(ListJobsResponse {
        items,
        next_before_id,
    }))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, ApiError> {
    state
        .jobs
        .get_job(id)
        .await
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

pub async fn list_runs(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<JobRunsResponse>, ApiError> {
    if state.jobs.get_job(id).await.map_err(internal_err)?.is_none() {
        return Err(not_found(id));
    }

    let runs = state.runs.list_for_job(id).await.map_err(internal_err)?;
    Ok(Json(JobRunsResponse { job_id: id, runs }))
}

pub async fn list_dead(
    State(state): State<ApiState>,
    Query(q): Query<DeadQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let items = state
        .jobs
        .list_dead(q.workspace_id.as_deref(), q.limit.unwrap_or(100))
        .await
        .map_err(internal_err)?;

    let next_before_id = items.last().map(|j| j.id);
    Ok(Json(ListJobsResponse {
        items,
        next_before_id,
    }))
}

fn replay_err(e: anyhow::Error) -> ApiError {
    let msg = e.to_string();
    if msg.starts_with("JOB_NOT_FOUND") {
        (StatusCode::NOT_FOUND, msg)
    } else if msg.starts_with("JOB_NOT_TERMINAL") {
        (StatusCode::CONFLICT, msg)
    } else {
        internal_err(e)
    }
}

pub async fn replay_job(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    body: Option<Json<ReplayRequest>>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let res = state
        .jobs
        .replay_job(id, body.run_after)
        .await
        .map_err(replay_err)?;

    Ok(Json(ReplayResponse {
        enqueued: res.enqueued,
        new_job_id: res.job_id,
        replay_of_job_id: id,
    }))
}

pub async fn requeue_stale(
    State(state): State<ApiState>,
    Json(body): Json<RequeueStaleRequest>,
) -> Result<Json<RequeueStaleResponse>, ApiError> {
    if body.stale_minutes < 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "stale_minutes must be >= 0".into(),
        ));
    }

    let requeued = state
        .jobs
        .requeue_stale(body.stale_minutes)
        .await
        .map_err(internal_err)?;

    Ok(Json(RequeueStaleResponse { requeued }))
}

pub async fn metrics(
    State(state): State<ApiState>,
    Query(q): Query<MetricsQuery>,
) -> Result<Json<Metrics>, ApiError> {
    let m = state
        .metrics
        .snapshot(q.workspace_id.as_deref())
        .await
        .map_err(internal_err)?;
    Ok(Json(m))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match state.metrics.render_prometheus().await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => internal_err(e).into_response(),
    }
}
