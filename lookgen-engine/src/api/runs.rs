//! Run lifecycle endpoints
//!
//! **[GEN-API-010]** Plan preview, run start/cancel/retry, fill-missing,
//! stall handling, and progress queries. Handlers are thin: validation and
//! orchestration live in [`crate::engine::controller`].

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{self, FillOutcome, PlanReport, ProgressReport, StartedRun};
use crate::error::ApiResult;
use crate::models::RunBatch;
use crate::{db, AppState};

pub fn run_routes() -> Router<AppState> {
    Router::new()
        .route("/runs/plan", post(plan_run))
        .route("/runs/start", post(start_run))
        .route("/runs/fill-missing", post(fill_missing))
        .route("/runs/resume", post(resume_runs))
        .route("/runs/active", get(active_runs))
        .route("/runs/:batch_id", get(get_run))
        .route("/runs/:batch_id/progress", get(get_run_progress))
        .route("/runs/:batch_id/cancel", post(cancel_run))
        .route("/runs/:batch_id/retry", post(retry_run))
        .route("/runs/:batch_id/fail-stalled", post(fail_stalled_run))
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub look_ids: Vec<Uuid>,
    pub required_options: u32,
    #[serde(default)]
    pub force_regenerate: bool,
}

#[derive(Debug, Deserialize)]
pub struct FillMissingRequest {
    /// Omit to examine every Look that has ever had a Job
    #[serde(default)]
    pub look_ids: Option<Vec<Uuid>>,
    pub required_options: u32,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub batch_id: Uuid,
    /// Failed Outputs recreated as fresh pending attempts
    pub recreated: u32,
}

#[derive(Debug, Serialize)]
pub struct FailStalledResponse {
    pub batch_id: Uuid,
    /// Stalled Outputs moved to FAILED
    pub failed: u32,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    /// Batches whose loops were reattached
    pub resumed: Vec<RunBatch>,
}

/// POST /runs/plan - preview what a run would create
async fn plan_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> ApiResult<Json<PlanReport>> {
    let report = engine::compute_plan(
        &state.context(),
        &req.look_ids,
        req.required_options,
        req.force_regenerate,
    )
    .await?;
    Ok(Json(report))
}

/// POST /runs/start - start a reconciliation run
async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> ApiResult<Json<StartedRun>> {
    let started = engine::start_run(
        &state.context(),
        req.look_ids,
        req.required_options,
        req.force_regenerate,
    )
    .await?;
    Ok(Json(started))
}

/// POST /runs/fill-missing - top up undershooting Looks
async fn fill_missing(
    State(state): State<AppState>,
    Json(req): Json<FillMissingRequest>,
) -> ApiResult<Json<FillOutcome>> {
    let outcome =
        engine::fill_missing(&state.context(), req.look_ids, req.required_options).await?;
    Ok(Json(outcome))
}

/// POST /runs/resume - reattach loops to non-terminal batches
///
/// Startup calls this automatically; the endpoint exists for operators.
async fn resume_runs(State(state): State<AppState>) -> ApiResult<Json<ResumeResponse>> {
    let resumed = engine::resume_active(&state.context()).await?;
    Ok(Json(ResumeResponse { resumed }))
}

/// GET /runs/active - batches in a non-terminal state
async fn active_runs(State(state): State<AppState>) -> ApiResult<Json<Vec<RunBatch>>> {
    let batches = db::batches::list_active(&state.db).await?;
    Ok(Json(batches))
}

/// GET /runs/:batch_id - one batch record
async fn get_run(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<RunBatch>> {
    let batch = db::batches::load_batch(&state.db, batch_id)
        .await?
        .ok_or_else(|| crate::ApiError::NotFound(format!("batch {} not found", batch_id)))?;
    Ok(Json(batch))
}

/// GET /runs/:batch_id/progress - fresh progress snapshot
async fn get_run_progress(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<ProgressReport>> {
    let report = engine::get_progress(&state.context(), batch_id).await?;
    Ok(Json(report))
}

/// POST /runs/:batch_id/cancel - stop a run, keep its terminal outputs
async fn cancel_run(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<RunBatch>> {
    let batch = engine::cancel_run(&state.context(), batch_id).await?;
    Ok(Json(batch))
}

/// POST /runs/:batch_id/retry - requeue every failed output
async fn retry_run(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<RetryResponse>> {
    let recreated = engine::retry_failed(&state.context(), batch_id).await?;
    Ok(Json(RetryResponse {
        batch_id,
        recreated,
    }))
}

/// POST /runs/:batch_id/fail-stalled - fail stalled outputs (operator action)
async fn fail_stalled_run(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<FailStalledResponse>> {
    let failed = engine::fail_stalled(&state.context(), batch_id).await?;
    Ok(Json(FailStalledResponse { batch_id, failed }))
}
