use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{AppError, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct RunResponse {
    pub experiment: String,
    pub run: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActiveRunResponse {
    pub experiment: String,
    /// None when the experiment is idle
    pub run: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RebuildResponse {
    pub experiment: String,
    pub pipelines: usize,
}

#[utoipa::path(
    post,
    path = "/api/experiments/{experiment}/runs/{run}/start",
    params(
        ("experiment" = String, Path, description = "Experiment name"),
        ("run" = usize, Path, description = "Run index")
    ),
    responses(
        (status = 202, description = "Run started", body = RunResponse),
        (status = 404, description = "Unknown experiment or run", body = ErrorResponse),
        (status = 409, description = "Another run is active", body = ErrorResponse)
    ),
    tag = "runs"
)]
pub async fn start_run(
    State(state): State<AppState>,
    Path((experiment, run)): Path<(String, usize)>,
) -> Result<(StatusCode, Json<RunResponse>), AppError> {
    state.scorch.start_run(&experiment, run).await?;
    Ok((StatusCode::ACCEPTED, Json(RunResponse { experiment, run })))
}

#[utoipa::path(
    post,
    path = "/api/experiments/{experiment}/cancel",
    params(("experiment" = String, Path, description = "Experiment name")),
    responses(
        (status = 200, description = "Active run cancelled", body = RunResponse),
        (status = 404, description = "No active run", body = ErrorResponse)
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(experiment): Path<String>,
) -> Result<Json<RunResponse>, AppError> {
    let run = state.scorch.cancel_run(&experiment).await?;
    Ok(Json(RunResponse { experiment, run }))
}

#[utoipa::path(
    get,
    path = "/api/experiments/{experiment}/run",
    params(("experiment" = String, Path, description = "Experiment name")),
    responses((status = 200, description = "Active run, if any", body = ActiveRunResponse)),
    tag = "runs"
)]
pub async fn get_active_run(
    State(state): State<AppState>,
    Path(experiment): Path<String>,
) -> Json<ActiveRunResponse> {
    let run = state.scorch.active_run(&experiment).await;
    Json(ActiveRunResponse { experiment, run })
}

#[utoipa::path(
    get,
    path = "/api/experiments/{experiment}/runs/{run}/loops/{loop}/pipeline",
    params(
        ("experiment" = String, Path, description = "Experiment name"),
        ("run" = usize, Path, description = "Run index"),
        ("loop" = usize, Path, description = "Loop depth, 0 for the top level")
    ),
    responses(
        (status = 200, description = "Pipeline graph", content_type = "application/json"),
        (status = 404, description = "Unknown experiment, run or loop", body = ErrorResponse)
    ),
    tag = "pipelines"
)]
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path((experiment, run, loop_index)): Path<(String, usize, usize)>,
) -> Result<Response, AppError> {
    let pipeline = state.scorch.pipeline(&experiment, run, loop_index).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], pipeline).into_response())
}

#[utoipa::path(
    post,
    path = "/api/experiments/{experiment}/pipelines/rebuild",
    params(("experiment" = String, Path, description = "Experiment name")),
    responses((status = 200, description = "Cached pipelines dropped and rebuilt", body = RebuildResponse)),
    tag = "pipelines"
)]
pub async fn rebuild_pipelines(
    State(state): State<AppState>,
    Path(experiment): Path<String>,
) -> Result<Json<RebuildResponse>, AppError> {
    let pipelines = state.scorch.experiment_updated(&experiment).await?;
    Ok(Json(RebuildResponse {
        experiment,
        pipelines,
    }))
}

#[utoipa::path(
    delete,
    path = "/api/experiments/{experiment}/scorch",
    params(("experiment" = String, Path, description = "Experiment name")),
    responses((status = 204, description = "Active run cancelled and engine state dropped")),
    tag = "runs"
)]
pub async fn reset_experiment(
    State(state): State<AppState>,
    Path(experiment): Path<String>,
) -> Result<StatusCode, AppError> {
    state.scorch.experiment_stopped(&experiment).await?;
    Ok(StatusCode::NO_CONTENT)
}
