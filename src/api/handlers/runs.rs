//! Run and attempt API handlers. Read-only: runs are created by the
//! scheduler and attempts by the executor, never through the API.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use utoipa::OpenApi;
use uuid::Uuid;

use crate::api::dto::{CountResponse, RunDetailResponse, RunsQuery};
use crate::api::SharedState;
use crate::error::Result;
use crate::models::{Attempt, Run};

#[derive(OpenApi)]
#[openapi(
    paths(list_runs, count_runs, get_run, list_run_attempts),
    components(schemas(Run, Attempt, RunDetailResponse, CountResponse))
)]
pub struct RunsApiDoc;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_runs))
        .route("/count", get(count_runs))
        .route("/:id", get(get_run))
        .route("/:id/attempts", get(list_run_attempts))
}

/// GET /api/v1/runs
#[utoipa::path(
    get,
    path = "",
    context_path = "/api/v1/runs",
    tag = "runs",
    operation_id = "list_runs",
    params(RunsQuery),
    responses(
        (status = 200, description = "List runs", body = Vec<Run>),
    ),
)]
pub async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<Run>>> {
    let runs = state.store.list_runs(&query.into_filter()).await?;
    Ok(Json(runs))
}

/// GET /api/v1/runs/count
#[utoipa::path(
    get,
    path = "/count",
    context_path = "/api/v1/runs",
    tag = "runs",
    operation_id = "count_runs",
    params(RunsQuery),
    responses(
        (status = 200, description = "Count of matching runs", body = CountResponse),
    ),
)]
pub async fn count_runs(
    State(state): State<SharedState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<CountResponse>> {
    let count = state.store.count_runs(&query.into_filter()).await?;
    Ok(Json(CountResponse { count }))
}

/// GET /api/v1/runs/:id
#[utoipa::path(
    get,
    path = "/{id}",
    context_path = "/api/v1/runs",
    tag = "runs",
    operation_id = "get_run",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run with its attempt trail", body = RunDetailResponse),
        (status = 404, description = "Run not found"),
    ),
)]
pub async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunDetailResponse>> {
    let run = state.store.get_run(id).await?;
    let attempts = state.store.list_attempts(id).await?;
    Ok(Json(RunDetailResponse { run, attempts }))
}

/// GET /api/v1/runs/:id/attempts
#[utoipa::path(
    get,
    path = "/{id}/attempts",
    context_path = "/api/v1/runs",
    tag = "runs",
    operation_id = "list_run_attempts",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Attempts ordered by attempt number", body = Vec<Attempt>),
        (status = 404, description = "Run not found"),
    ),
)]
pub async fn list_run_attempts(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Attempt>>> {
    // 404 for unknown runs rather than an empty list.
    state.store.get_run(id).await?;
    let attempts = state.store.list_attempts(id).await?;
    Ok(Json(attempts))
}
