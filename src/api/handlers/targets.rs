//! Target API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use utoipa::OpenApi;
use uuid::Uuid;

use crate::api::dto::{CreateTargetRequest, MessageResponse, UpdateTargetRequest};
use crate::api::SharedState;
use crate::error::Result;
use crate::models::Target;

#[derive(OpenApi)]
#[openapi(
    paths(create_target, list_targets, get_target, update_target, delete_target),
    components(schemas(Target, CreateTargetRequest, UpdateTargetRequest, MessageResponse))
)]
pub struct TargetsApiDoc;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_targets).post(create_target))
        .route(
            "/:id",
            get(get_target).patch(update_target).delete(delete_target),
        )
}

/// POST /api/v1/targets
#[utoipa::path(
    post,
    path = "",
    context_path = "/api/v1/targets",
    tag = "targets",
    operation_id = "create_target",
    request_body = CreateTargetRequest,
    responses(
        (status = 201, description = "Target created", body = Target),
        (status = 400, description = "Validation failed"),
    ),
)]
pub async fn create_target(
    State(state): State<SharedState>,
    Json(payload): Json<CreateTargetRequest>,
) -> Result<(StatusCode, Json<Target>)> {
    let new = payload.validate(&state.config)?;
    let target = state.store.create_target(new, state.clock.now()).await?;
    Ok((StatusCode::CREATED, Json(target)))
}

/// GET /api/v1/targets
#[utoipa::path(
    get,
    path = "",
    context_path = "/api/v1/targets",
    tag = "targets",
    operation_id = "list_targets",
    responses(
        (status = 200, description = "List targets", body = Vec<Target>),
    ),
)]
pub async fn list_targets(State(state): State<SharedState>) -> Result<Json<Vec<Target>>> {
    let targets = state.store.list_targets().await?;
    Ok(Json(targets))
}

/// GET /api/v1/targets/:id
#[utoipa::path(
    get,
    path = "/{id}",
    context_path = "/api/v1/targets",
    tag = "targets",
    operation_id = "get_target",
    params(("id" = Uuid, Path, description = "Target ID")),
    responses(
        (status = 200, description = "Target details", body = Target),
        (status = 404, description = "Target not found"),
    ),
)]
pub async fn get_target(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Target>> {
    let target = state.store.get_target(id).await?;
    Ok(Json(target))
}

/// PATCH /api/v1/targets/:id
#[utoipa::path(
    patch,
    path = "/{id}",
    context_path = "/api/v1/targets",
    tag = "targets",
    operation_id = "update_target",
    params(("id" = Uuid, Path, description = "Target ID")),
    request_body = UpdateTargetRequest,
    responses(
        (status = 200, description = "Target updated", body = Target),
        (status = 404, description = "Target not found"),
    ),
)]
pub async fn update_target(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateTargetRequest>,
) -> Result<Json<Target>> {
    let patch = payload.validate(&state.config)?;
    let target = state
        .store
        .update_target(id, patch, state.clock.now())
        .await?;
    Ok(Json(target))
}

/// DELETE /api/v1/targets/:id
///
/// Cascades to the target's schedules and their runs. Timers are disarmed
/// before the delete commits, so no firing can land on a deleted target.
#[utoipa::path(
    delete,
    path = "/{id}",
    context_path = "/api/v1/targets",
    tag = "targets",
    operation_id = "delete_target",
    params(("id" = Uuid, Path, description = "Target ID")),
    responses(
        (status = 200, description = "Target deleted", body = MessageResponse),
        (status = 404, description = "Target not found"),
    ),
)]
pub async fn delete_target(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>> {
    // 404 before touching the scheduler.
    state.store.get_target(id).await?;

    state.scheduler.target_deleted(id).await;
    state.store.delete_target(id).await?;

    Ok(Json(MessageResponse {
        message: format!("Target {id} deleted"),
    }))
}
