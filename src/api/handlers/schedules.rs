//! Schedule API handlers.
//!
//! Every mutation notifies the scheduler loop so its armed timers track the
//! durable state.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::{IntoParams, OpenApi};
use uuid::Uuid;

use crate::api::dto::{CreateScheduleRequest, MessageResponse, UpdateScheduleRequest};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::{Schedule, ScheduleStatus};

#[derive(OpenApi)]
#[openapi(
    paths(
        create_schedule,
        list_schedules,
        get_schedule,
        update_schedule,
        pause_schedule,
        resume_schedule,
        delete_schedule,
    ),
    components(schemas(Schedule, CreateScheduleRequest, UpdateScheduleRequest, MessageResponse))
)]
pub struct SchedulesApiDoc;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_schedules).post(create_schedule))
        .route(
            "/:id",
            get(get_schedule)
                .patch(update_schedule)
                .delete(delete_schedule),
        )
        .route("/:id/pause", post(pause_schedule))
        .route("/:id/resume", post(resume_schedule))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListSchedulesQuery {
    /// Filter by schedule status
    pub status: Option<ScheduleStatus>,
}

/// POST /api/v1/schedules
#[utoipa::path(
    post,
    path = "",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "create_schedule",
    request_body = CreateScheduleRequest,
    responses(
        (status = 201, description = "Schedule created", body = Schedule),
        (status = 400, description = "Validation failed"),
        (status = 404, description = "Target not found"),
    ),
)]
pub async fn create_schedule(
    State(state): State<SharedState>,
    Json(payload): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<Schedule>)> {
    let new = payload.validate(state.clock.now())?;

    // Reject before writing anything when the target is unknown.
    state.store.get_target(new.target_id).await?;

    let schedule = state.store.create_schedule(new, state.clock.now()).await?;
    state.scheduler.schedule_created(schedule.id).await;

    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /api/v1/schedules
#[utoipa::path(
    get,
    path = "",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "list_schedules",
    params(ListSchedulesQuery),
    responses(
        (status = 200, description = "List schedules", body = Vec<Schedule>),
    ),
)]
pub async fn list_schedules(
    State(state): State<SharedState>,
    Query(query): Query<ListSchedulesQuery>,
) -> Result<Json<Vec<Schedule>>> {
    let schedules = state.store.list_schedules(query.status).await?;
    Ok(Json(schedules))
}

/// GET /api/v1/schedules/:id
#[utoipa::path(
    get,
    path = "/{id}",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "get_schedule",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule details", body = Schedule),
        (status = 404, description = "Schedule not found"),
    ),
)]
pub async fn get_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Schedule>> {
    let schedule = state.store.get_schedule(id).await?;
    Ok(Json(schedule))
}

/// PATCH /api/v1/schedules/:id
///
/// An in-flight run completes under the old settings; the next arming uses
/// the new ones.
#[utoipa::path(
    patch,
    path = "/{id}",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "update_schedule",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    request_body = UpdateScheduleRequest,
    responses(
        (status = 200, description = "Schedule updated", body = Schedule),
        (status = 400, description = "Validation failed"),
        (status = 404, description = "Schedule not found"),
    ),
)]
pub async fn update_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateScheduleRequest>,
) -> Result<Json<Schedule>> {
    let schedule = state.store.get_schedule(id).await?;
    if schedule.status == ScheduleStatus::Completed {
        return Err(AppError::Validation(
            "completed schedules cannot be updated".into(),
        ));
    }

    let patch = payload.validate(schedule.schedule_type)?;
    let schedule = state
        .store
        .update_schedule(id, patch, state.clock.now())
        .await?;

    if schedule.status == ScheduleStatus::Active {
        state.scheduler.schedule_updated(id).await;
    }

    Ok(Json(schedule))
}

/// POST /api/v1/schedules/:id/pause
///
/// Disarms future firings. An in-flight run proceeds to its terminal state.
#[utoipa::path(
    post,
    path = "/{id}/pause",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "pause_schedule",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule paused", body = Schedule),
        (status = 400, description = "Schedule is not active"),
        (status = 404, description = "Schedule not found"),
    ),
)]
pub async fn pause_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Schedule>> {
    let schedule = state.store.get_schedule(id).await?;
    if schedule.status != ScheduleStatus::Active {
        return Err(AppError::Validation(format!(
            "cannot pause schedule with status {}",
            schedule.status.as_str()
        )));
    }

    let now = state.clock.now();
    state
        .store
        .set_schedule_status(id, ScheduleStatus::Paused, now)
        .await?;
    state.store.set_next_run_at(id, None, now).await?;
    state.scheduler.schedule_paused(id).await;

    let schedule = state.store.get_schedule(id).await?;
    Ok(Json(schedule))
}

/// POST /api/v1/schedules/:id/resume
#[utoipa::path(
    post,
    path = "/{id}/resume",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "resume_schedule",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule resumed", body = Schedule),
        (status = 400, description = "Schedule is not paused"),
        (status = 404, description = "Schedule not found"),
    ),
)]
pub async fn resume_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Schedule>> {
    let schedule = state.store.get_schedule(id).await?;
    if schedule.status != ScheduleStatus::Paused {
        return Err(AppError::Validation(format!(
            "cannot resume schedule with status {}",
            schedule.status.as_str()
        )));
    }

    state
        .store
        .set_schedule_status(id, ScheduleStatus::Active, state.clock.now())
        .await?;
    // The loop rearms from persisted state, completing the schedule instead
    // when its window closed while paused.
    state.scheduler.schedule_resumed(id).await;

    let schedule = state.store.get_schedule(id).await?;
    Ok(Json(schedule))
}

/// DELETE /api/v1/schedules/:id
///
/// Deletes the schedule and its runs. An already-dispatched run continues
/// to completion but its rows are removed with the cascade.
#[utoipa::path(
    delete,
    path = "/{id}",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "delete_schedule",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule deleted", body = MessageResponse),
        (status = 404, description = "Schedule not found"),
    ),
)]
pub async fn delete_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>> {
    state.store.get_schedule(id).await?;

    state.scheduler.schedule_deleted(id).await;
    state.store.delete_schedule(id).await?;

    Ok(Json(MessageResponse {
        message: format!("Schedule {id} deleted"),
    }))
}
