//! Metrics and health endpoints.

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use utoipa::OpenApi;

use crate::api::dto::{GlobalMetrics, ScheduleMetrics};
use crate::api::SharedState;
use crate::error::Result;

#[derive(OpenApi)]
#[openapi(
    paths(get_metrics, get_prometheus_metrics, health),
    components(schemas(GlobalMetrics, ScheduleMetrics))
)]
pub struct MetricsApiDoc;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/metrics/prometheus", get(get_prometheus_metrics))
        .route("/health", get(health))
}

fn percentage(part: i64, total: i64) -> f64 {
    if total > 0 {
        (part as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
    } else {
        0.0
    }
}

/// GET /api/v1/metrics
#[utoipa::path(
    get,
    path = "/metrics",
    context_path = "/api/v1",
    tag = "metrics",
    operation_id = "get_metrics",
    responses(
        (status = 200, description = "Global system metrics", body = GlobalMetrics),
    ),
)]
pub async fn get_metrics(State(state): State<SharedState>) -> Result<Json<GlobalMetrics>> {
    let now = state.clock.now();
    let metrics = state.store.metrics(now).await?;
    let stats = state.store.schedule_run_stats().await?;

    let by_status = |status: crate::models::ScheduleStatus| {
        metrics
            .schedules_by_status
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    };
    let total_schedules: i64 = metrics.schedules_by_status.iter().map(|(_, c)| c).sum();
    let total_runs: i64 = metrics.runs_by_status.iter().map(|(_, c)| c).sum();

    let schedules = stats
        .into_iter()
        .map(|s| ScheduleMetrics {
            success_rate: percentage(s.succeeded_runs, s.total_runs),
            schedule_id: s.schedule_id,
            schedule_name: s.schedule_name,
            total_runs: s.total_runs,
            succeeded_runs: s.succeeded_runs,
            failed_runs: s.failed_runs,
            avg_latency_ms: s.avg_duration_ms,
            last_run_at: s.last_run_at,
        })
        .collect();

    Ok(Json(GlobalMetrics {
        total_targets: metrics.total_targets,
        total_schedules,
        active_schedules: by_status(crate::models::ScheduleStatus::Active),
        paused_schedules: by_status(crate::models::ScheduleStatus::Paused),
        completed_schedules: by_status(crate::models::ScheduleStatus::Completed),
        total_runs,
        runs_last_hour: metrics.runs_last_hour,
        runs_last_24h: metrics.runs_last_24h,
        success_rate_24h: percentage(metrics.succeeded_last_24h, metrics.runs_last_24h),
        avg_latency_24h_ms: metrics.avg_duration_ms_24h,
        schedules,
    }))
}

/// GET /api/v1/metrics/prometheus
#[utoipa::path(
    get,
    path = "/metrics/prometheus",
    context_path = "/api/v1",
    tag = "metrics",
    operation_id = "get_prometheus_metrics",
    responses(
        (status = 200, description = "Metrics in Prometheus text exposition format"),
    ),
)]
pub async fn get_prometheus_metrics(State(state): State<SharedState>) -> Result<impl IntoResponse> {
    let now = state.clock.now();
    let metrics = state.store.metrics(now).await?;

    let mut lines = Vec::new();

    lines.push("# HELP api_scheduler_targets_total Total number of targets".to_string());
    lines.push("# TYPE api_scheduler_targets_total gauge".to_string());
    lines.push(format!("api_scheduler_targets_total {}", metrics.total_targets));

    lines.push(String::new());
    lines.push("# HELP api_scheduler_schedules_total Schedules by status".to_string());
    lines.push("# TYPE api_scheduler_schedules_total gauge".to_string());
    for (status, count) in &metrics.schedules_by_status {
        lines.push(format!(
            "api_scheduler_schedules_total{{status=\"{}\"}} {}",
            status.as_str(),
            count
        ));
    }

    lines.push(String::new());
    lines.push("# HELP api_scheduler_runs_total Runs by status".to_string());
    lines.push("# TYPE api_scheduler_runs_total counter".to_string());
    for (status, count) in &metrics.runs_by_status {
        lines.push(format!(
            "api_scheduler_runs_total{{status=\"{}\"}} {}",
            status.as_str(),
            count
        ));
    }

    lines.push(String::new());
    lines.push("# HELP api_scheduler_latency_ms Mean attempt latency over 24h".to_string());
    lines.push("# TYPE api_scheduler_latency_ms gauge".to_string());
    lines.push(format!(
        "api_scheduler_latency_ms {}",
        metrics
            .avg_duration_ms_24h
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "0".to_string())
    ));

    lines.push(String::new());
    lines.push("# HELP api_scheduler_errors_total Attempt errors by class".to_string());
    lines.push("# TYPE api_scheduler_errors_total counter".to_string());
    for (class, count) in &metrics.errors_by_class {
        lines.push(format!(
            "api_scheduler_errors_total{{type=\"{}\"}} {}",
            class.as_str(),
            count
        ));
    }
    lines.push(String::new());

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        lines.join("\n"),
    ))
}

/// GET /api/v1/health
#[utoipa::path(
    get,
    path = "/health",
    context_path = "/api/v1",
    tag = "health",
    operation_id = "health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
)]
pub async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": state.clock.now().format("%Y-%m-%dT%H:%M:%S").to_string(),
    }))
}
