//! OpenAPI specification generated from handler annotations via utoipa.

use utoipa::OpenApi;

/// Top-level OpenAPI document for the API Scheduler.
///
/// Each handler module contributes its own paths and schemas via per-module
/// `#[derive(OpenApi)]` structs that are merged into this root document at
/// startup.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "API Scheduler",
        description = "Cron for API calls: schedule HTTP requests to external targets \
                       with retries, error classification, and a durable run history.",
        version = "1.0.0",
    ),
    servers(
        (url = "/", description = "Current server"),
    ),
    tags(
        (name = "targets", description = "Outbound HTTP endpoint definitions"),
        (name = "schedules", description = "Interval and cron timing rules"),
        (name = "runs", description = "Execution history and attempt trails"),
        (name = "metrics", description = "Aggregate statistics"),
        (name = "health", description = "Liveness probe"),
    ),
    components(schemas(ErrorResponse))
)]
pub struct ApiDoc;

/// Standard error response body returned by all endpoints on failure.
#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g. "NOT_FOUND", "VALIDATION_ERROR")
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

pub fn build_openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();

    doc.merge(super::handlers::targets::TargetsApiDoc::openapi());
    doc.merge(super::handlers::schedules::SchedulesApiDoc::openapi());
    doc.merge(super::handlers::runs::RunsApiDoc::openapi());
    doc.merge(super::handlers::metrics::MetricsApiDoc::openapi());

    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_merges_all_modules() {
        let spec = build_openapi();
        assert_eq!(spec.info.title, "API Scheduler");

        let path_count = spec.paths.paths.len();
        assert!(
            path_count >= 14,
            "Expected at least 14 paths, got {path_count}. A module merge may be missing."
        );
    }
}
