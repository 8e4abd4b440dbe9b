//! Request/response DTOs and boundary validation.
//!
//! Validation runs before any state is written: a rejected request leaves
//! no rows behind.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Attempt, HttpMethod, Run, RunStatus, ScheduleType};
use crate::services::trigger;
use crate::store::{NewSchedule, NewTarget, RunFilter, SchedulePatch, TargetPatch};

/// Generic message response.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Count response for `/runs/count`.
#[derive(Debug, Serialize, ToSchema)]
pub struct CountResponse {
    pub count: i64,
}

// ── Targets ─────────────────────────────────────────────────────────────

/// Request to create a target.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTargetRequest {
    pub name: String,
    pub url: String,
    pub method: Option<HttpMethod>,
    /// Header name → string value mapping.
    #[schema(value_type = Option<Object>)]
    pub headers: Option<serde_json::Value>,
    pub body_template: Option<String>,
    pub timeout_seconds: Option<i32>,
}

impl CreateTargetRequest {
    pub fn validate(self, config: &Config) -> Result<NewTarget> {
        validate_name(&self.name)?;
        validate_url(&self.url)?;
        let headers = self.headers.unwrap_or_else(|| serde_json::json!({}));
        validate_headers(&headers)?;
        let timeout_seconds = self
            .timeout_seconds
            .unwrap_or(config.default_timeout_seconds as i32);
        validate_timeout(timeout_seconds, config)?;

        Ok(NewTarget {
            name: self.name,
            url: self.url,
            method: self.method.unwrap_or(HttpMethod::Get),
            headers,
            body_template: self.body_template,
            timeout_seconds,
        })
    }
}

/// Request to update a target. Absent fields are left unchanged.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTargetRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<HttpMethod>,
    #[schema(value_type = Option<Object>)]
    pub headers: Option<serde_json::Value>,
    pub body_template: Option<String>,
    pub timeout_seconds: Option<i32>,
}

impl UpdateTargetRequest {
    pub fn validate(self, config: &Config) -> Result<TargetPatch> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(url) = &self.url {
            validate_url(url)?;
        }
        if let Some(headers) = &self.headers {
            validate_headers(headers)?;
        }
        if let Some(timeout) = self.timeout_seconds {
            validate_timeout(timeout, config)?;
        }

        Ok(TargetPatch {
            name: self.name,
            url: self.url,
            method: self.method,
            headers: self.headers,
            body_template: self.body_template,
            timeout_seconds: self.timeout_seconds,
        })
    }
}

// ── Schedules ───────────────────────────────────────────────────────────

/// Request to create a schedule.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub target_id: Uuid,
    pub schedule_type: ScheduleType,
    pub interval_seconds: Option<i32>,
    pub cron_expression: Option<String>,
    /// First instant the rule may fire; "now" when absent.
    pub start_at: Option<NaiveDateTime>,
    pub duration_seconds: Option<i32>,
    pub max_runs: Option<i32>,
}

impl CreateScheduleRequest {
    pub fn validate(self, start_at: NaiveDateTime) -> Result<NewSchedule> {
        validate_name(&self.name)?;

        match self.schedule_type {
            ScheduleType::Interval => {
                let interval = self.interval_seconds.ok_or_else(|| {
                    AppError::Validation(
                        "interval_seconds is required for interval schedule type".into(),
                    )
                })?;
                if interval < 1 {
                    return Err(AppError::Validation(
                        "interval_seconds must be at least 1".into(),
                    ));
                }
                if self.cron_expression.is_some() {
                    return Err(AppError::Validation(
                        "cron_expression is not allowed for interval schedule type".into(),
                    ));
                }
            }
            ScheduleType::Cron => {
                let expr = self.cron_expression.as_deref().ok_or_else(|| {
                    AppError::Validation(
                        "cron_expression is required for cron schedule type".into(),
                    )
                })?;
                trigger::parse_cron(expr)?;
                if self.interval_seconds.is_some() {
                    return Err(AppError::Validation(
                        "interval_seconds is not allowed for cron schedule type".into(),
                    ));
                }
            }
        }

        if self.duration_seconds.is_some() && self.max_runs.is_some() {
            return Err(AppError::Validation(
                "at most one of duration_seconds and max_runs may be set".into(),
            ));
        }
        validate_positive("duration_seconds", self.duration_seconds)?;
        validate_positive("max_runs", self.max_runs)?;

        Ok(NewSchedule {
            name: self.name,
            target_id: self.target_id,
            schedule_type: self.schedule_type,
            interval_seconds: self.interval_seconds,
            cron_expression: self.cron_expression,
            start_at: self.start_at.unwrap_or(start_at),
            duration_seconds: self.duration_seconds,
            max_runs: self.max_runs,
        })
    }
}

/// Request to update a schedule. Absent fields are left unchanged; the
/// timing rule must keep matching the schedule's declared type.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub interval_seconds: Option<i32>,
    pub cron_expression: Option<String>,
    pub duration_seconds: Option<i32>,
    pub max_runs: Option<i32>,
}

impl UpdateScheduleRequest {
    pub fn validate(self, schedule_type: ScheduleType) -> Result<SchedulePatch> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if self.interval_seconds.is_some() && schedule_type != ScheduleType::Interval {
            return Err(AppError::Validation(
                "interval_seconds is not allowed for cron schedule type".into(),
            ));
        }
        if let Some(interval) = self.interval_seconds {
            if interval < 1 {
                return Err(AppError::Validation(
                    "interval_seconds must be at least 1".into(),
                ));
            }
        }
        if self.cron_expression.is_some() && schedule_type != ScheduleType::Cron {
            return Err(AppError::Validation(
                "cron_expression is not allowed for interval schedule type".into(),
            ));
        }
        if let Some(expr) = self.cron_expression.as_deref() {
            trigger::parse_cron(expr)?;
        }
        validate_positive("duration_seconds", self.duration_seconds)?;
        validate_positive("max_runs", self.max_runs)?;

        Ok(SchedulePatch {
            name: self.name,
            interval_seconds: self.interval_seconds,
            cron_expression: self.cron_expression,
            duration_seconds: self.duration_seconds,
            max_runs: self.max_runs,
        })
    }
}

// ── Runs ────────────────────────────────────────────────────────────────

/// Query parameters for listing runs.
#[derive(Debug, Deserialize, IntoParams)]
pub struct RunsQuery {
    /// Filter by schedule
    pub schedule_id: Option<Uuid>,
    /// Filter by run status
    pub status: Option<RunStatus>,
    /// Runs scheduled at or after this time
    pub start_time: Option<NaiveDateTime>,
    /// Runs scheduled at or before this time
    pub end_time: Option<NaiveDateTime>,
    /// Maximum number of runs to return (1-1000)
    pub limit: Option<i64>,
    /// Number of runs to skip
    pub offset: Option<i64>,
}

impl RunsQuery {
    pub fn into_filter(self) -> RunFilter {
        RunFilter {
            schedule_id: self.schedule_id,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            limit: self.limit.unwrap_or(100).clamp(1, 1000),
            offset: self.offset.unwrap_or(0).max(0),
        }
    }
}

/// Run with its full attempt trail.
#[derive(Debug, Serialize, ToSchema)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: Run,
    pub attempts: Vec<Attempt>,
}

// ── Metrics ─────────────────────────────────────────────────────────────

/// Per-schedule run statistics.
#[derive(Debug, Serialize, ToSchema)]
pub struct ScheduleMetrics {
    pub schedule_id: Uuid,
    pub schedule_name: String,
    pub total_runs: i64,
    pub succeeded_runs: i64,
    pub failed_runs: i64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub last_run_at: Option<NaiveDateTime>,
}

/// Global system metrics.
#[derive(Debug, Serialize, ToSchema)]
pub struct GlobalMetrics {
    pub total_targets: i64,
    pub total_schedules: i64,
    pub active_schedules: i64,
    pub paused_schedules: i64,
    pub completed_schedules: i64,
    pub total_runs: i64,
    pub runs_last_hour: i64,
    pub runs_last_24h: i64,
    pub success_rate_24h: f64,
    pub avg_latency_24h_ms: Option<f64>,
    pub schedules: Vec<ScheduleMetrics>,
}

// ── Shared validators ───────────────────────────────────────────────────

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(AppError::Validation(
            "name must be 1-255 characters".into(),
        ));
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(AppError::Validation(
            "url must be an absolute http:// or https:// URL".into(),
        ));
    }
    Ok(())
}

fn validate_headers(headers: &serde_json::Value) -> Result<()> {
    let Some(object) = headers.as_object() else {
        return Err(AppError::Validation(
            "headers must be an object of string values".into(),
        ));
    };
    if object.values().any(|v| !v.is_string()) {
        return Err(AppError::Validation(
            "headers must be an object of string values".into(),
        ));
    }
    Ok(())
}

fn validate_timeout(timeout: i32, config: &Config) -> Result<()> {
    let max = config.max_timeout_seconds as i32;
    if timeout < 1 || timeout > max {
        return Err(AppError::Validation(format!(
            "timeout_seconds must be between 1 and {max}"
        )));
    }
    Ok(())
}

fn validate_positive(field: &str, value: Option<i32>) -> Result<()> {
    if let Some(value) = value {
        if value < 1 {
            return Err(AppError::Validation(format!("{field} must be at least 1")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn interval_request() -> CreateScheduleRequest {
        CreateScheduleRequest {
            name: "poll".into(),
            target_id: Uuid::new_v4(),
            schedule_type: ScheduleType::Interval,
            interval_seconds: Some(10),
            cron_expression: None,
            start_at: None,
            duration_seconds: None,
            max_runs: None,
        }
    }

    #[test]
    fn test_interval_requires_interval_seconds() {
        let request = CreateScheduleRequest {
            interval_seconds: None,
            ..interval_request()
        };
        assert!(matches!(
            request.validate(now()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_cron_requires_expression() {
        let request = CreateScheduleRequest {
            schedule_type: ScheduleType::Cron,
            interval_seconds: None,
            cron_expression: None,
            ..interval_request()
        };
        assert!(matches!(
            request.validate(now()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_both_window_kinds() {
        let request = CreateScheduleRequest {
            duration_seconds: Some(60),
            max_runs: Some(5),
            ..interval_request()
        };
        assert!(matches!(
            request.validate(now()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_start_at_defaults_to_now() {
        let new = interval_request().validate(now()).unwrap();
        assert_eq!(new.start_at, now());
    }

    #[test]
    fn test_url_validation() {
        assert!(validate_url("https://example.com/hook").is_ok());
        assert!(validate_url("http://example.com").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("example.com").is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        let config = Config::default();
        assert!(validate_timeout(1, &config).is_ok());
        assert!(validate_timeout(120, &config).is_ok());
        assert!(validate_timeout(0, &config).is_err());
        assert!(validate_timeout(121, &config).is_err());
    }

    #[test]
    fn test_headers_must_be_string_map() {
        assert!(validate_headers(&serde_json::json!({"X-Api-Key": "k"})).is_ok());
        assert!(validate_headers(&serde_json::json!({"n": 1})).is_err());
        assert!(validate_headers(&serde_json::json!(["a"])).is_err());
    }
}
