//! Durable repository of targets, schedules, runs, and attempts.
//!
//! The [`Store`] trait is the persistence contract between the scheduler and
//! the executor: idempotent run creation, linearizable run status transitions
//! per id, append-only attempts. Two backends implement it:
//! - `postgres`: production backend (sqlx)
//! - `memory`: in-process backend for tests and demo runs

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Attempt, ErrorClass, HttpMethod, Run, RunStatus, Schedule, ScheduleStatus, ScheduleType,
    Target,
};

/// Fields for creating a target.
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: serde_json::Value,
    pub body_template: Option<String>,
    pub timeout_seconds: i32,
}

/// Partial update of a target. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct TargetPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<HttpMethod>,
    pub headers: Option<serde_json::Value>,
    pub body_template: Option<String>,
    pub timeout_seconds: Option<i32>,
}

/// Fields for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub target_id: Uuid,
    pub schedule_type: ScheduleType,
    pub interval_seconds: Option<i32>,
    pub cron_expression: Option<String>,
    pub start_at: NaiveDateTime,
    pub duration_seconds: Option<i32>,
    pub max_runs: Option<i32>,
}

/// Partial update of a schedule. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct SchedulePatch {
    pub name: Option<String>,
    pub interval_seconds: Option<i32>,
    pub cron_expression: Option<String>,
    pub duration_seconds: Option<i32>,
    pub max_runs: Option<i32>,
}

/// Fields for creating a run at firing time.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub schedule_id: Uuid,
    pub target_id: Uuid,
    pub scheduled_at: NaiveDateTime,
    pub idempotency_key: String,
}

/// Terminal state written when a run finishes.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub completed_at: NaiveDateTime,
    pub attempt_count: i32,
    pub final_status_code: Option<i32>,
    pub final_error: Option<String>,
}

/// Fields for appending an attempt to a run.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub run_id: Uuid,
    pub attempt_number: i32,
    pub request_url: String,
    pub request_method: HttpMethod,
    pub request_headers: serde_json::Value,
    pub request_body: Option<String>,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub duration_ms: Option<f64>,
    pub response_status: Option<i32>,
    pub response_headers: Option<serde_json::Value>,
    pub response_body: Option<String>,
    pub response_size_bytes: Option<i64>,
    pub error_class: ErrorClass,
    pub error_message: Option<String>,
}

/// Filter for run listings.
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub schedule_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            schedule_id: None,
            status: None,
            start_time: None,
            end_time: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Aggregate counters for the metrics endpoints.
#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
    pub total_targets: i64,
    pub schedules_by_status: Vec<(ScheduleStatus, i64)>,
    pub runs_by_status: Vec<(RunStatus, i64)>,
    pub runs_last_hour: i64,
    pub runs_last_24h: i64,
    pub succeeded_last_24h: i64,
    pub avg_duration_ms_24h: Option<f64>,
    pub errors_by_class: Vec<(ErrorClass, i64)>,
}

/// Per-schedule run statistics for the metrics endpoints.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleRunStats {
    pub schedule_id: Uuid,
    pub schedule_name: String,
    pub total_runs: i64,
    pub succeeded_runs: i64,
    pub failed_runs: i64,
    pub avg_duration_ms: Option<f64>,
    pub last_run_at: Option<NaiveDateTime>,
}

/// Persistence contract shared by the scheduler, the executor, and the API
/// adapters.
///
/// Implementations must serialize status transitions per run id: a run moves
/// `pending → running → succeeded|failed`, terminal states are immutable, and
/// `create_run` fails with [`crate::error::AppError::Conflict`] when the
/// idempotency key collides.
///
/// `now` parameters carry the wall-clock instant from the caller's
/// [`crate::services::clock::Clock`]; backends never read the OS clock.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Targets ─────────────────────────────────────────────────────────

    async fn create_target(&self, new: NewTarget, now: NaiveDateTime) -> Result<Target>;
    async fn list_targets(&self) -> Result<Vec<Target>>;
    async fn get_target(&self, id: Uuid) -> Result<Target>;
    async fn update_target(&self, id: Uuid, patch: TargetPatch, now: NaiveDateTime)
        -> Result<Target>;
    /// Cascades to the target's schedules and their runs/attempts.
    async fn delete_target(&self, id: Uuid) -> Result<()>;

    // ── Schedules ───────────────────────────────────────────────────────

    async fn create_schedule(&self, new: NewSchedule, now: NaiveDateTime) -> Result<Schedule>;
    async fn list_schedules(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>>;
    /// Schedules to rearm on startup.
    async fn list_active_schedules(&self) -> Result<Vec<Schedule>>;
    async fn list_schedules_for_target(&self, target_id: Uuid) -> Result<Vec<Schedule>>;
    async fn get_schedule(&self, id: Uuid) -> Result<Schedule>;
    async fn update_schedule(
        &self,
        id: Uuid,
        patch: SchedulePatch,
        now: NaiveDateTime,
    ) -> Result<Schedule>;
    async fn delete_schedule(&self, id: Uuid) -> Result<()>;
    async fn set_schedule_status(
        &self,
        id: Uuid,
        status: ScheduleStatus,
        now: NaiveDateTime,
    ) -> Result<()>;
    async fn set_next_run_at(
        &self,
        id: Uuid,
        next_run_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Result<()>;
    /// Bump `runs_count` and `last_run_at` after a run was created for a
    /// firing. Returns the updated row so the caller rearms from fresh state.
    async fn record_schedule_fire(&self, id: Uuid, now: NaiveDateTime) -> Result<Schedule>;

    // ── Runs ────────────────────────────────────────────────────────────

    /// Atomic insert; fails with `AppError::Conflict` when the idempotency
    /// key already exists.
    async fn create_run(&self, new: NewRun, now: NaiveDateTime) -> Result<Run>;
    /// `pending → running` transition only.
    async fn mark_run_running(&self, id: Uuid, started_at: NaiveDateTime) -> Result<()>;
    /// Non-terminal → terminal transition only.
    async fn finish_run(&self, id: Uuid, completion: RunCompletion) -> Result<()>;
    async fn count_in_flight_runs(&self, schedule_id: Uuid) -> Result<i64>;
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;
    async fn count_runs(&self, filter: &RunFilter) -> Result<i64>;
    async fn get_run(&self, id: Uuid) -> Result<Run>;
    /// Fail every pending/running run in one pass. Used by startup recovery.
    /// Returns the number of runs failed.
    async fn bulk_fail_in_flight(&self, completed_at: NaiveDateTime, error: &str) -> Result<u64>;

    // ── Attempts ────────────────────────────────────────────────────────

    async fn append_attempt(&self, new: NewAttempt, now: NaiveDateTime) -> Result<Attempt>;
    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<Attempt>>;

    // ── Metrics ─────────────────────────────────────────────────────────

    async fn metrics(&self, now: NaiveDateTime) -> Result<StoreMetrics>;
    async fn schedule_run_stats(&self) -> Result<Vec<ScheduleRunStats>>;
}
