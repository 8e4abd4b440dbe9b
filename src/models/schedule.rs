//! Schedule model: a timing rule producing firings against a target.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Kind of timing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "schedule_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// Fire every `interval_seconds` from `start_at`.
    Interval,
    /// Fire on a five-field cron expression.
    Cron,
}

/// Schedule lifecycle status. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "schedule_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Completed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

/// Schedule entity
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub target_id: Uuid,
    pub schedule_type: ScheduleType,
    pub interval_seconds: Option<i32>,
    pub cron_expression: Option<String>,
    /// First instant the rule may fire. Resolved to "now" at creation when
    /// the request omits it.
    pub start_at: NaiveDateTime,
    pub duration_seconds: Option<i32>,
    pub max_runs: Option<i32>,
    pub status: ScheduleStatus,
    /// Tally of runs created for this schedule. Monotonically increasing.
    pub runs_count: i32,
    pub last_run_at: Option<NaiveDateTime>,
    /// Advisory; the authoritative firing time is recomputed from the rule.
    pub next_run_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Schedule {
    /// End of the duration window, if one is configured.
    pub fn window_end(&self) -> Option<NaiveDateTime> {
        self.duration_seconds
            .map(|d| self.start_at + chrono::Duration::seconds(i64::from(d)))
    }

    /// True once the window can no longer admit a firing at `now`:
    /// either the duration elapsed or the run budget is spent.
    pub fn window_closed(&self, now: NaiveDateTime) -> bool {
        if let Some(end) = self.window_end() {
            if now > end {
                return true;
            }
        }
        if let Some(max) = self.max_runs {
            if self.runs_count >= max {
                return true;
            }
        }
        false
    }
}
