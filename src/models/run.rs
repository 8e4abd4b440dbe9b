//! Run model: one intended firing of a schedule.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Run execution status. `Succeeded` and `Failed` are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Pending and running runs count against the single-inflight gate.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Run entity
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct Run {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub target_id: Uuid,
    /// `<schedule_id>:<scheduled_at floored to the second>`. Unique across
    /// runs; a conflicting insert means the firing was already handled.
    pub idempotency_key: String,
    pub status: RunStatus,
    pub scheduled_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub attempt_count: i32,
    pub final_status_code: Option<i32>,
    pub final_error: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Build the idempotency key for a schedule firing.
///
/// `scheduled_at` must already be floored to the second; the key and the
/// stored `scheduled_at` always agree.
pub fn idempotency_key(schedule_id: Uuid, scheduled_at: NaiveDateTime) -> String {
    format!("{}:{}", schedule_id, scheduled_at.format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_idempotency_key_format() {
        let id = Uuid::nil();
        let at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 5, 30)
            .unwrap();
        assert_eq!(
            idempotency_key(id, at),
            "00000000-0000-0000-0000-000000000000:20240301120530"
        );
    }

    #[test]
    fn test_in_flight_statuses() {
        assert!(RunStatus::Pending.is_in_flight());
        assert!(RunStatus::Running.is_in_flight());
        assert!(!RunStatus::Succeeded.is_in_flight());
        assert!(!RunStatus::Failed.is_in_flight());
    }
}
