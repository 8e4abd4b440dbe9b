//! Postgres store backend (sqlx).

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Attempt, ErrorClass, Run, RunStatus, Schedule, ScheduleStatus, Target};

use super::{
    NewAttempt, NewRun, NewSchedule, NewTarget, RunCompletion, RunFilter, SchedulePatch,
    ScheduleRunStats, Store, StoreMetrics, TargetPatch,
};

/// Postgres-backed store.
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Translate a sqlx error, mapping unique violations to `Conflict` so the
/// scheduler can tell an idempotency-key collision from infrastructure
/// failure.
fn map_insert_error(e: sqlx::Error, what: &str) -> AppError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            return AppError::Conflict(format!("{what} already exists"));
        }
        if db_err.is_foreign_key_violation() {
            return AppError::NotFound(format!("{what} references a missing row"));
        }
    }
    AppError::Sqlx(e)
}

#[async_trait]
impl Store for PgStore {
    async fn create_target(&self, new: NewTarget, now: NaiveDateTime) -> Result<Target> {
        let target = sqlx::query_as::<_, Target>(
            r#"
            INSERT INTO targets (name, url, method, headers, body_template, timeout_seconds, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(&new.url)
        .bind(new.method)
        .bind(&new.headers)
        .bind(&new.body_template)
        .bind(new.timeout_seconds)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        Ok(target)
    }

    async fn list_targets(&self) -> Result<Vec<Target>> {
        let targets =
            sqlx::query_as::<_, Target>("SELECT * FROM targets ORDER BY created_at DESC")
                .fetch_all(&self.db)
                .await?;
        Ok(targets)
    }

    async fn get_target(&self, id: Uuid) -> Result<Target> {
        sqlx::query_as::<_, Target>("SELECT * FROM targets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Target {id} not found")))
    }

    async fn update_target(
        &self,
        id: Uuid,
        patch: TargetPatch,
        now: NaiveDateTime,
    ) -> Result<Target> {
        sqlx::query_as::<_, Target>(
            r#"
            UPDATE targets SET
                name = COALESCE($2, name),
                url = COALESCE($3, url),
                method = COALESCE($4, method),
                headers = COALESCE($5, headers),
                body_template = COALESCE($6, body_template),
                timeout_seconds = COALESCE($7, timeout_seconds),
                updated_at = $8
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&patch.name)
        .bind(&patch.url)
        .bind(patch.method)
        .bind(&patch.headers)
        .bind(&patch.body_template)
        .bind(patch.timeout_seconds)
        .bind(now)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Target {id} not found")))
    }

    async fn delete_target(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM targets WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Target {id} not found")));
        }
        Ok(())
    }

    async fn create_schedule(&self, new: NewSchedule, now: NaiveDateTime) -> Result<Schedule> {
        let schedule = sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO schedules
                (name, target_id, schedule_type, interval_seconds, cron_expression,
                 start_at, duration_seconds, max_runs, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'active', $9, $9)
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(new.target_id)
        .bind(new.schedule_type)
        .bind(new.interval_seconds)
        .bind(&new.cron_expression)
        .bind(new.start_at)
        .bind(new.duration_seconds)
        .bind(new.max_runs)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        Ok(schedule)
    }

    async fn list_schedules(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            r#"
            SELECT * FROM schedules
            WHERE ($1::schedule_status IS NULL OR status = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(status)
        .fetch_all(&self.db)
        .await?;
        Ok(schedules)
    }

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        self.list_schedules(Some(ScheduleStatus::Active)).await
    }

    async fn list_schedules_for_target(&self, target_id: Uuid) -> Result<Vec<Schedule>> {
        let schedules =
            sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE target_id = $1")
                .bind(target_id)
                .fetch_all(&self.db)
                .await?;
        Ok(schedules)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule> {
        sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Schedule {id} not found")))
    }

    async fn update_schedule(
        &self,
        id: Uuid,
        patch: SchedulePatch,
        now: NaiveDateTime,
    ) -> Result<Schedule> {
        sqlx::query_as::<_, Schedule>(
            r#"
            UPDATE schedules SET
                name = COALESCE($2, name),
                interval_seconds = COALESCE($3, interval_seconds),
                cron_expression = COALESCE($4, cron_expression),
                duration_seconds = COALESCE($5, duration_seconds),
                max_runs = COALESCE($6, max_runs),
                updated_at = $7
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&patch.name)
        .bind(patch.interval_seconds)
        .bind(&patch.cron_expression)
        .bind(patch.duration_seconds)
        .bind(patch.max_runs)
        .bind(now)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Schedule {id} not found")))
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Schedule {id} not found")));
        }
        Ok(())
    }

    async fn set_schedule_status(
        &self,
        id: Uuid,
        status: ScheduleStatus,
        now: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query("UPDATE schedules SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(now)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn set_next_run_at(
        &self,
        id: Uuid,
        next_run_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query("UPDATE schedules SET next_run_at = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(next_run_at)
            .bind(now)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn record_schedule_fire(&self, id: Uuid, now: NaiveDateTime) -> Result<Schedule> {
        sqlx::query_as::<_, Schedule>(
            r#"
            UPDATE schedules
            SET runs_count = runs_count + 1, last_run_at = $2, updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Schedule {id} not found")))
    }

    async fn create_run(&self, new: NewRun, now: NaiveDateTime) -> Result<Run> {
        sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO runs (schedule_id, target_id, idempotency_key, status, scheduled_at, created_at)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            RETURNING *
            "#,
        )
        .bind(new.schedule_id)
        .bind(new.target_id)
        .bind(&new.idempotency_key)
        .bind(new.scheduled_at)
        .bind(now)
        .fetch_one(&self.db)
        .await
        .map_err(|e| map_insert_error(e, &format!("run {}", new.idempotency_key)))
    }

    async fn mark_run_running(&self, id: Uuid, started_at: NaiveDateTime) -> Result<()> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'running', started_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!("Run {id} is not pending")));
        }
        Ok(())
    }

    async fn finish_run(&self, id: Uuid, completion: RunCompletion) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, completed_at = $3, attempt_count = $4,
                final_status_code = $5, final_error = $6
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(completion.status)
        .bind(completion.completed_at)
        .bind(completion.attempt_count)
        .bind(completion.final_status_code)
        .bind(&completion.final_error)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!("Run {id} is already terminal")));
        }
        Ok(())
    }

    async fn count_in_flight_runs(&self, schedule_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs WHERE schedule_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(schedule_id)
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            r#"
            SELECT * FROM runs
            WHERE ($1::uuid IS NULL OR schedule_id = $1)
              AND ($2::run_status IS NULL OR status = $2)
              AND ($3::timestamp IS NULL OR scheduled_at >= $3)
              AND ($4::timestamp IS NULL OR scheduled_at <= $4)
            ORDER BY scheduled_at DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(filter.schedule_id)
        .bind(filter.status)
        .bind(filter.start_time)
        .bind(filter.end_time)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.db)
        .await?;
        Ok(runs)
    }

    async fn count_runs(&self, filter: &RunFilter) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM runs
            WHERE ($1::uuid IS NULL OR schedule_id = $1)
              AND ($2::run_status IS NULL OR status = $2)
              AND ($3::timestamp IS NULL OR scheduled_at >= $3)
              AND ($4::timestamp IS NULL OR scheduled_at <= $4)
            "#,
        )
        .bind(filter.schedule_id)
        .bind(filter.status)
        .bind(filter.start_time)
        .bind(filter.end_time)
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Run {id} not found")))
    }

    async fn bulk_fail_in_flight(&self, completed_at: NaiveDateTime, error: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'failed', completed_at = $1, final_error = $2
            WHERE status IN ('pending', 'running')
            "#,
        )
        .bind(completed_at)
        .bind(error)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_attempt(&self, new: NewAttempt, now: NaiveDateTime) -> Result<Attempt> {
        sqlx::query_as::<_, Attempt>(
            r#"
            INSERT INTO attempts
                (run_id, attempt_number, request_url, request_method, request_headers,
                 request_body, started_at, completed_at, duration_ms, response_status,
                 response_headers, response_body, response_size_bytes, error_class,
                 error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING *
            "#,
        )
        .bind(new.run_id)
        .bind(new.attempt_number)
        .bind(&new.request_url)
        .bind(new.request_method)
        .bind(&new.request_headers)
        .bind(&new.request_body)
        .bind(new.started_at)
        .bind(new.completed_at)
        .bind(new.duration_ms)
        .bind(new.response_status)
        .bind(&new.response_headers)
        .bind(&new.response_body)
        .bind(new.response_size_bytes)
        .bind(new.error_class)
        .bind(&new.error_message)
        .bind(now)
        .fetch_one(&self.db)
        .await
        .map_err(|e| {
            map_insert_error(
                e,
                &format!("attempt {} of run {}", new.attempt_number, new.run_id),
            )
        })
    }

    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<Attempt>> {
        let attempts = sqlx::query_as::<_, Attempt>(
            "SELECT * FROM attempts WHERE run_id = $1 ORDER BY attempt_number",
        )
        .bind(run_id)
        .fetch_all(&self.db)
        .await?;
        Ok(attempts)
    }

    async fn metrics(&self, now: NaiveDateTime) -> Result<StoreMetrics> {
        let one_hour_ago = now - chrono::Duration::hours(1);
        let one_day_ago = now - chrono::Duration::hours(24);

        let (total_targets,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM targets")
            .fetch_one(&self.db)
            .await?;

        let schedules_by_status: Vec<(ScheduleStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM schedules GROUP BY status")
                .fetch_all(&self.db)
                .await?;

        let runs_by_status: Vec<(RunStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM runs GROUP BY status")
                .fetch_all(&self.db)
                .await?;

        let (runs_last_hour,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM runs WHERE scheduled_at >= $1")
                .bind(one_hour_ago)
                .fetch_one(&self.db)
                .await?;

        let (runs_last_24h,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM runs WHERE scheduled_at >= $1")
                .bind(one_day_ago)
                .fetch_one(&self.db)
                .await?;

        let (succeeded_last_24h,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs WHERE scheduled_at >= $1 AND status = 'succeeded'",
        )
        .bind(one_day_ago)
        .fetch_one(&self.db)
        .await?;

        let (avg_duration_ms_24h,): (Option<f64>,) = sqlx::query_as(
            "SELECT AVG(duration_ms) FROM attempts WHERE started_at >= $1 AND duration_ms IS NOT NULL",
        )
        .bind(one_day_ago)
        .fetch_one(&self.db)
        .await?;

        let errors_by_class: Vec<(ErrorClass, i64)> = sqlx::query_as(
            "SELECT error_class, COUNT(*) FROM attempts WHERE error_class != 'none' GROUP BY error_class",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(StoreMetrics {
            total_targets,
            schedules_by_status,
            runs_by_status,
            runs_last_hour,
            runs_last_24h,
            succeeded_last_24h,
            avg_duration_ms_24h,
            errors_by_class,
        })
    }

    async fn schedule_run_stats(&self) -> Result<Vec<ScheduleRunStats>> {
        let stats = sqlx::query_as::<_, ScheduleRunStats>(
            r#"
            SELECT
                s.id AS schedule_id,
                s.name AS schedule_name,
                COUNT(DISTINCT r.id) AS total_runs,
                COUNT(DISTINCT r.id) FILTER (WHERE r.status = 'succeeded') AS succeeded_runs,
                COUNT(DISTINCT r.id) FILTER (WHERE r.status = 'failed') AS failed_runs,
                AVG(a.duration_ms) AS avg_duration_ms,
                s.last_run_at
            FROM schedules s
            LEFT JOIN runs r ON r.schedule_id = s.id
            LEFT JOIN attempts a ON a.run_id = r.id
            WHERE s.status IN ('active', 'paused')
            GROUP BY s.id, s.name, s.last_run_at
            ORDER BY s.name
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(stats)
    }
}
