//! In-memory store backend.
//!
//! Mirrors the Postgres backend's semantics (idempotency-key uniqueness,
//! legal status transitions, cascading deletes) without external state.
//! Used by the test suites and by `DATABASE_URL=memory://` demo runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Attempt, ErrorClass, Run, RunStatus, Schedule, ScheduleStatus, Target};

use super::{
    NewAttempt, NewRun, NewSchedule, NewTarget, RunCompletion, RunFilter, SchedulePatch,
    ScheduleRunStats, Store, StoreMetrics, TargetPatch,
};

#[derive(Default)]
struct Inner {
    targets: HashMap<Uuid, Target>,
    schedules: HashMap<Uuid, Schedule>,
    runs: HashMap<Uuid, Run>,
    attempts: Vec<Attempt>,
}

/// In-process store. All state lives behind one mutex; operations never
/// await while holding it.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_filter(run: &Run, filter: &RunFilter) -> bool {
    if let Some(schedule_id) = filter.schedule_id {
        if run.schedule_id != schedule_id {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if run.status != status {
            return false;
        }
    }
    if let Some(start) = filter.start_time {
        if run.scheduled_at < start {
            return false;
        }
    }
    if let Some(end) = filter.end_time {
        if run.scheduled_at > end {
            return false;
        }
    }
    true
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_target(&self, new: NewTarget, now: NaiveDateTime) -> Result<Target> {
        let target = Target {
            id: Uuid::new_v4(),
            name: new.name,
            url: new.url,
            method: new.method,
            headers: new.headers,
            body_template: new.body_template,
            timeout_seconds: new.timeout_seconds,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.targets.insert(target.id, target.clone());
        Ok(target)
    }

    async fn list_targets(&self) -> Result<Vec<Target>> {
        let inner = self.inner.lock().unwrap();
        let mut targets: Vec<Target> = inner.targets.values().cloned().collect();
        targets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(targets)
    }

    async fn get_target(&self, id: Uuid) -> Result<Target> {
        let inner = self.inner.lock().unwrap();
        inner
            .targets
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Target {id} not found")))
    }

    async fn update_target(
        &self,
        id: Uuid,
        patch: TargetPatch,
        now: NaiveDateTime,
    ) -> Result<Target> {
        let mut inner = self.inner.lock().unwrap();
        let target = inner
            .targets
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Target {id} not found")))?;
        if let Some(name) = patch.name {
            target.name = name;
        }
        if let Some(url) = patch.url {
            target.url = url;
        }
        if let Some(method) = patch.method {
            target.method = method;
        }
        if let Some(headers) = patch.headers {
            target.headers = headers;
        }
        if let Some(body_template) = patch.body_template {
            target.body_template = Some(body_template);
        }
        if let Some(timeout) = patch.timeout_seconds {
            target.timeout_seconds = timeout;
        }
        target.updated_at = now;
        Ok(target.clone())
    }

    async fn delete_target(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.targets.remove(&id).is_none() {
            return Err(AppError::NotFound(format!("Target {id} not found")));
        }
        // Cascade: schedules for the target, their runs, their attempts.
        let schedule_ids: Vec<Uuid> = inner
            .schedules
            .values()
            .filter(|s| s.target_id == id)
            .map(|s| s.id)
            .collect();
        for schedule_id in &schedule_ids {
            inner.schedules.remove(schedule_id);
        }
        let run_ids: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|r| schedule_ids.contains(&r.schedule_id))
            .map(|r| r.id)
            .collect();
        for run_id in &run_ids {
            inner.runs.remove(run_id);
        }
        inner.attempts.retain(|a| !run_ids.contains(&a.run_id));
        Ok(())
    }

    async fn create_schedule(&self, new: NewSchedule, now: NaiveDateTime) -> Result<Schedule> {
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: new.name,
            target_id: new.target_id,
            schedule_type: new.schedule_type,
            interval_seconds: new.interval_seconds,
            cron_expression: new.cron_expression,
            start_at: new.start_at,
            duration_seconds: new.duration_seconds,
            max_runs: new.max_runs,
            status: ScheduleStatus::Active,
            runs_count: 0,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn list_schedules(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock().unwrap();
        let mut schedules: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        schedules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(schedules)
    }

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        self.list_schedules(Some(ScheduleStatus::Active)).await
    }

    async fn list_schedules_for_target(&self, target_id: Uuid) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .schedules
            .values()
            .filter(|s| s.target_id == target_id)
            .cloned()
            .collect())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule> {
        let inner = self.inner.lock().unwrap();
        inner
            .schedules
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Schedule {id} not found")))
    }

    async fn update_schedule(
        &self,
        id: Uuid,
        patch: SchedulePatch,
        now: NaiveDateTime,
    ) -> Result<Schedule> {
        let mut inner = self.inner.lock().unwrap();
        let schedule = inner
            .schedules
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Schedule {id} not found")))?;
        if let Some(name) = patch.name {
            schedule.name = name;
        }
        if let Some(interval) = patch.interval_seconds {
            schedule.interval_seconds = Some(interval);
        }
        if let Some(cron) = patch.cron_expression {
            schedule.cron_expression = Some(cron);
        }
        if let Some(duration) = patch.duration_seconds {
            schedule.duration_seconds = Some(duration);
        }
        if let Some(max_runs) = patch.max_runs {
            schedule.max_runs = Some(max_runs);
        }
        schedule.updated_at = now;
        Ok(schedule.clone())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.schedules.remove(&id).is_none() {
            return Err(AppError::NotFound(format!("Schedule {id} not found")));
        }
        let run_ids: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|r| r.schedule_id == id)
            .map(|r| r.id)
            .collect();
        for run_id in &run_ids {
            inner.runs.remove(run_id);
        }
        inner.attempts.retain(|a| !run_ids.contains(&a.run_id));
        Ok(())
    }

    async fn set_schedule_status(
        &self,
        id: Uuid,
        status: ScheduleStatus,
        now: NaiveDateTime,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(schedule) = inner.schedules.get_mut(&id) {
            schedule.status = status;
            schedule.updated_at = now;
        }
        Ok(())
    }

    async fn set_next_run_at(
        &self,
        id: Uuid,
        next_run_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(schedule) = inner.schedules.get_mut(&id) {
            schedule.next_run_at = next_run_at;
            schedule.updated_at = now;
        }
        Ok(())
    }

    async fn record_schedule_fire(&self, id: Uuid, now: NaiveDateTime) -> Result<Schedule> {
        let mut inner = self.inner.lock().unwrap();
        let schedule = inner
            .schedules
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Schedule {id} not found")))?;
        schedule.runs_count += 1;
        schedule.last_run_at = Some(now);
        schedule.updated_at = now;
        Ok(schedule.clone())
    }

    async fn create_run(&self, new: NewRun, now: NaiveDateTime) -> Result<Run> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .runs
            .values()
            .any(|r| r.idempotency_key == new.idempotency_key)
        {
            return Err(AppError::Conflict(format!(
                "run {} already exists",
                new.idempotency_key
            )));
        }
        let run = Run {
            id: Uuid::new_v4(),
            schedule_id: new.schedule_id,
            target_id: new.target_id,
            idempotency_key: new.idempotency_key,
            status: RunStatus::Pending,
            scheduled_at: new.scheduled_at,
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            final_status_code: None,
            final_error: None,
            created_at: now,
        };
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn mark_run_running(&self, id: Uuid, started_at: NaiveDateTime) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Running;
                run.started_at = Some(started_at);
                Ok(())
            }
            _ => Err(AppError::Conflict(format!("Run {id} is not pending"))),
        }
    }

    async fn finish_run(&self, id: Uuid, completion: RunCompletion) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.runs.get_mut(&id) {
            Some(run) if run.status.is_in_flight() => {
                run.status = completion.status;
                run.completed_at = Some(completion.completed_at);
                run.attempt_count = completion.attempt_count;
                run.final_status_code = completion.final_status_code;
                run.final_error = completion.final_error;
                Ok(())
            }
            _ => Err(AppError::Conflict(format!("Run {id} is already terminal"))),
        }
    }

    async fn count_in_flight_runs(&self, schedule_id: Uuid) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .values()
            .filter(|r| r.schedule_id == schedule_id && r.status.is_in_flight())
            .count() as i64)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| matches_filter(r, filter))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        Ok(runs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn count_runs(&self, filter: &RunFilter) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .values()
            .filter(|r| matches_filter(r, filter))
            .count() as i64)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        let inner = self.inner.lock().unwrap();
        inner
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Run {id} not found")))
    }

    async fn bulk_fail_in_flight(&self, completed_at: NaiveDateTime, error: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut failed = 0u64;
        for run in inner.runs.values_mut() {
            if run.status.is_in_flight() {
                run.status = RunStatus::Failed;
                run.completed_at = Some(completed_at);
                run.final_error = Some(error.to_string());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn append_attempt(&self, new: NewAttempt, now: NaiveDateTime) -> Result<Attempt> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .attempts
            .iter()
            .any(|a| a.run_id == new.run_id && a.attempt_number == new.attempt_number)
        {
            return Err(AppError::Conflict(format!(
                "attempt {} of run {} already exists",
                new.attempt_number, new.run_id
            )));
        }
        let attempt = Attempt {
            id: Uuid::new_v4(),
            run_id: new.run_id,
            attempt_number: new.attempt_number,
            request_url: new.request_url,
            request_method: new.request_method,
            request_headers: new.request_headers,
            request_body: new.request_body,
            started_at: new.started_at,
            completed_at: new.completed_at,
            duration_ms: new.duration_ms,
            response_status: new.response_status,
            response_headers: new.response_headers,
            response_body: new.response_body,
            response_size_bytes: new.response_size_bytes,
            error_class: new.error_class,
            error_message: new.error_message,
            created_at: now,
        };
        inner.attempts.push(attempt.clone());
        Ok(attempt)
    }

    async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<Attempt>> {
        let inner = self.inner.lock().unwrap();
        let mut attempts: Vec<Attempt> = inner
            .attempts
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn metrics(&self, now: NaiveDateTime) -> Result<StoreMetrics> {
        let one_hour_ago = now - chrono::Duration::hours(1);
        let one_day_ago = now - chrono::Duration::hours(24);
        let inner = self.inner.lock().unwrap();

        let mut schedules_by_status: HashMap<ScheduleStatus, i64> = HashMap::new();
        for schedule in inner.schedules.values() {
            *schedules_by_status.entry(schedule.status).or_default() += 1;
        }
        let mut runs_by_status: HashMap<RunStatus, i64> = HashMap::new();
        for run in inner.runs.values() {
            *runs_by_status.entry(run.status).or_default() += 1;
        }
        let mut errors_by_class: HashMap<ErrorClass, i64> = HashMap::new();
        for attempt in &inner.attempts {
            if attempt.error_class != ErrorClass::None {
                *errors_by_class.entry(attempt.error_class).or_default() += 1;
            }
        }

        Ok(StoreMetrics {
            total_targets: inner.targets.len() as i64,
            schedules_by_status: schedules_by_status.into_iter().collect(),
            runs_by_status: runs_by_status.into_iter().collect(),
            runs_last_hour: inner
                .runs
                .values()
                .filter(|r| r.scheduled_at >= one_hour_ago)
                .count() as i64,
            runs_last_24h: inner
                .runs
                .values()
                .filter(|r| r.scheduled_at >= one_day_ago)
                .count() as i64,
            succeeded_last_24h: inner
                .runs
                .values()
                .filter(|r| r.scheduled_at >= one_day_ago && r.status == RunStatus::Succeeded)
                .count() as i64,
            avg_duration_ms_24h: mean(
                inner
                    .attempts
                    .iter()
                    .filter(|a| a.started_at >= one_day_ago)
                    .filter_map(|a| a.duration_ms),
            ),
            errors_by_class: errors_by_class.into_iter().collect(),
        })
    }

    async fn schedule_run_stats(&self) -> Result<Vec<ScheduleRunStats>> {
        let inner = self.inner.lock().unwrap();
        let mut stats: Vec<ScheduleRunStats> = inner
            .schedules
            .values()
            .filter(|s| matches!(s.status, ScheduleStatus::Active | ScheduleStatus::Paused))
            .map(|schedule| {
                let runs: Vec<&Run> = inner
                    .runs
                    .values()
                    .filter(|r| r.schedule_id == schedule.id)
                    .collect();
                let run_ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
                ScheduleRunStats {
                    schedule_id: schedule.id,
                    schedule_name: schedule.name.clone(),
                    total_runs: runs.len() as i64,
                    succeeded_runs: runs
                        .iter()
                        .filter(|r| r.status == RunStatus::Succeeded)
                        .count() as i64,
                    failed_runs: runs.iter().filter(|r| r.status == RunStatus::Failed).count()
                        as i64,
                    avg_duration_ms: mean(
                        inner
                            .attempts
                            .iter()
                            .filter(|a| run_ids.contains(&a.run_id))
                            .filter_map(|a| a.duration_ms),
                    ),
                    last_run_at: schedule.last_run_at,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.schedule_name.cmp(&b.schedule_name));
        Ok(stats)
    }
}
