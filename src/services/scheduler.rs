//! Scheduling engine.
//!
//! A single loop owns the in-memory timer set. Lifecycle events from the API
//! arrive over a channel; firings create runs under the idempotency key and
//! dispatch them to the executor pool. The store stays the single source of
//! truth: timers are rebuilt from it on startup.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::models::{run, RunStatus, Schedule, ScheduleStatus};
use crate::services::clock::{floor_to_second, Clock};
use crate::services::executor::HttpExecutor;
use crate::services::trigger;
use crate::store::{NewRun, RunCompletion, Store};

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Cadence of the sweep that completes schedules whose duration window
/// elapsed between firings.
const WINDOW_SWEEP_INTERVAL_SECS: u64 = 60;

/// Sleep used when no timer is armed; lifecycle events wake the loop sooner.
const IDLE_SLEEP_SECS: u64 = 3600;

const STORE_RETRY_TRIES: u32 = 3;
const STORE_RETRY_BASE_MS: u64 = 200;

/// Written to a run that was created for a firing but skipped because the
/// previous run was still in flight.
pub const SKIPPED_RUN_ERROR: &str = "skipped: previous run still in progress";

/// Lifecycle events delivered to the scheduler loop.
#[derive(Debug)]
pub enum SchedulerEvent {
    ScheduleCreated(Uuid),
    ScheduleUpdated(Uuid),
    SchedulePaused(Uuid),
    ScheduleResumed(Uuid),
    ScheduleDeleted(Uuid),
    TargetDeleted(Uuid),
}

/// Cloneable sender half used by the API adapters and recovery.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub async fn schedule_created(&self, id: Uuid) {
        self.send(SchedulerEvent::ScheduleCreated(id)).await;
    }

    pub async fn schedule_updated(&self, id: Uuid) {
        self.send(SchedulerEvent::ScheduleUpdated(id)).await;
    }

    pub async fn schedule_paused(&self, id: Uuid) {
        self.send(SchedulerEvent::SchedulePaused(id)).await;
    }

    pub async fn schedule_resumed(&self, id: Uuid) {
        self.send(SchedulerEvent::ScheduleResumed(id)).await;
    }

    pub async fn schedule_deleted(&self, id: Uuid) {
        self.send(SchedulerEvent::ScheduleDeleted(id)).await;
    }

    /// Disarm every schedule referencing the target. Callers send this
    /// before committing the cascading delete.
    pub async fn target_deleted(&self, target_id: Uuid) {
        self.send(SchedulerEvent::TargetDeleted(target_id)).await;
    }

    async fn send(&self, event: SchedulerEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::error!("Scheduler loop is gone; dropping lifecycle event");
        }
    }
}

/// One armed single-shot timer. Stale entries (whose generation no longer
/// matches the schedule's current one) are skipped when popped.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArmedTimer {
    fire_at: NaiveDateTime,
    schedule_id: Uuid,
    generation: u64,
}

impl Ord for ArmedTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.schedule_id.cmp(&other.schedule_id))
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for ArmedTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The scheduler loop state. Owned by a single task; the rest of the system
/// talks to it through [`SchedulerHandle`].
pub struct Scheduler {
    store: Arc<dyn Store>,
    executor: Arc<HttpExecutor>,
    clock: Clock,
    misfire_grace: chrono::Duration,
    permits: Arc<Semaphore>,
    rx: mpsc::Receiver<SchedulerEvent>,
    timers: BinaryHeap<Reverse<ArmedTimer>>,
    generations: HashMap<Uuid, u64>,
    next_generation: u64,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<HttpExecutor>,
        clock: Clock,
        config: &Config,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = Self {
            store,
            executor,
            clock,
            misfire_grace: chrono::Duration::seconds(i64::from(config.job_misfire_grace_seconds)),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            rx,
            timers: BinaryHeap::new(),
            generations: HashMap::new(),
            next_generation: 0,
        };
        (scheduler, SchedulerHandle { tx })
    }

    /// Run the scheduler loop until every handle is dropped or the store
    /// fails persistently.
    pub async fn run(mut self) {
        tracing::info!("Scheduler loop started");
        let mut sweep =
            tokio::time::interval(Duration::from_secs(WINDOW_SWEEP_INTERVAL_SECS));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let sleep_duration = self
                .peek_next()
                .map(|timer| self.duration_until(timer.fire_at))
                .unwrap_or(Duration::from_secs(IDLE_SLEEP_SECS));

            let step = tokio::select! {
                biased;
                maybe_event = self.rx.recv() => match maybe_event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::info!("All scheduler handles dropped; stopping loop");
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep_expired_windows().await,
                _ = tokio::time::sleep(sleep_duration) => match self.pop_due() {
                    Some(timer) => self.fire(timer.schedule_id, timer.fire_at).await,
                    None => Ok(()),
                },
            };

            if let Err(e) = step {
                tracing::error!(error = %e, "Scheduler halting on persistent store failure");
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: SchedulerEvent) -> Result<()> {
        match event {
            SchedulerEvent::ScheduleCreated(id)
            | SchedulerEvent::ScheduleUpdated(id)
            | SchedulerEvent::ScheduleResumed(id) => {
                self.disarm(id);
                match self.fetch_schedule(id).await? {
                    Some(schedule) if schedule.status == ScheduleStatus::Active => {
                        self.arm(schedule).await
                    }
                    _ => Ok(()),
                }
            }
            SchedulerEvent::SchedulePaused(id) | SchedulerEvent::ScheduleDeleted(id) => {
                self.disarm(id);
                Ok(())
            }
            SchedulerEvent::TargetDeleted(target_id) => {
                let store = self.store.clone();
                let schedules = with_store_retry("list schedules for target", || {
                    let store = store.clone();
                    async move { store.list_schedules_for_target(target_id).await }
                })
                .await?;
                for schedule in schedules {
                    self.disarm(schedule.id);
                }
                Ok(())
            }
        }
    }

    /// Arm a schedule from a lifecycle event or recovery. A never-fired
    /// interval schedule keeps its initial firing at `start_at` eligible as
    /// long as the misfire grace admits it; the timer then lands in the
    /// near past and fires immediately.
    async fn arm(&mut self, schedule: Schedule) -> Result<()> {
        let now = self.clock.now();
        let initial = trigger::initial_fire(&schedule)
            .filter(|&at| now.signed_duration_since(at) <= self.misfire_grace);
        match initial.or_else(|| trigger::next_fire(&schedule, now)) {
            Some(fire_at) => self.arm_at(schedule.id, fire_at).await,
            None => self.complete_schedule(schedule.id).await,
        }
    }

    /// Rearm after a firing: strictly the next instant of the rule, or
    /// completion when the window has closed.
    async fn rearm(&mut self, schedule: Schedule) -> Result<()> {
        let now = self.clock.now();
        match trigger::next_fire(&schedule, now) {
            Some(fire_at) => self.arm_at(schedule.id, fire_at).await,
            None => self.complete_schedule(schedule.id).await,
        }
    }

    /// Install a single-shot timer and persist the advisory next-run time.
    async fn arm_at(&mut self, schedule_id: Uuid, fire_at: NaiveDateTime) -> Result<()> {
        let now = self.clock.now();
        let store = self.store.clone();
        with_store_retry("set next run time", || {
            let store = store.clone();
            async move { store.set_next_run_at(schedule_id, Some(fire_at), now).await }
        })
        .await?;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.generations.insert(schedule_id, generation);
        self.timers.push(Reverse(ArmedTimer {
            fire_at,
            schedule_id,
            generation,
        }));
        tracing::info!(
            schedule_id = %schedule_id,
            fire_at = %fire_at,
            "Armed schedule"
        );
        Ok(())
    }

    fn disarm(&mut self, schedule_id: Uuid) {
        if self.generations.remove(&schedule_id).is_some() {
            tracing::debug!(schedule_id = %schedule_id, "Disarmed schedule");
        }
    }

    /// Mark a schedule completed and drop its timer. Terminal.
    async fn complete_schedule(&mut self, schedule_id: Uuid) -> Result<()> {
        self.disarm(schedule_id);
        let store = self.store.clone();
        let now = self.clock.now();
        with_store_retry("complete schedule", || {
            let store = store.clone();
            async move {
                store
                    .set_schedule_status(schedule_id, ScheduleStatus::Completed, now)
                    .await?;
                store.set_next_run_at(schedule_id, None, now).await
            }
        })
        .await?;
        tracing::info!(schedule_id = %schedule_id, "Schedule completed");
        Ok(())
    }

    /// Handle one elapsed timer.
    async fn fire(&mut self, schedule_id: Uuid, fire_at: NaiveDateTime) -> Result<()> {
        let schedule = match self.fetch_schedule(schedule_id).await? {
            Some(schedule) => schedule,
            None => {
                self.disarm(schedule_id);
                return Ok(());
            }
        };
        if schedule.status != ScheduleStatus::Active {
            return Ok(());
        }

        let now = self.clock.now();

        // Window gate: recompute validity at fire time.
        if schedule.window_closed(now) {
            return self.complete_schedule(schedule_id).await;
        }

        // Misfire policy: a firing missed beyond the grace window is dropped,
        // not reattempted; rearming from "now" coalesces any pile-up.
        if now - fire_at > self.misfire_grace {
            tracing::warn!(
                schedule_id = %schedule_id,
                fire_at = %fire_at,
                "Missed firing beyond grace period, dropping"
            );
            return self.rearm(schedule).await;
        }

        // Idempotent run creation: a key collision means another firing
        // already handled this instant.
        let scheduled_at = floor_to_second(fire_at);
        let key = run::idempotency_key(schedule_id, scheduled_at);
        let new_run = NewRun {
            schedule_id,
            target_id: schedule.target_id,
            scheduled_at,
            idempotency_key: key.clone(),
        };
        let store = self.store.clone();
        let created = match with_store_retry("create run", || {
            let store = store.clone();
            let new_run = new_run.clone();
            async move { store.create_run(new_run, now).await }
        })
        .await
        {
            Ok(run) => Some(run),
            Err(e) if e.is_duplicate_key() => {
                tracing::debug!(schedule_id = %schedule_id, key = %key, "Duplicate firing absorbed");
                None
            }
            // Schedule row vanished under the insert's foreign key.
            Err(crate::error::AppError::NotFound(_)) => {
                self.disarm(schedule_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Bump the tally, then rearm from the updated row.
        let schedule = if created.is_some() {
            let store = self.store.clone();
            let result = with_store_retry("record schedule fire", || {
                let store = store.clone();
                async move { store.record_schedule_fire(schedule_id, now).await }
            })
            .await;
            match result {
                Ok(schedule) => schedule,
                // Deleted while firing: drop the timer and move on.
                Err(crate::error::AppError::NotFound(_)) => {
                    self.disarm(schedule_id);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        } else {
            schedule
        };
        self.rearm(schedule.clone()).await?;

        let Some(created) = created else {
            return Ok(());
        };

        // Concurrency gate: at most one run in flight per schedule. The
        // skipped run row stays as evidence of the fire, resolved as failed
        // so it does not count against future firings.
        let store = self.store.clone();
        let in_flight = with_store_retry("count in-flight runs", || {
            let store = store.clone();
            async move { store.count_in_flight_runs(schedule_id).await }
        })
        .await?;
        if in_flight > 1 {
            tracing::warn!(
                schedule_id = %schedule_id,
                run_id = %created.id,
                "Previous run still in flight, skipping dispatch"
            );
            let completion = RunCompletion {
                status: RunStatus::Failed,
                completed_at: self.clock.now(),
                attempt_count: 0,
                final_status_code: None,
                final_error: Some(SKIPPED_RUN_ERROR.to_string()),
            };
            if let Err(e) = self.store.finish_run(created.id, completion).await {
                tracing::warn!(run_id = %created.id, error = %e, "Failed to resolve skipped run");
            }
            return Ok(());
        }

        // Hand the run to the executor pool.
        let target = match self.store.get_target(schedule.target_id).await {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(
                    schedule_id = %schedule_id,
                    run_id = %created.id,
                    error = %e,
                    "Target unavailable at dispatch"
                );
                let completion = RunCompletion {
                    status: RunStatus::Failed,
                    completed_at: self.clock.now(),
                    attempt_count: 0,
                    final_status_code: None,
                    final_error: Some("target unavailable at dispatch".to_string()),
                };
                if let Err(e) = self.store.finish_run(created.id, completion).await {
                    tracing::warn!(run_id = %created.id, error = %e, "Failed to resolve undispatchable run");
                }
                return Ok(());
            }
        };

        let permits = self.permits.clone();
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            executor.execute_run(&created, &target).await;
        });

        Ok(())
    }

    /// Complete active schedules whose duration window elapsed while no
    /// timer was due (e.g. the window ends between firings).
    async fn sweep_expired_windows(&mut self) -> Result<()> {
        let store = self.store.clone();
        let schedules = with_store_retry("list active schedules", || {
            let store = store.clone();
            async move { store.list_active_schedules().await }
        })
        .await?;

        let now = self.clock.now();
        for schedule in schedules {
            if schedule.window_closed(now) {
                self.complete_schedule(schedule.id).await?;
            }
        }
        Ok(())
    }

    async fn fetch_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let store = self.store.clone();
        let result = with_store_retry("get schedule", || {
            let store = store.clone();
            async move { store.get_schedule(id).await }
        })
        .await;
        match result {
            Ok(schedule) => Ok(Some(schedule)),
            Err(crate::error::AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Next valid timer without popping it. Stale entries are discarded.
    fn peek_next(&mut self) -> Option<ArmedTimer> {
        while let Some(Reverse(timer)) = self.timers.peek() {
            if self.generations.get(&timer.schedule_id) == Some(&timer.generation) {
                return Some(timer.clone());
            }
            self.timers.pop();
        }
        None
    }

    /// Pop the next timer if it is due.
    fn pop_due(&mut self) -> Option<ArmedTimer> {
        let now = self.clock.now();
        let timer = self.peek_next()?;
        if timer.fire_at <= now {
            self.timers.pop();
            Some(timer)
        } else {
            None
        }
    }

    fn duration_until(&self, fire_at: NaiveDateTime) -> Duration {
        let millis = (fire_at - self.clock.now()).num_milliseconds();
        if millis <= 0 {
            Duration::ZERO
        } else {
            // +1ms so the wakeup lands past the instant instead of spinning.
            Duration::from_millis(millis as u64 + 1)
        }
    }
}

/// Retry a store operation with a short bounded backoff. Duplicate-key
/// conflicts are domain signals, not infrastructure failures, and pass
/// through untouched.
async fn with_store_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(STORE_RETRY_BASE_MS);
    let mut tries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_duplicate_key() => return Err(e),
            Err(crate::error::AppError::NotFound(msg)) => {
                return Err(crate::error::AppError::NotFound(msg))
            }
            Err(e) => {
                tries += 1;
                if tries >= STORE_RETRY_TRIES {
                    return Err(e);
                }
                tracing::warn!(error = %e, what, "Store operation failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, s)
            .unwrap()
    }

    #[test]
    fn test_armed_timer_ordering_is_earliest_first() {
        let a = ArmedTimer {
            fire_at: at(10),
            schedule_id: Uuid::nil(),
            generation: 0,
        };
        let b = ArmedTimer {
            fire_at: at(20),
            schedule_id: Uuid::nil(),
            generation: 1,
        };
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(b));
        heap.push(Reverse(a.clone()));
        assert_eq!(heap.pop().unwrap().0, a);
    }
}
