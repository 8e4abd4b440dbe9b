//! Scheduler integration tests: firing cadence, window closure, pause and
//! resume, cascade disarm, single-inflight, and restart recovery, driven
//! against the in-memory store and a local mock target.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use uuid::Uuid;

use api_scheduler::models::{run, RunStatus, Schedule, ScheduleStatus, ScheduleType};
use api_scheduler::services::clock::Clock;
use api_scheduler::services::executor::HttpExecutor;
use api_scheduler::services::recovery::{self, ORPHANED_RUN_ERROR};
use api_scheduler::services::scheduler::{Scheduler, SchedulerHandle, SKIPPED_RUN_ERROR};
use api_scheduler::store::{NewRun, NewSchedule, RunFilter, Store};

struct Harness {
    store: Arc<dyn Store>,
    clock: Clock,
    handle: SchedulerHandle,
}

/// Spawn a scheduler loop over the given store.
fn start_scheduler(store: Arc<dyn Store>) -> Harness {
    let clock = common::test_clock();
    let config = common::test_config();
    let executor = Arc::new(
        HttpExecutor::new(store.clone(), clock.clone(), &config).expect("Failed to build executor"),
    );
    let (scheduler, handle) = Scheduler::new(store.clone(), executor, clock.clone(), &config);
    tokio::spawn(scheduler.run());
    Harness {
        store,
        clock,
        handle,
    }
}

async fn create_interval_schedule(
    harness: &Harness,
    target_id: Uuid,
    start_at: NaiveDateTime,
    interval_seconds: i32,
    duration_seconds: Option<i32>,
    max_runs: Option<i32>,
) -> Schedule {
    let schedule = harness
        .store
        .create_schedule(
            NewSchedule {
                name: "test schedule".into(),
                target_id,
                schedule_type: ScheduleType::Interval,
                interval_seconds: Some(interval_seconds),
                cron_expression: None,
                start_at,
                duration_seconds,
                max_runs,
            },
            harness.clock.now(),
        )
        .await
        .expect("Failed to create schedule");
    harness.handle.schedule_created(schedule.id).await;
    schedule
}

async fn runs_for(harness: &Harness, schedule_id: Uuid) -> Vec<api_scheduler::models::Run> {
    harness
        .store
        .list_runs(&RunFilter {
            schedule_id: Some(schedule_id),
            ..RunFilter::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_max_runs_window_fires_exactly_n_then_completes() {
    let harness = start_scheduler(common::memory_store());
    let mock = common::spawn_mock_target(vec![200], 2).await;
    let target = common::create_target(&harness.store, &harness.clock, &mock.url).await;

    let schedule = create_interval_schedule(
        &harness,
        target.id,
        harness.clock.now(),
        1,
        None,
        Some(2),
    )
    .await;

    // First firing lands at start_at, the second one second later.
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let runs = runs_for(&harness, schedule.id).await;
    assert_eq!(runs.len(), 2, "max_runs=2 must produce exactly 2 runs");
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));

    // Idempotency keys are unique across the runs.
    let keys: HashSet<&str> = runs.iter().map(|r| r.idempotency_key.as_str()).collect();
    assert_eq!(keys.len(), runs.len());

    let schedule = harness.store.get_schedule(schedule.id).await.unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Completed);
    assert_eq!(schedule.runs_count, 2);
    assert!(schedule.next_run_at.is_none());
}

#[tokio::test]
async fn test_duration_window_bounds_scheduled_instants() {
    let harness = start_scheduler(common::memory_store());
    let mock = common::spawn_mock_target(vec![200], 2).await;
    let target = common::create_target(&harness.store, &harness.clock, &mock.url).await;

    let start_at = harness.clock.now();
    let schedule =
        create_interval_schedule(&harness, target.id, start_at, 1, Some(2), None).await;

    tokio::time::sleep(Duration::from_millis(4000)).await;

    let runs = runs_for(&harness, schedule.id).await;
    assert!(!runs.is_empty());
    let window_end = start_at + chrono::Duration::seconds(2);
    for run in &runs {
        assert!(
            run.scheduled_at <= window_end,
            "run scheduled at {} is past the window end {}",
            run.scheduled_at,
            window_end
        );
    }

    let schedule = harness.store.get_schedule(schedule.id).await.unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Completed);
}

#[tokio::test]
async fn test_pause_stops_firings_and_resume_rearms() {
    let harness = start_scheduler(common::memory_store());
    let mock = common::spawn_mock_target(vec![200], 2).await;
    let target = common::create_target(&harness.store, &harness.clock, &mock.url).await;

    let schedule =
        create_interval_schedule(&harness, target.id, harness.clock.now(), 1, None, None).await;

    tokio::time::sleep(Duration::from_millis(1600)).await;

    harness
        .store
        .set_schedule_status(schedule.id, ScheduleStatus::Paused, harness.clock.now())
        .await
        .unwrap();
    harness.handle.schedule_paused(schedule.id).await;
    // Give an already-due timer a moment to drain.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let paused_at_count = runs_for(&harness, schedule.id).await.len();
    assert!(paused_at_count >= 1);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(
        runs_for(&harness, schedule.id).await.len(),
        paused_at_count,
        "no runs may be created while paused"
    );

    harness
        .store
        .set_schedule_status(schedule.id, ScheduleStatus::Active, harness.clock.now())
        .await
        .unwrap();
    harness.handle.schedule_resumed(schedule.id).await;
    tokio::time::sleep(Duration::from_millis(1600)).await;

    assert!(
        runs_for(&harness, schedule.id).await.len() > paused_at_count,
        "resume must rearm future firings"
    );

    // Stop firing before the harness drops.
    harness.handle.schedule_paused(schedule.id).await;
}

#[tokio::test]
async fn test_deleted_target_schedule_never_fires() {
    let harness = start_scheduler(common::memory_store());
    let mock = common::spawn_mock_target(vec![200], 2).await;
    let target = common::create_target(&harness.store, &harness.clock, &mock.url).await;

    // First firing is two seconds out; the delete lands before it.
    let start_at = harness.clock.now() + chrono::Duration::seconds(2);
    create_interval_schedule(&harness, target.id, start_at, 1, None, None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    harness.handle.target_deleted(target.id).await;
    harness.store.delete_target(target.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(mock.hits(), 0, "a deleted target must never be called");
}

#[tokio::test]
async fn test_recovery_fails_orphans_and_rearms() {
    // Durable state left behind by a "crashed" process: an active schedule
    // and a run stuck in running.
    let store = common::memory_store();
    let clock = common::test_clock();
    let mock = common::spawn_mock_target(vec![200], 2).await;
    let target = common::create_target(&store, &clock, &mock.url).await;

    let schedule = store
        .create_schedule(
            NewSchedule {
                name: "survivor".into(),
                target_id: target.id,
                schedule_type: ScheduleType::Interval,
                interval_seconds: Some(1),
                cron_expression: None,
                start_at: clock.now(),
                duration_seconds: None,
                max_runs: None,
            },
            clock.now(),
        )
        .await
        .unwrap();

    let orphan_scheduled_at = clock.now() - chrono::Duration::seconds(5);
    let orphan = store
        .create_run(
            NewRun {
                schedule_id: schedule.id,
                target_id: target.id,
                scheduled_at: orphan_scheduled_at,
                idempotency_key: run::idempotency_key(schedule.id, orphan_scheduled_at),
            },
            clock.now(),
        )
        .await
        .unwrap();
    store.mark_run_running(orphan.id, clock.now()).await.unwrap();

    // "Restart": fresh scheduler over the same store, then recovery.
    let harness = start_scheduler(store);
    recovery::recover(&harness.store, &harness.handle, &harness.clock)
        .await
        .unwrap();

    let orphan = harness.store.get_run(orphan.id).await.unwrap();
    assert_eq!(orphan.status, RunStatus::Failed);
    assert_eq!(orphan.final_error.as_deref(), Some(ORPHANED_RUN_ERROR));
    assert!(orphan.completed_at.is_some());

    // A fresh timer was armed: new runs appear.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let runs = runs_for(&harness, schedule.id).await;
    assert!(
        runs.len() > 1,
        "recovery must rearm the active schedule, got {} run(s)",
        runs.len()
    );

    harness.handle.schedule_paused(schedule.id).await;
}

#[tokio::test]
async fn test_single_run_in_flight_per_schedule() {
    let harness = start_scheduler(common::memory_store());
    // Target slower than the firing interval.
    let mock =
        common::spawn_mock_target_with_delay(vec![200], 2, Duration::from_millis(2500)).await;
    let target = common::create_target(&harness.store, &harness.clock, &mock.url).await;

    let schedule =
        create_interval_schedule(&harness, target.id, harness.clock.now(), 1, None, None).await;

    tokio::time::sleep(Duration::from_millis(3600)).await;
    harness.handle.schedule_paused(schedule.id).await;
    // Let the in-flight run drain.
    tokio::time::sleep(Duration::from_millis(3000)).await;

    let runs = runs_for(&harness, schedule.id).await;
    let succeeded = runs
        .iter()
        .filter(|r| r.status == RunStatus::Succeeded)
        .count();
    let skipped = runs
        .iter()
        .filter(|r| r.final_error.as_deref() == Some(SKIPPED_RUN_ERROR))
        .count();

    // With a 2.5s target and a 1s interval, overlapping firings must have
    // been absorbed as skips rather than dispatched concurrently.
    assert!(skipped >= 1, "expected skipped firings, runs: {runs:?}");
    assert!(succeeded <= 2);
    assert_eq!(
        harness
            .store
            .count_in_flight_runs(schedule.id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_window_elapsed_while_paused_completes_on_resume() {
    let harness = start_scheduler(common::memory_store());
    let mock = common::spawn_mock_target(vec![200], 2).await;
    let target = common::create_target(&harness.store, &harness.clock, &mock.url).await;

    // Starts in one second, window two seconds: pause immediately and wait
    // the window out.
    let start_at = harness.clock.now() + chrono::Duration::seconds(1);
    let schedule =
        create_interval_schedule(&harness, target.id, start_at, 1, Some(2), None).await;

    harness
        .store
        .set_schedule_status(schedule.id, ScheduleStatus::Paused, harness.clock.now())
        .await
        .unwrap();
    harness.handle.schedule_paused(schedule.id).await;

    tokio::time::sleep(Duration::from_millis(3500)).await;

    harness
        .store
        .set_schedule_status(schedule.id, ScheduleStatus::Active, harness.clock.now())
        .await
        .unwrap();
    harness.handle.schedule_resumed(schedule.id).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let schedule = harness.store.get_schedule(schedule.id).await.unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Completed);
    assert_eq!(mock.hits(), 0, "no firing may land past the window");
}
