//! Store contract tests: idempotency-key uniqueness, legal run status
//! transitions, recovery bulk-fail, and cascading deletes.

mod common;

use api_scheduler::error::AppError;
use api_scheduler::models::{run, RunStatus, ScheduleType};
use api_scheduler::services::recovery::ORPHANED_RUN_ERROR;
use api_scheduler::store::{NewRun, NewSchedule, RunCompletion, RunFilter};

#[tokio::test]
async fn test_duplicate_idempotency_key_conflicts() {
    let store = common::memory_store();
    let clock = common::test_clock();
    let mock_url = "https://example.com/hook";
    let target = common::create_target(&store, &clock, mock_url).await;

    let schedule_id = uuid::Uuid::new_v4();
    let scheduled_at = clock.now();
    let new_run = NewRun {
        schedule_id,
        target_id: target.id,
        scheduled_at,
        idempotency_key: run::idempotency_key(schedule_id, scheduled_at),
    };

    store.create_run(new_run.clone(), clock.now()).await.unwrap();
    let duplicate = store.create_run(new_run, clock.now()).await;
    assert!(matches!(duplicate, Err(AppError::Conflict(_))));

    // Exactly one run exists for the firing instant.
    let filter = RunFilter {
        schedule_id: Some(schedule_id),
        ..RunFilter::default()
    };
    assert_eq!(store.count_runs(&filter).await.unwrap(), 1);
}

#[tokio::test]
async fn test_run_status_transitions_are_one_way() {
    let store = common::memory_store();
    let clock = common::test_clock();
    let target = common::create_target(&store, &clock, "https://example.com/hook").await;
    let run = common::create_pending_run(&store, &clock, &target).await;

    store.mark_run_running(run.id, clock.now()).await.unwrap();
    // pending → running only once.
    assert!(store.mark_run_running(run.id, clock.now()).await.is_err());

    let completion = RunCompletion {
        status: RunStatus::Succeeded,
        completed_at: clock.now(),
        attempt_count: 1,
        final_status_code: Some(200),
        final_error: None,
    };
    store.finish_run(run.id, completion.clone()).await.unwrap();

    // Terminal statuses are immutable.
    assert!(store.finish_run(run.id, completion).await.is_err());
    assert!(store.mark_run_running(run.id, clock.now()).await.is_err());

    let run = store.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_bulk_fail_in_flight_is_idempotent() {
    let store = common::memory_store();
    let clock = common::test_clock();
    let target = common::create_target(&store, &clock, "https://example.com/hook").await;

    let pending = common::create_pending_run(&store, &clock, &target).await;
    let running = common::create_pending_run(&store, &clock, &target).await;
    store.mark_run_running(running.id, clock.now()).await.unwrap();

    let failed = store
        .bulk_fail_in_flight(clock.now(), ORPHANED_RUN_ERROR)
        .await
        .unwrap();
    assert_eq!(failed, 2);

    for id in [pending.id, running.id] {
        let run = store.get_run(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.final_error.as_deref(), Some(ORPHANED_RUN_ERROR));
        assert!(run.completed_at.is_some());
    }

    // Second pass changes nothing.
    let failed_again = store
        .bulk_fail_in_flight(clock.now(), ORPHANED_RUN_ERROR)
        .await
        .unwrap();
    assert_eq!(failed_again, 0);
}

#[tokio::test]
async fn test_target_delete_cascades() {
    let store = common::memory_store();
    let clock = common::test_clock();
    let target = common::create_target(&store, &clock, "https://example.com/hook").await;

    let schedule = store
        .create_schedule(
            NewSchedule {
                name: "poll".into(),
                target_id: target.id,
                schedule_type: ScheduleType::Interval,
                interval_seconds: Some(10),
                cron_expression: None,
                start_at: clock.now(),
                duration_seconds: None,
                max_runs: None,
            },
            clock.now(),
        )
        .await
        .unwrap();

    let scheduled_at = clock.now();
    let run = store
        .create_run(
            NewRun {
                schedule_id: schedule.id,
                target_id: target.id,
                scheduled_at,
                idempotency_key: run::idempotency_key(schedule.id, scheduled_at),
            },
            clock.now(),
        )
        .await
        .unwrap();

    store.delete_target(target.id).await.unwrap();

    assert!(store.get_target(target.id).await.is_err());
    assert!(store.get_schedule(schedule.id).await.is_err());
    assert!(store.get_run(run.id).await.is_err());
    assert!(store.list_attempts(run.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_filters() {
    let store = common::memory_store();
    let clock = common::test_clock();
    let target = common::create_target(&store, &clock, "https://example.com/hook").await;

    let first = common::create_pending_run(&store, &clock, &target).await;
    let second = common::create_pending_run(&store, &clock, &target).await;
    store
        .finish_run(
            second.id,
            RunCompletion {
                status: RunStatus::Failed,
                completed_at: clock.now(),
                attempt_count: 1,
                final_status_code: Some(500),
                final_error: Some("HTTP 500".into()),
            },
        )
        .await
        .unwrap();

    let failed = store
        .list_runs(&RunFilter {
            status: Some(RunStatus::Failed),
            ..RunFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, second.id);

    let by_schedule = store
        .list_runs(&RunFilter {
            schedule_id: Some(first.schedule_id),
            ..RunFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_schedule.len(), 1);
    assert_eq!(by_schedule[0].id, first.id);
}
