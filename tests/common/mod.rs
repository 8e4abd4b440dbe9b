//! Common test utilities: in-memory store setup, a scripted mock target
//! server, and fixture builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::any, Router};
use chrono::{DateTime, Utc};

use api_scheduler::config::Config;
use api_scheduler::models::{run, HttpMethod, Run, Target};
use api_scheduler::services::clock::{Clock, TimeSource};
use api_scheduler::store::{MemoryStore, NewRun, NewTarget, Store};

/// Config with fast retry timing so suites stay quick.
pub fn test_config() -> Config {
    Config {
        retry_delay_seconds: 0.2,
        ..Config::default()
    }
}

pub fn test_clock() -> Clock {
    Clock::new("UTC")
}

pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

/// Manual time source for deterministic clock-dependent tests.
pub struct ManualTimeSource {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::seconds(secs);
    }
}

impl TimeSource for ManualTimeSource {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Clone)]
struct MockState {
    statuses: Arc<Mutex<VecDeque<u16>>>,
    last_status: u16,
    body_bytes: usize,
    delay: Duration,
    hits: Arc<AtomicU32>,
}

/// A local HTTP server that answers with a scripted status sequence.
pub struct MockTarget {
    pub url: String,
    hits: Arc<AtomicU32>,
}

impl MockTarget {
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Spawn a mock target. Each request consumes the next status from
/// `statuses`; once exhausted, the last one repeats. The response body is
/// `body_bytes` of ASCII filler.
pub async fn spawn_mock_target(statuses: Vec<u16>, body_bytes: usize) -> MockTarget {
    spawn_mock_target_with_delay(statuses, body_bytes, Duration::ZERO).await
}

/// Spawn a mock target that sleeps `delay` before answering.
pub async fn spawn_mock_target_with_delay(
    statuses: Vec<u16>,
    body_bytes: usize,
    delay: Duration,
) -> MockTarget {
    assert!(!statuses.is_empty(), "mock target needs at least one status");
    let hits = Arc::new(AtomicU32::new(0));
    let state = MockState {
        last_status: *statuses.last().unwrap(),
        statuses: Arc::new(Mutex::new(statuses.into())),
        body_bytes,
        delay,
        hits: hits.clone(),
    };

    async fn handler(State(state): State<MockState>) -> (StatusCode, String) {
        state.hits.fetch_add(1, Ordering::SeqCst);
        if !state.delay.is_zero() {
            tokio::time::sleep(state.delay).await;
        }
        let status = state
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(state.last_status);
        let status = StatusCode::from_u16(status).unwrap();
        (status, "x".repeat(state.body_bytes))
    }

    let app = Router::new()
        .route("/hook", any(handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock target");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockTarget {
        url: format!("http://{addr}/hook"),
        hits,
    }
}

/// Create a POST target pointing at the given URL.
pub async fn create_target(store: &Arc<dyn Store>, clock: &Clock, url: &str) -> Target {
    create_target_with_timeout(store, clock, url, 10).await
}

pub async fn create_target_with_timeout(
    store: &Arc<dyn Store>,
    clock: &Clock,
    url: &str,
    timeout_seconds: i32,
) -> Target {
    store
        .create_target(
            NewTarget {
                name: "test target".into(),
                url: url.into(),
                method: HttpMethod::Post,
                headers: serde_json::json!({"Content-Type": "application/json"}),
                body_template: Some(r#"{"fired_at": "{{timestamp}}"}"#.into()),
                timeout_seconds,
            },
            clock.now(),
        )
        .await
        .expect("Failed to create target")
}

/// Create a pending run against the target, keyed to the current second.
pub async fn create_pending_run(store: &Arc<dyn Store>, clock: &Clock, target: &Target) -> Run {
    let schedule_id = uuid::Uuid::new_v4();
    let scheduled_at = clock.now();
    store
        .create_run(
            NewRun {
                schedule_id,
                target_id: target.id,
                scheduled_at,
                idempotency_key: run::idempotency_key(schedule_id, scheduled_at),
            },
            clock.now(),
        )
        .await
        .expect("Failed to create run")
}
