//! Startup recovery: reconcile durable state with in-memory timers.
//!
//! Runs before the API starts serving. Orphaned runs left mid-flight by a
//! prior crash are failed conservatively, then every active schedule is
//! rearmed; schedules whose window closed in the meantime complete during
//! rearm. The whole procedure is idempotent.

use std::sync::Arc;

use crate::error::Result;
use crate::services::clock::Clock;
use crate::services::scheduler::SchedulerHandle;
use crate::store::Store;

/// Terminal error written to runs stranded by a restart.
pub const ORPHANED_RUN_ERROR: &str = "orphaned by server restart";

/// Reconcile the store with the scheduler after a restart.
pub async fn recover(
    store: &Arc<dyn Store>,
    scheduler: &SchedulerHandle,
    clock: &Clock,
) -> Result<()> {
    let orphaned = store
        .bulk_fail_in_flight(clock.now(), ORPHANED_RUN_ERROR)
        .await?;
    if orphaned > 0 {
        tracing::warn!(count = orphaned, "Marked orphaned runs as failed");
    }

    let schedules = store.list_active_schedules().await?;
    for schedule in &schedules {
        scheduler.schedule_created(schedule.id).await;
    }
    tracing::info!(count = schedules.len(), "Recovered active schedules");

    Ok(())
}
