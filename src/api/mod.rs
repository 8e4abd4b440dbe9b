//! API module - HTTP handlers and routes.

pub mod dto;
pub mod handlers;
pub mod openapi;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::services::clock::Clock;
use crate::services::scheduler::SchedulerHandle;
use crate::store::Store;

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub scheduler: SchedulerHandle,
    pub clock: Clock,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        scheduler: SchedulerHandle,
        clock: Clock,
    ) -> Self {
        Self {
            config,
            store,
            scheduler,
            clock,
        }
    }
}

/// Shared reference to the application state
pub type SharedState = Arc<AppState>;
