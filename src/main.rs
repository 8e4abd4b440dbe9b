//! API Scheduler - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_scheduler::services::clock::Clock;
use api_scheduler::services::executor::HttpExecutor;
use api_scheduler::services::recovery;
use api_scheduler::services::scheduler::Scheduler;
use api_scheduler::store::{MemoryStore, PgStore, Store};
use api_scheduler::{api, config::Config, db, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("api_scheduler={},tower_http=info", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting API Scheduler");

    // Single timebase for every wall-clock read in the core.
    let clock = Clock::new(&config.timezone);

    // Connect the store backend
    let store: Arc<dyn Store> = if config.database_url.starts_with("memory://") {
        tracing::warn!("Using in-memory store; state will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let db_pool = db::create_pool(&config).await?;
        tracing::info!("Connected to database");

        sqlx::migrate!("./migrations").run(&db_pool).await?;
        tracing::info!("Database migrations complete");

        Arc::new(PgStore::new(db_pool))
    };

    // Executor pool and scheduler loop
    let executor = Arc::new(HttpExecutor::new(store.clone(), clock.clone(), &config)?);
    let (scheduler, scheduler_handle) =
        Scheduler::new(store.clone(), executor, clock.clone(), &config);
    tokio::spawn(scheduler.run());

    // Reconcile durable state before accepting API traffic.
    recovery::recover(&store, &scheduler_handle, &clock).await?;

    // Create application state and router
    let state = Arc::new(api::AppState::new(
        config.clone(),
        store,
        scheduler_handle,
        clock,
    ));
    let app = api::routes::create_router(state);

    // Start server
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown signal received");
    }
}
