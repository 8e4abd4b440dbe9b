//! Database connection pool setup.

use crate::config::Config;
use crate::error::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Create the database connection pool.
///
/// Sized from `max_concurrent_jobs`: every dispatched executor worker writes
/// attempt and run rows, and API reads share the same pool. One connection
/// per four workers keeps a full executor pool from starving the API side.
pub async fn create_pool(config: &Config) -> Result<PgPool> {
    let max_connections = (config.max_concurrent_jobs as u32 / 4).clamp(10, 50);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(&config.database_url)
        .await?;

    Ok(pool)
}
