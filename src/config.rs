//! Application configuration loaded from environment variables.

use crate::error::{AppError, Result};
use std::env;

/// Read an environment variable and parse it, falling back to a default on missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL (`postgres://…` or `memory://`)
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Log level
    pub log_level: String,

    /// Fallback target timeout when a request omits one
    pub default_timeout_seconds: u32,

    /// Upper bound enforced on target create/update
    pub max_timeout_seconds: u32,

    /// Retry attempts after the first try (total tries = max_retries + 1)
    pub max_retries: u32,

    /// Base delay for exponential retry backoff
    pub retry_delay_seconds: f64,

    /// Executor worker pool size
    pub max_concurrent_jobs: usize,

    /// Window in which a missed firing still fires
    pub job_misfire_grace_seconds: u32,

    /// Zone for all wall-clock operations
    pub timezone: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            default_timeout_seconds: env_parse("DEFAULT_TIMEOUT_SECONDS", 30),
            max_timeout_seconds: env_parse("MAX_TIMEOUT_SECONDS", 120),
            max_retries: env_parse("MAX_RETRIES", 3),
            retry_delay_seconds: env_parse("RETRY_DELAY_SECONDS", 1.0),
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 100),
            job_misfire_grace_seconds: env_parse("JOB_MISFIRE_GRACE_SECONDS", 60),
            timezone: env::var("TIMEZONE").unwrap_or_else(|_| "Asia/Kolkata".into()),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "memory://".into(),
            bind_address: "0.0.0.0:8080".into(),
            log_level: "info".into(),
            default_timeout_seconds: 30,
            max_timeout_seconds: 120,
            max_retries: 3,
            retry_delay_seconds: 1.0,
            max_concurrent_jobs: 100,
            job_misfire_grace_seconds: 60,
            timezone: "Asia/Kolkata".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_default_on_missing() {
        assert_eq!(env_parse("DEFINITELY_NOT_SET_12345", 42u32), 42);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_concurrent_jobs, 100);
        assert_eq!(config.job_misfire_grace_seconds, 60);
        assert_eq!(config.timezone, "Asia/Kolkata");
    }
}
