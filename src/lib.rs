//! API Scheduler - Backend Library
//!
//! Cron for API calls: users register HTTP targets and schedules; the
//! service fires each schedule at its computed times, performs the call
//! with bounded retries, and records a durable run/attempt audit trail.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod store;

pub use config::Config;
pub use error::{AppError, Result};
