//! Attempt model: one HTTP try inside a run. Append-only.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use super::target::HttpMethod;

/// Classification of an attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "error_class", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// 2xx/3xx response; terminal success.
    None,
    Timeout,
    Dns,
    Connection,
    Ssl,
    #[sqlx(rename = "http_4xx")]
    #[serde(rename = "http_4xx")]
    Http4xx,
    #[sqlx(rename = "http_5xx")]
    #[serde(rename = "http_5xx")]
    Http5xx,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Timeout => "timeout",
            Self::Dns => "dns",
            Self::Connection => "connection",
            Self::Ssl => "ssl",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::Unknown => "unknown",
        }
    }

    /// Whether an attempt with this outcome may be retried. 4xx responses
    /// are deliberate answers from the target and are never retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout | Self::Dns | Self::Connection | Self::Ssl | Self::Http5xx => true,
            Self::Unknown => true,
            Self::None | Self::Http4xx => false,
        }
    }
}

/// Attempt entity: the exact materialized request and captured response.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct Attempt {
    pub id: Uuid,
    pub run_id: Uuid,
    /// 1-based, dense within a run.
    pub attempt_number: i32,
    pub request_url: String,
    pub request_method: HttpMethod,
    #[schema(value_type = Object)]
    pub request_headers: serde_json::Value,
    pub request_body: Option<String>,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub duration_ms: Option<f64>,
    pub response_status: Option<i32>,
    #[schema(value_type = Option<Object>)]
    pub response_headers: Option<serde_json::Value>,
    /// Truncated to 100 KiB with a sentinel suffix when exceeded.
    pub response_body: Option<String>,
    pub response_size_bytes: Option<i64>,
    pub error_class: ErrorClass,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}
