//! HTTP execution engine.
//!
//! Takes a fired run, performs the outbound call with bounded retries and
//! exponential backoff, classifies failures, truncates oversized response
//! bodies, and persists the attempt trail. Every terminal condition is
//! expressed as persisted run/attempt state; nothing is raised to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use reqwest::Client;

use crate::config::Config;
use crate::error::Result;
use crate::models::{ErrorClass, HttpMethod, Run, RunStatus, Target};
use crate::services::clock::Clock;
use crate::store::{NewAttempt, RunCompletion, Store};

/// Maximum response body size persisted per attempt.
pub const MAX_RESPONSE_BODY_BYTES: usize = 100 * 1024;

/// Appended to a response body that was cut at the size cap.
pub const TRUNCATION_SENTINEL: &str = "…[truncated]";

/// Ceiling on a single backoff sleep.
const MAX_BACKOFF_SECS: f64 = 30.0;

/// Outcome of a single persisted attempt, used to drive the retry decision.
struct AttemptOutcome {
    error_class: ErrorClass,
    error_message: Option<String>,
    response_status: Option<i32>,
}

/// Executes runs against their targets.
pub struct HttpExecutor {
    client: Client,
    store: Arc<dyn Store>,
    clock: Clock,
    max_retries: u32,
    base_retry_delay: f64,
}

impl HttpExecutor {
    pub fn new(store: Arc<dyn Store>, clock: Clock, config: &Config) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| {
                crate::error::AppError::Internal(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            store,
            clock,
            max_retries: config.max_retries,
            base_retry_delay: config.retry_delay_seconds,
        })
    }

    /// Execute a run to its terminal state.
    ///
    /// `max_retries` counts retries after the first try, so up to
    /// `max_retries + 1` attempts are made. 2xx/3xx ends the run as
    /// succeeded; a 4xx response or exhausted retries ends it as failed.
    pub async fn execute_run(&self, run: &Run, target: &Target) {
        if let Err(e) = self.store.mark_run_running(run.id, self.clock.now()).await {
            tracing::error!(run_id = %run.id, error = %e, "Failed to mark run running");
            return;
        }

        let total_tries = self.max_retries + 1;
        let mut attempt_count = 0i32;
        let mut succeeded = false;
        let mut last_status: Option<i32> = None;
        let mut last_error: Option<String> = None;

        for attempt_number in 1..=total_tries {
            let outcome = match self.perform_attempt(run, target, attempt_number as i32).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        run_id = %run.id,
                        attempt = attempt_number,
                        error = %e,
                        "Failed to persist attempt"
                    );
                    last_error = Some("attempt could not be recorded".to_string());
                    break;
                }
            };

            attempt_count = attempt_number as i32;
            last_status = outcome.response_status;

            if outcome.error_class == ErrorClass::None {
                succeeded = true;
                last_error = None;
                break;
            }

            last_error = outcome.error_message;

            if !outcome.error_class.is_retriable() {
                break;
            }

            if attempt_number < total_tries {
                let delay = calculate_backoff(attempt_number, self.base_retry_delay);
                tracing::info!(
                    run_id = %run.id,
                    attempt = attempt_number,
                    class = outcome.error_class.as_str(),
                    delay_secs = delay.as_secs_f64(),
                    "Attempt failed, backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }
        }

        let completion = RunCompletion {
            status: if succeeded {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            },
            completed_at: self.clock.now(),
            attempt_count,
            final_status_code: last_status,
            final_error: last_error,
        };

        if let Err(e) = self.store.finish_run(run.id, completion).await {
            tracing::error!(run_id = %run.id, error = %e, "Failed to finish run");
            return;
        }

        tracing::info!(
            run_id = %run.id,
            schedule_id = %run.schedule_id,
            succeeded,
            attempts = attempt_count,
            "Run completed"
        );
    }

    /// Materialize the request, issue it, classify the outcome, and append
    /// the attempt. Errors only when the store write fails.
    async fn perform_attempt(
        &self,
        run: &Run,
        target: &Target,
        attempt_number: i32,
    ) -> Result<AttemptOutcome> {
        let request_body = target
            .body_template
            .as_deref()
            .map(|template| render_body_template(template, self.clock.now()));

        let started_at = self.clock.now();
        let timer = Instant::now();
        let result = self.send_request(target, request_body.as_deref()).await;
        let duration_ms = timer.elapsed().as_secs_f64() * 1000.0;
        let completed_at = self.clock.now();

        let mut attempt = NewAttempt {
            run_id: run.id,
            attempt_number,
            request_url: target.url.clone(),
            request_method: target.method,
            request_headers: target.headers.clone(),
            request_body,
            started_at,
            completed_at: Some(completed_at),
            duration_ms: Some(duration_ms),
            response_status: None,
            response_headers: None,
            response_body: None,
            response_size_bytes: None,
            error_class: ErrorClass::Unknown,
            error_message: None,
        };

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                attempt.response_status = Some(i32::from(status));
                attempt.response_headers = Some(headers_to_json(response.headers()));
                attempt.error_class = classify_status(status);
                if attempt.error_class != ErrorClass::None {
                    attempt.error_message = Some(format!("HTTP {status}"));
                }

                match response.bytes().await {
                    Ok(bytes) => {
                        attempt.response_size_bytes = Some(bytes.len() as i64);
                        let body = String::from_utf8_lossy(&bytes);
                        attempt.response_body = Some(truncate_response_body(&body));
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run.id, error = %e, "Failed to read response body");
                    }
                }
            }
            Err(e) => {
                let (class, message) = classify_error(&e);
                attempt.error_class = class;
                attempt.error_message = Some(message);
            }
        }

        let outcome = AttemptOutcome {
            error_class: attempt.error_class,
            error_message: attempt.error_message.clone(),
            response_status: attempt.response_status,
        };

        self.store.append_attempt(attempt, self.clock.now()).await?;

        tracing::debug!(
            run_id = %run.id,
            attempt = attempt_number,
            class = outcome.error_class.as_str(),
            status = ?outcome.response_status,
            "Attempt recorded"
        );

        Ok(outcome)
    }

    async fn send_request(
        &self,
        target: &Target,
        body: Option<&str>,
    ) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .client
            .request(to_reqwest_method(target.method), &target.url)
            .timeout(Duration::from_secs(target.timeout_seconds.max(1) as u64));

        if let Some(headers) = target.headers.as_object() {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        if target.method.has_body() {
            if let Some(body) = body {
                request = request.body(body.to_string());
            }
        }

        request.send().await
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

fn headers_to_json(headers: &reqwest::header::HeaderMap) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

/// Classify an HTTP status code. 2xx/3xx is terminal success.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        200..=399 => ErrorClass::None,
        400..=499 => ErrorClass::Http4xx,
        500..=599 => ErrorClass::Http5xx,
        _ => ErrorClass::Unknown,
    }
}

/// Classify a transport-level failure from the client error chain.
pub fn classify_error(error: &reqwest::Error) -> (ErrorClass, String) {
    let chain = error_chain(error);
    let lower = chain.to_lowercase();

    if error.is_timeout() {
        return (ErrorClass::Timeout, format!("Request timed out: {chain}"));
    }
    if lower.contains("dns")
        || lower.contains("name or service not known")
        || lower.contains("failed to lookup address")
    {
        return (ErrorClass::Dns, format!("DNS resolution failed: {chain}"));
    }
    if lower.contains("certificate") || lower.contains("ssl") || lower.contains("tls") {
        return (ErrorClass::Ssl, format!("SSL/TLS error: {chain}"));
    }
    if error.is_connect() {
        return (ErrorClass::Connection, format!("Connection failed: {chain}"));
    }
    (ErrorClass::Unknown, format!("Unknown error: {chain}"))
}

/// Render the full source chain of an error into one message.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Cap a response body at [`MAX_RESPONSE_BODY_BYTES`], appending the
/// truncation sentinel when cut. The cut lands on a char boundary.
pub fn truncate_response_body(body: &str) -> String {
    if body.len() <= MAX_RESPONSE_BODY_BYTES {
        return body.to_string();
    }
    let mut end = MAX_RESPONSE_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &body[..end], TRUNCATION_SENTINEL)
}

/// Exponential backoff: `base · 2^(attempt-1)`, capped.
pub fn calculate_backoff(attempt_number: u32, base_delay: f64) -> Duration {
    let exponent = attempt_number.saturating_sub(1).min(16);
    let delay = (base_delay * f64::from(1u32 << exponent)).min(MAX_BACKOFF_SECS);
    Duration::from_secs_f64(delay.max(0.0))
}

/// Substitute template variables in a request body. `{{timestamp}}` is the
/// only supported variable: the current wall-clock instant in RFC 3339 form.
pub fn render_body_template(template: &str, now: NaiveDateTime) -> String {
    template.replace("{{timestamp}}", &now.format("%Y-%m-%dT%H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_classify_status_ranges() {
        assert_eq!(classify_status(200), ErrorClass::None);
        assert_eq!(classify_status(204), ErrorClass::None);
        assert_eq!(classify_status(301), ErrorClass::None);
        assert_eq!(classify_status(400), ErrorClass::Http4xx);
        assert_eq!(classify_status(404), ErrorClass::Http4xx);
        assert_eq!(classify_status(500), ErrorClass::Http5xx);
        assert_eq!(classify_status(503), ErrorClass::Http5xx);
        assert_eq!(classify_status(100), ErrorClass::Unknown);
    }

    #[test]
    fn test_truncate_short_body_untouched() {
        let body = "x".repeat(1024);
        assert_eq!(truncate_response_body(&body), body);
    }

    #[test]
    fn test_truncate_oversized_body() {
        // 200 KiB in, exactly 100 KiB plus the sentinel out.
        let body = "x".repeat(200 * 1024);
        let stored = truncate_response_body(&body);
        assert_eq!(stored.len(), MAX_RESPONSE_BODY_BYTES + TRUNCATION_SENTINEL.len());
        assert!(stored.ends_with(TRUNCATION_SENTINEL));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        // Multibyte char straddling the cap must not split.
        let mut body = "x".repeat(MAX_RESPONSE_BODY_BYTES - 1);
        body.push_str("日本語のテキスト");
        let stored = truncate_response_body(&body);
        assert!(stored.ends_with(TRUNCATION_SENTINEL));
        assert!(stored.len() <= MAX_RESPONSE_BODY_BYTES + TRUNCATION_SENTINEL.len());
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(calculate_backoff(1, 1.0), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, 1.0), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, 1.0), Duration::from_secs(4));
        assert_eq!(calculate_backoff(4, 1.0), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(calculate_backoff(10, 1.0), Duration::from_secs(30));
        assert_eq!(calculate_backoff(30, 1.0), Duration::from_secs(30));
    }

    #[test]
    fn test_render_body_template() {
        let now = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(
            render_body_template(r#"{"at": "{{timestamp}}"}"#, now),
            r#"{"at": "2024-03-01T12:00:00"}"#
        );
        assert_eq!(render_body_template("plain", now), "plain");
    }
}
