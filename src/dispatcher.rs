// src/dispatcher.rs
//! One HTTP delivery attempt and the classification of its outcome.
//!
//! The dispatcher never retries on its own. It turns whatever happened on the
//! wire into a [`DispatchResult`] and leaves the scheduling decision to the
//! worker pool.

use crate::{Clock, DispatchrError, Result, SystemClock, retry_after::parse_retry_after};
use chrono::{DateTime, Utc};
use reqwest::{
    Url,
    header::{CONTENT_TYPE, HeaderValue, RETRY_AFTER},
    redirect,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Header carrying the task name to the handler.
pub const TASK_NAME_HEADER: &str = "X-Task-Name";

/// HTTP transport settings for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub success: bool,
    pub should_retry: bool,
    /// Zero means the server gave no delay; the default backoff applies.
    pub retry_after: Duration,
    pub error_message: String,
}

impl DispatchResult {
    pub fn success() -> Self {
        Self {
            success: true,
            should_retry: false,
            retry_after: Duration::ZERO,
            error_message: String::new(),
        }
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            success: false,
            should_retry: true,
            retry_after: Duration::ZERO,
            error_message: message.into(),
        }
    }

    pub fn rate_limited(delay: Duration) -> Self {
        Self {
            success: false,
            should_retry: true,
            retry_after: delay,
            error_message: format!("rate limited with retry after {:?}", delay),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            success: false,
            should_retry: false,
            retry_after: Duration::ZERO,
            error_message: message.into(),
        }
    }
}

/// Map a response status (and its `Retry-After` value, if any) to an outcome.
pub fn classify(status: u16, retry_after: &str, now: DateTime<Utc>) -> DispatchResult {
    match status {
        200..=299 => DispatchResult::success(),
        429 => {
            let delay = parse_retry_after(retry_after, now);
            if delay > Duration::ZERO {
                DispatchResult::rate_limited(delay)
            } else {
                DispatchResult::retry(format!("rate limited: {}", status))
            }
        }
        400..=599 => DispatchResult::retry(format!("request failed with status: {}", status)),
        _ => DispatchResult::permanent(format!("unexpected status code: {}", status)),
    }
}

/// Executes delivery attempts against task handlers
#[derive(Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        // Redirects are classified, not followed.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            http,
            clock: Arc::new(SystemClock),
            request_timeout: config.request_timeout,
        })
    }

    /// Upper bound on a single attempt, connection setup included.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Perform exactly one delivery attempt.
    ///
    /// Cancelling `cancel` aborts an in-flight request; the attempt is then
    /// reported as retryable.
    pub async fn dispatch(
        &self,
        target: &str,
        task_name: &str,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> DispatchResult {
        let request = match self.prepare_request(target, task_name, payload) {
            Ok(request) => request,
            Err(e) => return DispatchResult::retry(format!("failed to create request: {}", e)),
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return DispatchResult::retry("failed to execute request: cancelled");
            }
            result = self.http.execute(request) => match result {
                Ok(response) => response,
                Err(e) => {
                    return DispatchResult::retry(format!("failed to execute request: {}", e));
                }
            },
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        debug!(target = %target, status, retry_after, "handler responded");

        classify(status, retry_after, self.clock.now())
    }

    fn prepare_request(
        &self,
        target: &str,
        task_name: &str,
        payload: &[u8],
    ) -> Result<reqwest::Request> {
        let url = Url::parse(target).map_err(|e| DispatchrError::InvalidTarget(e.to_string()))?;
        let task_header = HeaderValue::from_str(task_name)
            .map_err(|e| DispatchrError::InvalidTaskName(e.to_string()))?;

        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(TASK_NAME_HEADER, task_header)
            .body(payload.to_vec())
            .build()?;

        Ok(request)
    }
}
