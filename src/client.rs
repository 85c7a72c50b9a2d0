// src/client.rs
use crate::{Clock, DispatchrError, Job, JobId, JobStore, Result, SystemClock};
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Submission side of the engine: validates a task and records it as a job.
///
/// Constructed explicitly and passed to whoever submits work; there is no
/// process-wide handle.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl Client {
    pub fn new(store: Arc<dyn JobStore>, max_attempts: u32) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            max_attempts,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enqueue a task for delivery. The payload is forwarded verbatim.
    pub async fn enqueue(
        &self,
        target: &str,
        task_name: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<JobId> {
        let target = validate_target(target)?;
        validate_task_name(task_name)?;

        let job = Job::new(
            target,
            task_name,
            payload,
            self.max_attempts,
            self.clock.now(),
        );
        let job_id = self.store.enqueue(job).await?;
        info!(job_id = %job_id, task_name, "task enqueued");
        Ok(job_id)
    }

    /// Enqueue a task whose arguments are serialized to JSON first.
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        target: &str,
        task_name: &str,
        args: &T,
    ) -> Result<JobId> {
        let payload = serde_json::to_vec(args)?;
        self.enqueue(target, task_name, payload).await
    }

    /// Current record of a job, including its last error once it has failed.
    pub async fn job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.store.get(job_id).await
    }
}

/// Accept only absolute http(s) URLs with a host.
pub fn validate_target(target: &str) -> Result<String> {
    let url = Url::parse(target).map_err(|e| DispatchrError::InvalidTarget(format!("{}: {}", target, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DispatchrError::InvalidTarget(format!(
            "{}: unsupported scheme {}",
            target,
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(DispatchrError::InvalidTarget(format!("{}: missing host", target)));
    }

    Ok(url.to_string())
}

fn validate_task_name(task_name: &str) -> Result<()> {
    if task_name.trim().is_empty() {
        return Err(DispatchrError::InvalidTaskName(
            "task name must not be empty".to_string(),
        ));
    }
    // Travels as a header value.
    if task_name.chars().any(|c| c.is_control()) {
        return Err(DispatchrError::InvalidTaskName(format!(
            "{:?} contains control characters",
            task_name
        )));
    }
    Ok(())
}
