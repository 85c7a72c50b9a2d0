// src/context.rs
use crate::{Job, JobId, Lease, store::LeasedJob};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Everything one delivery attempt carries with it
pub struct AttemptContext {
    pub job: Job,
    pub lease: Lease,
    /// Cancelled when the pool force-stops; aborts the in-flight request.
    pub cancel: CancellationToken,
    pub span: Span,
    pub started_at: Instant,
}

impl AttemptContext {
    pub fn new(leased: LeasedJob, worker_id: &str, cancel: CancellationToken) -> Self {
        let LeasedJob { job, lease } = leased;
        let span = tracing::info_span!(
            "dispatch_attempt",
            job_id = %job.id,
            task_name = %job.task_name,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            worker = %worker_id,
        );

        Self {
            job,
            lease,
            cancel,
            span,
            started_at: Instant::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }
}
