// src/store.rs
//! Durable job storage as seen by the delivery engine.
//!
//! Every mutation after enqueue happens under a [`Lease`] and is conditional
//! on the job version recorded in it. When two workers race on the same
//! expired lease only one update lands; the other gets
//! [`DispatchrError::LeaseLost`].

use crate::{DispatchrError, Job, JobId, JobState, Lease, Result, Transition};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, time::Duration};
use tokio::sync::Mutex;

/// A job handed to a worker together with the lease that guards it
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub lease: Lease,
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a freshly created job.
    async fn enqueue(&self, job: Job) -> Result<JobId>;

    /// Read the current record of a job.
    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Atomically lease one job that is due at `now`.
    async fn lease_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<LeasedJob>>;

    /// Apply the outcome of an attempt. Fails with `LeaseLost` when the job
    /// moved on since `lease` was granted.
    async fn finish(&self, lease: &Lease, transition: &Transition, now: DateTime<Utc>)
    -> Result<()>;

    /// Return jobs whose lease ran out to the queue. Returns how many moved.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Job counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub queued: usize,
    pub running: usize,
    pub retryable: usize,
    pub completed: usize,
    pub failed: usize,
}

/// In-process store, for tests and single-process embedding
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self) -> StoreStats {
        let jobs = self.jobs.lock().await;
        let mut stats = StoreStats::default();
        for job in jobs.values() {
            match job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Retryable => stats.retryable += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(DispatchrError::Store(format!("job already exists: {}", job.id)));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn lease_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<LeasedJob>> {
        let mut jobs = self.jobs.lock().await;

        for job in jobs.values_mut().filter(|job| job.lease_expired(now)) {
            job.expire_lease(now)?;
        }

        // Oldest due job first.
        let Some(job) = jobs
            .values_mut()
            .filter(|job| job.is_eligible(now))
            .min_by_key(|job| (job.next_attempt_at, job.created_at))
        else {
            return Ok(None);
        };

        let lease = job.lease(worker_id, now, ttl)?;
        Ok(Some(LeasedJob {
            job: job.clone(),
            lease,
        }))
    }

    async fn finish(
        &self,
        lease: &Lease,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&lease.job_id)
            .ok_or(DispatchrError::JobNotFound(lease.job_id))?;

        if !job.is_held_by(lease) {
            return Err(DispatchrError::LeaseLost(lease.job_id));
        }

        job.apply(transition, now)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.lock().await;
        let mut reclaimed = 0;
        for job in jobs.values_mut().filter(|job| job.lease_expired(now)) {
            job.expire_lease(now)?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}
