// src/job.rs
use crate::{BackoffStrategy, DispatchResult, DispatchrError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = DispatchrError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse()
            .map(JobId)
            .map_err(|_| DispatchrError::Store(format!("invalid job id: {}", s)))
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Retryable,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Edges of the lifecycle graph. `Running -> Queued` is the lease-expiry
    /// path taken by the store when a worker disappears mid-attempt.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Retryable, Running)
                | (Running, Completed)
                | (Running, Retryable)
                | (Running, Failed)
                | (Running, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = DispatchrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "retryable" => Ok(JobState::Retryable),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(DispatchrError::Store(format!("unknown job state: {}", other))),
        }
    }
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    /// The handler answered with a status that is never retried.
    Rejected,
    /// Every allowed attempt came back retryable.
    Exhausted,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Rejected => "rejected",
            FailureReason::Exhausted => "exhausted",
        }
    }
}

impl std::str::FromStr for FailureReason {
    type Err = DispatchrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rejected" => Ok(FailureReason::Rejected),
            "exhausted" => Ok(FailureReason::Exhausted),
            other => Err(DispatchrError::Store(format!(
                "unknown failure reason: {}",
                other
            ))),
        }
    }
}

/// Exclusive, time-bounded ownership of a job by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub owner: String,
    /// Job version at lease time; updates made under this lease are
    /// conditional on it.
    pub version: u64,
    pub expires_at: DateTime<Utc>,
}

/// What an attempt's outcome does to its job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Complete,
    Retry {
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Fail {
        reason: FailureReason,
        error: String,
    },
}

impl Transition {
    pub fn target_state(&self) -> JobState {
        match self {
            Transition::Complete => JobState::Completed,
            Transition::Retry { .. } => JobState::Retryable,
            Transition::Fail { .. } => JobState::Failed,
        }
    }
}

/// `now + delay`, saturating at the latest representable instant.
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Durable record of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: String,
    pub task_name: String,
    pub payload: Vec<u8>,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub version: u64,
}

impl Job {
    pub fn new(
        target: impl Into<String>,
        task_name: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            target: target.into(),
            task_name: task_name.into(),
            payload: payload.into(),
            state: JobState::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            failure_reason: None,
            version: 0,
        }
    }

    /// Whether a worker may lease this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Queued | JobState::Retryable) && self.next_attempt_at <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Enter `Running` under a new lease. Counts the attempt.
    pub fn lease(&mut self, owner: &str, now: DateTime<Utc>, ttl: Duration) -> Result<Lease> {
        self.check_transition(JobState::Running)?;
        let expires_at = after(now, ttl);

        self.state = JobState::Running;
        self.attempts += 1;
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(expires_at);
        self.updated_at = now;
        self.version += 1;

        Ok(Lease {
            job_id: self.id,
            owner: owner.to_string(),
            version: self.version,
            expires_at,
        })
    }

    /// Return a job whose lease ran out to the queue. A job that already used
    /// its last attempt is finalized instead, so attempts never exceed the
    /// ceiling.
    pub fn expire_lease(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.attempts >= self.max_attempts {
            let transition = Transition::Fail {
                reason: FailureReason::Exhausted,
                error: "lease expired during final attempt".to_string(),
            };
            return self.apply(&transition, now);
        }

        self.check_transition(JobState::Queued)?;
        self.state = JobState::Queued;
        self.next_attempt_at = now;
        self.clear_lease();
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }

    /// Decide what `result` means for this job. Pure; the caller applies the
    /// returned transition through the store.
    pub fn resolve(
        &self,
        result: &DispatchResult,
        now: DateTime<Utc>,
        backoff: &BackoffStrategy,
    ) -> Transition {
        if result.success {
            return Transition::Complete;
        }

        if !result.should_retry {
            return Transition::Fail {
                reason: FailureReason::Rejected,
                error: result.error_message.clone(),
            };
        }

        if self.attempts >= self.max_attempts {
            return Transition::Fail {
                reason: FailureReason::Exhausted,
                error: result.error_message.clone(),
            };
        }

        let delay = backoff.next_delay(self.attempts, result.retry_after);
        Transition::Retry {
            next_attempt_at: after(now, delay),
            error: result.error_message.clone(),
        }
    }

    /// Apply a transition decided by [`Job::resolve`].
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> Result<()> {
        self.check_transition(transition.target_state())?;

        match transition {
            Transition::Complete => {
                self.state = JobState::Completed;
                self.last_error = None;
            }
            Transition::Retry {
                next_attempt_at,
                error,
            } => {
                self.state = JobState::Retryable;
                self.next_attempt_at = *next_attempt_at;
                self.last_error = Some(error.clone());
            }
            Transition::Fail { reason, error } => {
                self.state = JobState::Failed;
                self.failure_reason = Some(*reason);
                self.last_error = Some(error.clone());
            }
        }

        self.clear_lease();
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }

    /// Whether `lease` still owns this job.
    pub fn is_held_by(&self, lease: &Lease) -> bool {
        self.state == JobState::Running
            && self.version == lease.version
            && self.lease_owner.as_deref() == Some(lease.owner.as_str())
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    fn check_transition(&self, next: JobState) -> Result<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(DispatchrError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, 15, 0, 0).unwrap()
    }

    fn job(max_attempts: u32) -> Job {
        Job::new(
            "http://localhost/task",
            "send_email",
            b"{}".to_vec(),
            max_attempts,
            now(),
        )
    }

    #[test]
    fn new_job_is_queued_and_eligible() {
        let job = job(3);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.next_attempt_at, now());
        assert!(job.is_eligible(now()));
    }

    #[test]
    fn lease_counts_attempt_and_bumps_version() {
        let mut job = job(3);
        let lease = job.lease("w1", now(), Duration::from_secs(60)).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(lease.version, job.version);
        assert!(job.is_held_by(&lease));
        assert!(!job.is_eligible(now()));
    }

    #[test]
    fn terminal_states_cannot_be_leased() {
        let mut job = job(3);
        job.lease("w1", now(), Duration::from_secs(60)).unwrap();
        job.apply(&Transition::Complete, now()).unwrap();
        assert!(job.state.is_terminal());
        assert!(matches!(
            job.lease("w2", now(), Duration::from_secs(60)),
            Err(DispatchrError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn retry_uses_backoff_when_server_gave_no_delay() {
        let mut job = job(3);
        job.lease("w1", now(), Duration::from_secs(60)).unwrap();
        let transition = job.resolve(
            &DispatchResult::retry("request failed with status: 503"),
            now(),
            &BackoffStrategy::default(),
        );
        assert_eq!(
            transition,
            Transition::Retry {
                next_attempt_at: now() + chrono::Duration::seconds(2),
                error: "request failed with status: 503".to_string(),
            }
        );
    }

    #[test]
    fn retry_after_dominates_backoff() {
        let mut job = job(3);
        job.lease("w1", now(), Duration::from_secs(60)).unwrap();
        let transition = job.resolve(
            &DispatchResult::rate_limited(Duration::from_secs(30)),
            now(),
            &BackoffStrategy::default(),
        );
        match transition {
            Transition::Retry {
                next_attempt_at, ..
            } => assert_eq!(next_attempt_at, now() + chrono::Duration::seconds(30)),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn permanent_failure_is_rejected() {
        let mut job = job(3);
        job.lease("w1", now(), Duration::from_secs(60)).unwrap();
        let transition = job.resolve(
            &DispatchResult::permanent("unexpected status code: 301"),
            now(),
            &BackoffStrategy::default(),
        );
        job.apply(&transition, now()).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::Rejected));
        assert_eq!(job.last_error.as_deref(), Some("unexpected status code: 301"));
    }

    #[test]
    fn retryable_outcomes_exhaust_at_max_attempts() {
        let backoff = BackoffStrategy::default();
        let mut job = job(3);
        let mut at = now();

        for attempt in 1..=3 {
            job.lease("w1", at, Duration::from_secs(60)).unwrap();
            let transition = job.resolve(
                &DispatchResult::retry("request failed with status: 500"),
                at,
                &backoff,
            );
            job.apply(&transition, at).unwrap();
            assert!(job.attempts <= job.max_attempts);
            if attempt < 3 {
                assert_eq!(job.state, JobState::Retryable);
                at = job.next_attempt_at;
            }
        }

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::Exhausted));
        assert_eq!(job.attempts, 3);
    }

    #[test]
    fn retry_then_success_completes_on_second_attempt() {
        let backoff = BackoffStrategy::default();
        let mut job = job(3);

        job.lease("w1", now(), Duration::from_secs(60)).unwrap();
        let first = job.resolve(
            &DispatchResult::retry("request failed with status: 503"),
            now(),
            &backoff,
        );
        job.apply(&first, now()).unwrap();
        assert_eq!(job.state, JobState::Retryable);
        assert!(!job.is_eligible(now()));

        let later = job.next_attempt_at;
        job.lease("w2", later, Duration::from_secs(60)).unwrap();
        let second = job.resolve(&DispatchResult::success(), later, &backoff);
        job.apply(&second, later).unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn expired_lease_requeues_or_finalizes() {
        let mut job = job(2);
        job.lease("w1", now(), Duration::from_secs(10)).unwrap();
        assert!(job.lease_expired(now() + chrono::Duration::seconds(10)));
        job.expire_lease(now()).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.lease_owner.is_none());

        job.lease("w2", now(), Duration::from_secs(10)).unwrap();
        job.expire_lease(now()).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::Exhausted));
    }

    #[test]
    fn no_transition_skips_running() {
        let mut job = job(3);
        assert!(job.apply(&Transition::Complete, now()).is_err());
        assert_eq!(job.state, JobState::Queued);
    }
}
