// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchrError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Job not found: {0}")]
    JobNotFound(crate::JobId),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid task name: {0}")]
    InvalidTaskName(String),

    /// Another worker advanced the job since this lease was granted.
    #[error("Lease lost for job {0}")]
    LeaseLost(crate::JobId),

    #[error("Invalid transition for job {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: crate::JobId,
        from: crate::JobState,
        to: crate::JobState,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl DispatchrError {
    /// Contention errors are expected under concurrent leasing and never fatal.
    /// A record deleted by retention while its attempt was in flight counts too.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            DispatchrError::LeaseLost(_) | DispatchrError::JobNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchrError>;
