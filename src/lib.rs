// src/lib.rs
//! dispatchr: durable HTTP task dispatch
//!
//! Tasks are recorded as jobs and delivered to their target with a POST.
//! Workers lease due jobs, classify each attempt from the handler's response
//! and either complete the job, schedule a retry (honouring `Retry-After`)
//! or fail it for good.
//!
//! Delivery is at-least-once: a worker that dies mid-attempt leaves the job
//! to be leased again once its lease expires, so handlers must be idempotent.

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod lua;
pub mod queue;
pub mod retry_after;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use backoff::{Backoff, BackoffStrategy};
pub use client::Client;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DispatchrConfig;
pub use context::AttemptContext;
pub use dispatcher::{DispatchResult, Dispatcher, DispatcherConfig, TASK_NAME_HEADER};
pub use error::{DispatchrError, Result};
pub use job::{FailureReason, Job, JobId, JobState, Lease, Transition};
pub use queue::{QueueOptions, QueueStats, RedisJobStore};
pub use retry_after::parse_retry_after;
pub use shutdown::{Stoppable, shutdown_handler};
pub use store::{InMemoryJobStore, JobStore, LeasedJob};
pub use worker::{WorkerConfig, WorkerPool, WorkerPoolBuilder, WorkerStats};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
