// src/queue.rs
//! Redis-backed [`JobStore`].
//!
//! Layout under `key_prefix`:
//! - `job:<id>` hash with the job record
//! - `ready` sorted set of leasable jobs, scored by next attempt (ms)
//! - `running` sorted set of leased jobs, scored by lease expiry (ms)
//!
//! Lease, finish and reclaim each run as one Lua script, so they are atomic
//! with respect to every other worker sharing the same Redis.

use crate::{
    DispatchrError, FailureReason, Job, JobId, JobState, Lease, Result, Transition,
    lua::LuaScripts,
    store::{JobStore, LeasedJob},
};
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client as RedisClient, aio::MultiplexedConnection};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

/// Options for the Redis store
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub redis_url: String,
    pub key_prefix: String,
    pub redis_instance: Option<RedisClient>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "dispatchr".to_string(),
            redis_instance: None,
        }
    }
}

/// Redis-backed job store
pub struct RedisJobStore {
    connection: MultiplexedConnection,
    options: QueueOptions,
    scripts: LuaScripts,
}

impl RedisJobStore {
    pub async fn new(options: QueueOptions) -> Result<Self> {
        let client = match &options.redis_instance {
            Some(client) => client.clone(),
            None => RedisClient::open(options.redis_url.as_str())?,
        };
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            connection,
            options,
            scripts: LuaScripts::new(),
        })
    }

    /// Get queue statistics
    pub async fn get_stats(&self) -> Result<QueueStats> {
        let mut con = self.connection.clone();
        let ready: usize = con.zcard(self.ready_key()).await?;
        let running: usize = con.zcard(self.running_key()).await?;
        Ok(QueueStats { ready, running })
    }

    // Redis key helpers
    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.options.key_prefix)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}{}", self.job_key_prefix(), job_id)
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.options.key_prefix)
    }

    fn running_key(&self) -> String {
        format!("{}:running", self.options.key_prefix)
    }
}

#[async_trait::async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut con = self.connection.clone();
        let job_key = self.job_key(&job.id);

        let exists: bool = con.exists(&job_key).await?;
        if exists {
            return Err(DispatchrError::Store(format!("job already exists: {}", job.id)));
        }

        let next_attempt_at = job.next_attempt_at.timestamp_millis();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&job_key)
            .arg(job_to_fields(&job))
            .ignore()
            .zadd(self.ready_key(), job.id.to_string(), next_attempt_at)
            .ignore()
            .query_async(&mut con)
            .await?;

        debug!(job_id = %job.id, task_name = %job.task_name, "job enqueued");
        Ok(job.id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let mut con = self.connection.clone();
        let fields: HashMap<String, Vec<u8>> = con.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(fields).map(Some)
    }

    async fn lease_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<LeasedJob>> {
        self.reclaim_expired(now).await?;

        let mut con = self.connection.clone();
        let leased: Option<(String, u64)> = self
            .scripts
            .lease
            .key(self.ready_key())
            .key(self.running_key())
            .arg(self.job_key_prefix())
            .arg(now.timestamp_millis())
            .arg(worker_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut con)
            .await?;

        let Some((id, version)) = leased else {
            return Ok(None);
        };
        let job_id: JobId = id.parse()?;
        let job = self
            .get(&job_id)
            .await?
            .ok_or(DispatchrError::JobNotFound(job_id))?;

        let expires_at = job
            .lease_expires_at
            .ok_or_else(|| DispatchrError::Store(format!("job {} leased without expiry", job_id)))?;
        let lease = Lease {
            job_id,
            owner: worker_id.to_string(),
            version,
            expires_at,
        };

        Ok(Some(LeasedJob { job, lease }))
    }

    async fn finish(
        &self,
        lease: &Lease,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (next_attempt_at, error, reason) = match transition {
            Transition::Complete => (None, "", ""),
            Transition::Retry {
                next_attempt_at,
                error,
            } => (Some(next_attempt_at.timestamp_millis()), error.as_str(), ""),
            Transition::Fail { reason, error } => (None, error.as_str(), reason.as_str()),
        };

        let mut con = self.connection.clone();
        let applied: i64 = self
            .scripts
            .finish
            .key(self.job_key(&lease.job_id))
            .key(self.ready_key())
            .key(self.running_key())
            .arg(&lease.owner)
            .arg(lease.version)
            .arg(lease.job_id.to_string())
            .arg(now.timestamp_millis())
            .arg(transition.target_state().as_str())
            .arg(next_attempt_at.unwrap_or_default())
            .arg(error)
            .arg(reason)
            .invoke_async(&mut con)
            .await?;

        match applied {
            1 => Ok(()),
            0 => Err(DispatchrError::LeaseLost(lease.job_id)),
            _ => Err(DispatchrError::JobNotFound(lease.job_id)),
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut con = self.connection.clone();
        let moved: usize = self
            .scripts
            .reclaim
            .key(self.running_key())
            .key(self.ready_key())
            .arg(self.job_key_prefix())
            .arg(now.timestamp_millis())
            .invoke_async(&mut con)
            .await?;

        if moved > 0 {
            debug!(moved, "reclaimed expired leases");
        }
        Ok(moved)
    }
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub ready: usize,
    pub running: usize,
}

fn job_to_fields(job: &Job) -> Vec<(&'static str, Vec<u8>)> {
    let mut fields = vec![
        ("id", job.id.to_string().into_bytes()),
        ("target", job.target.clone().into_bytes()),
        ("task_name", job.task_name.clone().into_bytes()),
        ("payload", job.payload.clone()),
        ("state", job.state.as_str().as_bytes().to_vec()),
        ("attempts", job.attempts.to_string().into_bytes()),
        ("max_attempts", job.max_attempts.to_string().into_bytes()),
        ("next_attempt_at", millis(job.next_attempt_at)),
        ("created_at", millis(job.created_at)),
        ("updated_at", millis(job.updated_at)),
        ("version", job.version.to_string().into_bytes()),
    ];
    if let Some(owner) = &job.lease_owner {
        fields.push(("lease_owner", owner.clone().into_bytes()));
    }
    if let Some(at) = job.lease_expires_at {
        fields.push(("lease_expires_at", millis(at)));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", error.clone().into_bytes()));
    }
    if let Some(reason) = job.failure_reason {
        fields.push(("failure_reason", reason.as_str().as_bytes().to_vec()));
    }
    fields
}

fn millis(at: DateTime<Utc>) -> Vec<u8> {
    at.timestamp_millis().to_string().into_bytes()
}

fn job_from_fields(mut fields: HashMap<String, Vec<u8>>) -> Result<Job> {
    let payload = fields.remove("payload").unwrap_or_default();
    let text = |fields: &HashMap<String, Vec<u8>>, name: &str| -> Result<Option<String>> {
        fields
            .get(name)
            .map(|raw| {
                String::from_utf8(raw.clone())
                    .map_err(|_| DispatchrError::Store(format!("field {} is not UTF-8", name)))
            })
            .transpose()
    };
    let required = |name: &str| -> Result<String> {
        text(&fields, name)?.ok_or_else(|| DispatchrError::Store(format!("missing field {}", name)))
    };
    let number = |name: &str| -> Result<i64> {
        required(name)?
            .parse()
            .map_err(|_| DispatchrError::Store(format!("field {} is not a number", name)))
    };
    let timestamp = |ms: i64| -> Result<DateTime<Utc>> {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| DispatchrError::Store(format!("timestamp out of range: {}", ms)))
    };

    let lease_expires_at = match text(&fields, "lease_expires_at")? {
        Some(raw) => Some(timestamp(raw.parse().map_err(|_| {
            DispatchrError::Store("field lease_expires_at is not a number".to_string())
        })?)?),
        None => None,
    };
    let failure_reason = text(&fields, "failure_reason")?
        .map(|raw| raw.parse::<FailureReason>())
        .transpose()?;

    Ok(Job {
        id: required("id")?.parse()?,
        target: required("target")?,
        task_name: required("task_name")?,
        payload,
        state: required("state")?.parse::<JobState>()?,
        attempts: number("attempts")? as u32,
        max_attempts: number("max_attempts")? as u32,
        next_attempt_at: timestamp(number("next_attempt_at")?)?,
        created_at: timestamp(number("created_at")?)?,
        updated_at: timestamp(number("updated_at")?)?,
        lease_owner: text(&fields, "lease_owner")?,
        lease_expires_at,
        last_error: text(&fields, "last_error")?,
        failure_reason,
        version: number("version")? as u64,
    })
}
