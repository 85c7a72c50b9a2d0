// src/config.rs
//! Process-level configuration.
//!
//! Every option has a default; `from_env` overrides them from `DISPATCHR_*`
//! variables.

use crate::{
    BackoffStrategy, DispatchrError, DispatcherConfig, QueueOptions, Result, WorkerConfig,
};
use std::{str::FromStr, time::Duration};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

#[derive(Debug, Clone)]
pub struct DispatchrConfig {
    pub queue: QueueOptions,
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    /// Attempts allowed per job before it is failed as exhausted
    pub max_attempts: u32,
}

impl Default for DispatchrConfig {
    fn default() -> Self {
        Self {
            queue: QueueOptions::default(),
            dispatcher: DispatcherConfig::default(),
            worker: WorkerConfig::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DispatchrConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DISPATCHR_REDIS_URL") {
            config.queue.redis_url = url;
        }
        if let Some(prefix) = lookup("DISPATCHR_KEY_PREFIX") {
            config.queue.key_prefix = prefix;
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "DISPATCHR_CONNECT_TIMEOUT_SECS")? {
            config.dispatcher.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "DISPATCHR_REQUEST_TIMEOUT_SECS")? {
            config.dispatcher.request_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parsed::<u32, _>(&lookup, "DISPATCHR_MAX_ATTEMPTS")? {
            config.max_attempts = max;
        }

        let base = parsed::<u64, _>(&lookup, "DISPATCHR_BACKOFF_BASE_SECS")?;
        let cap = parsed::<u64, _>(&lookup, "DISPATCHR_BACKOFF_CAP_SECS")?;
        if base.is_some() || cap.is_some() {
            let (default_base, default_cap) = match &config.worker.backoff {
                BackoffStrategy::Exponential { base, cap } => (*base, *cap),
                _ => (Duration::from_secs(1), Duration::from_secs(300)),
            };
            config.worker.backoff = BackoffStrategy::Exponential {
                base: base.map(Duration::from_secs).unwrap_or(default_base),
                cap: cap.map(Duration::from_secs).unwrap_or(default_cap),
            };
        }

        if let Some(concurrency) = parsed::<usize, _>(&lookup, "DISPATCHR_CONCURRENCY")? {
            config.worker.concurrency = concurrency;
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "DISPATCHR_SHUTDOWN_GRACE_SECS")? {
            config.worker.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "DISPATCHR_LEASE_TTL_SECS")? {
            config.worker.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(worker_id) = lookup("DISPATCHR_WORKER_ID") {
            config.worker.worker_id = worker_id;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DispatchrError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(DispatchrError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        // A lease shorter than a request would let a second worker pick the
        // job up while the first is still waiting on the handler.
        if self.worker.lease_ttl <= self.dispatcher.request_timeout {
            return Err(DispatchrError::Config(format!(
                "lease ttl ({:?}) must exceed request timeout ({:?})",
                self.worker.lease_ttl, self.dispatcher.request_timeout
            )));
        }
        Ok(())
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| DispatchrError::Config(format!("{} has invalid value {:?}", key, raw)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = DispatchrConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.dispatcher.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatcher.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.queue.key_prefix, "dispatchr");
    }

    #[test]
    fn overrides_from_variables() {
        let config = DispatchrConfig::from_lookup(lookup(&[
            ("DISPATCHR_REDIS_URL", "redis://cache:6379/2"),
            ("DISPATCHR_CONNECT_TIMEOUT_SECS", "2"),
            ("DISPATCHR_REQUEST_TIMEOUT_SECS", "10"),
            ("DISPATCHR_MAX_ATTEMPTS", "3"),
            ("DISPATCHR_BACKOFF_BASE_SECS", "4"),
            ("DISPATCHR_CONCURRENCY", "32"),
            ("DISPATCHR_SHUTDOWN_GRACE_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.queue.redis_url, "redis://cache:6379/2");
        assert_eq!(config.dispatcher.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.dispatcher.request_timeout, Duration::from_secs(10));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(
            config.worker.backoff,
            BackoffStrategy::Exponential {
                base: Duration::from_secs(4),
                cap: Duration::from_secs(300),
            }
        );
        assert_eq!(config.worker.concurrency, 32);
        assert_eq!(config.worker.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = DispatchrConfig::from_lookup(lookup(&[("DISPATCHR_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(matches!(err, DispatchrError::Config(_)));

        let err =
            DispatchrConfig::from_lookup(lookup(&[("DISPATCHR_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, DispatchrError::Config(_)));

        let err = DispatchrConfig::from_lookup(lookup(&[("DISPATCHR_LEASE_TTL_SECS", "30")]))
            .unwrap_err();
        assert!(matches!(err, DispatchrError::Config(_)));
    }
}
