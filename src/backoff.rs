// src/backoff.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delay before a job is retried when the handler gave no `Retry-After`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Fixed { delay: Duration },
    /// `base * 2^attempts`, capped
    Exponential { base: Duration, cap: Duration },
    Linear { increment: Duration, cap: Duration },
}

impl BackoffStrategy {
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Exponential { base, cap } => {
                let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(*cap)
            }
            BackoffStrategy::Linear { increment, cap } => {
                increment.saturating_mul(attempts).min(*cap)
            }
        }
    }

    /// Delay before the next attempt. A positive server-directed delay is used
    /// verbatim; otherwise the strategy decides.
    pub fn next_delay(&self, attempts: u32, retry_after: Duration) -> Duration {
        if retry_after > Duration::ZERO {
            retry_after
        } else {
            self.calculate_delay(attempts)
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

/// Convenience type alias
pub type Backoff = BackoffStrategy;
