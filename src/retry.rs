//! Bounded exponential backoff for calls to managed services.
//!
//! Only errors for which [`PipelineError::is_retryable`] is true are
//! retried; everything else is returned immediately. Delays double from
//! `base_delay` and are capped at `max_delay`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};

/// Largest shift applied to the base delay.
const MAX_BACKOFF_SHIFT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let base_delay = Duration::from_millis(config.initial_backoff_ms);
        Self {
            max_attempts: config.max_retries + 1,
            base_delay,
            max_delay: base_delay * (1 << MAX_BACKOFF_SHIFT),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): 1x, 2x, 4x, ... the base.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        (self.base_delay * (1 << shift)).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails terminally, or the attempts run out.
///
/// `what` names the call in log lines.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    call = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
