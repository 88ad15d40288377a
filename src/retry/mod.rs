//! Retry strategies for failed node runs.
//!
//! The strategy is selected by the shape of a node's `retryDelay` option:
//! a bare number means a fixed delay, a `{baseDelay, maxDelay}` record means
//! exponential backoff. Attempt numbering is 1-based; a node configured with
//! `max_retries = k` is attempted `k + 1` times in total.

use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default fixed delay when no `retryDelay` is configured
pub const DEFAULT_FIXED_DELAY_MS: u64 = 1000;
/// Default base delay for exponential backoff
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default cap for exponential backoff
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

fn default_base_delay() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

/// Wire shape of a node's retry delay option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryDelay {
    /// Fixed delay in milliseconds
    Fixed(u64),
    /// Exponential backoff parameters in milliseconds
    #[serde(rename_all = "camelCase")]
    Backoff {
        /// Delay before the second attempt; doubles per attempt thereafter
        #[serde(default = "default_base_delay")]
        base_delay: u64,
        /// Upper bound on the computed delay
        #[serde(default = "default_max_delay")]
        max_delay: u64,
    },
}

/// Decides whether to retry and how long to wait between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay before every retry
    Fixed {
        /// Delay between attempts
        delay: Duration,
    },
    /// `min(base_delay * 2^(attempt-1), max_delay)`
    ExponentialBackoff {
        /// Delay before the second attempt
        base_delay: Duration,
        /// Cap on the computed delay
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Select the policy for a node's configured delay shape.
    ///
    /// No configuration means a fixed 1000 ms delay.
    pub fn from_config(delay: Option<RetryDelay>) -> Self {
        match delay {
            None => RetryPolicy::Fixed {
                delay: Duration::from_millis(DEFAULT_FIXED_DELAY_MS),
            },
            Some(RetryDelay::Fixed(ms)) => RetryPolicy::Fixed {
                delay: Duration::from_millis(ms),
            },
            Some(RetryDelay::Backoff {
                base_delay,
                max_delay,
            }) => RetryPolicy::ExponentialBackoff {
                base_delay: Duration::from_millis(base_delay),
                max_delay: Duration::from_millis(max_delay),
            },
        }
    }

    /// Delay to wait after the given (1-based) attempt failed
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed { delay } => delay,
            RetryPolicy::ExponentialBackoff {
                base_delay,
                max_delay,
            } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base_delay.saturating_mul(factor).min(max_delay)
            }
        }
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32, max_retries: u32) -> bool {
        attempt <= max_retries
    }

    /// Sleep out the backoff for a failed attempt.
    ///
    /// Wakes immediately with [`FlowError::Cancelled`] if the execution's
    /// cancellation token fires, without consuming the remaining delay.
    pub async fn backoff(&self, attempt: u32, cancellation: &CancellationToken) -> FlowResult<()> {
        let delay = self.delay(attempt);
        tokio::select! {
            _ = cancellation.cancelled() => Err(FlowError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
