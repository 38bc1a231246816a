//! Retry strategy applied by the task manager when a job attempt faults.
//!
//! A fault is an attempt that never produced an outcome (it panicked, or the
//! worker running it went away). A workflow that returns its own error has
//! produced an outcome; that error is deposited, not retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_RETRY_DELAY_MS: u64 = 100;

const fn default_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultPolicy {
    NoRetry,
    Retry {
        max_retries: u32,
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },
    InfiniteRetry {
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self::InfiniteRetry {
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl FaultPolicy {
    /// Delay before the next attempt, or `None` if `faults` already exhausted
    /// the policy. `faults` counts faults observed so far (1 after the first).
    #[must_use]
    pub fn retry_after(self, faults: u32) -> Option<Duration> {
        match self {
            Self::NoRetry => None,
            Self::Retry {
                max_retries,
                delay_ms,
            } => (faults <= max_retries).then(|| Duration::from_millis(delay_ms)),
            Self::InfiniteRetry { delay_ms } => Some(Duration::from_millis(delay_ms)),
        }
    }
}
