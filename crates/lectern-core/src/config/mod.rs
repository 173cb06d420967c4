//! Sync engine configuration.
//!
//! Batch sizes, per-call timeouts, retry/backoff behaviour and retention
//! windows used by compaction.

use std::time::Duration;

const DEFAULT_PUSH_BATCH_SIZE: usize = 50;
const DEFAULT_PULL_BATCH_SIZE: usize = 100;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for sync sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Maximum number of operation log entries claimed per push batch
    pub push_batch_size: usize,
    /// Maximum number of remote records requested per pull page
    pub pull_batch_size: usize,
    /// Upper bound for a single Remote Gateway call
    pub request_timeout: Duration,
    /// Retry/backoff behaviour for failed pushes and pulls
    pub retry: RetryPolicy,
    /// Age after which acknowledged tombstones are physically purged
    pub tombstone_retention: Duration,
    /// Age after which completed operation log entries are deleted
    pub completed_retention: Duration,
}

impl SyncConfig {
    /// Set the push batch size (minimum 1)
    #[must_use]
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Set the pull page size (minimum 1)
    #[must_use]
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Set the per-call timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the tombstone retention window
    #[must_use]
    pub const fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// Set the completed-entry retention window
    #[must_use]
    pub const fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            pull_batch_size: DEFAULT_PULL_BATCH_SIZE,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            tombstone_retention: DAY * 30,
            completed_retention: DAY * 7,
        }
    }
}

/// Exponential backoff: the base delay doubles per attempt and is capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which an operation is moved to `Failed`
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10 * 60),
        }
    }

    /// Policy that never waits between attempts (tests, manual retries)
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay to wait before retry number `attempt` (1-based; 0 means no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether `attempts` failures exhaust this policy
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}
