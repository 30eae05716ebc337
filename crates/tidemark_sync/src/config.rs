//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum batch size for push operations.
    pub push_batch_size: usize,
    /// Maximum page size for pull operations.
    pub pull_batch_size: usize,
    /// Retry configuration for failed pushes.
    pub retry: RetryConfig,
    /// How long an acknowledged tombstone is retained before it is
    /// physically removed.
    pub tombstone_grace: Duration,
    /// How often the background driver re-checks the queue, so
    /// entries in backoff are retried without a fresh trigger.
    pub poll_interval: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default batch sizes.
    pub fn new() -> Self {
        Self {
            push_batch_size: 100,
            pull_batch_size: 100,
            retry: RetryConfig::default(),
            tombstone_grace: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the tombstone grace period.
    pub fn with_tombstone_grace(mut self, grace: Duration) -> Self {
        self.tombstone_grace = grace;
        self
    }

    /// Sets the driver poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for push retry backoff.
///
/// A failed push is retried indefinitely while connectivity holds;
/// the delay before the next attempt is
/// `min(base_delay * 2^attempt_count, max_delay)`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay after the first failure.
    pub base_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = SyncConfig::new()
            .with_push_batch_size(25)
            .with_pull_batch_size(50)
            .with_tombstone_grace(Duration::from_secs(60));

        assert_eq!(config.push_batch_size, 25);
        assert_eq!(config.pull_batch_size, 50);
        assert_eq!(config.tombstone_grace, Duration::from_secs(60));
    }

    #[test]
    fn retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.base_delay, Duration::from_millis(500));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
    }
}
