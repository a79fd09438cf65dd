// ── Runtime sync configuration ──
//
// Tuning for the dispatcher and reconciler. Built by the host (usually via
// `latchsync-config`) and handed in; the core never reads config files.

use std::time::Duration;

/// Retry policy for transient effect failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total effect invocations allowed per operation, first try included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Whether another invocation is allowed after `attempts_made` failures.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Backoff before the retry following the `attempts_made`-th failure.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        crate::backoff::exponential_delay(
            self.initial_delay,
            self.max_delay,
            attempts_made.saturating_sub(1),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Configuration for one sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on a single effect invocation; exceeding it is a transient failure.
    pub effect_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
    /// Persist reconciled snapshots so the last-known state survives restarts.
    pub persist_snapshots: bool,
    /// Capacity of the dispatch event broadcast channel.
    pub event_channel_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            effect_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            persist_snapshots: true,
            event_channel_size: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_counts_the_first_try() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn first_retry_waits_roughly_the_initial_delay() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(1);
        assert!(delay >= Duration::from_millis(375));
        assert!(delay <= Duration::from_millis(625));
    }
}
