//! Reconciler timing configuration
//!
//! Defaults match the timings the machine lifecycle is designed around:
//! workers poll the control plane for up to twenty minutes and a background
//! operation gets thirty minutes before the machine is marked failed.

use std::time::Duration;

/// Bounded fixed-interval polling budget
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Maximum number of attempts
    pub attempts: u32,
    /// Sleep between attempts
    pub interval: Duration,
}

impl PollConfig {
    /// Create a polling budget
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Timing knobs for the machine reconciler
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Upper bound on a single background operation
    pub operation_timeout: Duration,
    /// Worker polling the control plane for a join token
    pub join_token_poll: PollConfig,
    /// Worker polling the control plane until it finished its upgrade
    pub upgrade_poll: PollConfig,
    /// Requeue delay while a dependency is not ready
    pub dependency_requeue: Duration,
    /// First requeue delay after a retryable error
    pub error_backoff_initial: Duration,
    /// Cap on the requeue delay after repeated retryable errors
    pub error_backoff_max: Duration,
    /// Minimum age of a failed machine's last status write before its
    /// teardown is relaunched
    pub delete_retry_backoff: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30 * 60),
            join_token_poll: PollConfig::new(120, Duration::from_secs(10)),
            upgrade_poll: PollConfig::new(120, Duration::from_secs(10)),
            dependency_requeue: Duration::from_secs(10),
            error_backoff_initial: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(300),
            delete_retry_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconcilerConfig {
    /// Override the background operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Override both control-plane polling budgets
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.join_token_poll = poll;
        self.upgrade_poll = poll;
        self
    }

    /// Requeue delay for the `failures`-th consecutive retryable error
    ///
    /// Doubles from `error_backoff_initial` and saturates at
    /// `error_backoff_max`.
    pub fn error_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.error_backoff_initial
            .saturating_mul(1u32 << exponent)
            .min(self.error_backoff_max)
    }
}
