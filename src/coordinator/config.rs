//! Coordinator Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and sizing of the recovery and dispatch loops
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Commands claimed per dispatch round and per recovery batch
    pub batch_limit: usize,
    /// Claims require the deadline to be at least this far in the future (ms)
    pub submission_lead_ms: u64,
    /// Sleep when nothing is eligible (ms)
    pub idle_sleep_ms: u64,
    /// In-flight poll period while recovering (ms)
    pub recovery_poll_ms: u64,
    /// Backoff after a store failure (ms)
    pub store_backoff_ms: u64,
    /// Ping the exchange after this long without a successful response (s)
    pub ping_threshold_secs: u64,
    /// Backoff after a failed ping (ms)
    pub ping_backoff_ms: u64,
    /// Minimum age of an Error command before it is verified again (ms)
    pub error_retry_delay_ms: u64,
    /// Statistics log period (s)
    pub stats_interval_secs: u64,
    /// Channel capacity between coordinator and pool
    pub channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            submission_lead_ms: 50,
            idle_sleep_ms: 100,
            recovery_poll_ms: 100,
            store_backoff_ms: 5_000,
            ping_threshold_secs: 30,
            ping_backoff_ms: 5_000,
            error_retry_delay_ms: 10_000,
            stats_interval_secs: 60,
            channel_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn submission_lead(&self) -> Duration {
        Duration::from_millis(self.submission_lead_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn recovery_poll(&self) -> Duration {
        Duration::from_millis(self.recovery_poll_ms)
    }

    pub fn store_backoff(&self) -> Duration {
        Duration::from_millis(self.store_backoff_ms)
    }

    pub fn ping_threshold(&self) -> Duration {
        Duration::from_secs(self.ping_threshold_secs)
    }

    pub fn ping_backoff(&self) -> Duration {
        Duration::from_millis(self.ping_backoff_ms)
    }

    pub fn error_retry_delay(&self) -> Duration {
        Duration::from_millis(self.error_retry_delay_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    /// Problems that would stall or overrun the loops for a pool of
    /// `capacity` workers.
    pub fn validate(&self, capacity: usize) -> Vec<String> {
        let mut errors = Vec::new();
        if self.batch_limit == 0 {
            errors.push("coordinator.batch_limit must be > 0".to_string());
        }
        if self.batch_limit > capacity {
            errors.push(format!(
                "coordinator.batch_limit ({}) must not exceed connector.pool_size ({})",
                self.batch_limit, capacity
            ));
        }
        if self.idle_sleep_ms == 0 {
            errors.push("coordinator.idle_sleep_ms must be > 0".to_string());
        }
        if self.recovery_poll_ms == 0 {
            errors.push("coordinator.recovery_poll_ms must be > 0".to_string());
        }
        if self.channel_capacity == 0 {
            errors.push("coordinator.channel_capacity must be > 0".to_string());
        }
        errors
    }
}
