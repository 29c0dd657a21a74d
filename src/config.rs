//! Coordination configuration, loaded by the surrounding service from its
//! `[coordination]` config section.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the publisher, worker harness, and aggregator.
///
/// Every field is defaulted so an empty section deserializes to a working
/// local setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// Default wait for a full response set before returning partial results.
    #[serde(default = "default_aggregation_timeout_secs")]
    pub aggregation_timeout_secs: u64,
    /// How long a response with no registered waiter is buffered before it
    /// is dropped.
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,
    /// Retention for resolved entries whose waiter never consumed them, and
    /// for abandoned (cancelled) waits past their deadline.
    #[serde(default = "default_max_retention_secs")]
    pub max_retention_secs: u64,
    /// Cadence of the aggregator's background eviction sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Cap on distinct correlation ids held in the early-arrival buffer.
    #[serde(default = "default_early_buffer_capacity")]
    pub early_buffer_capacity: usize,
    /// Specialist invocations one worker runs concurrently. Backpressure:
    /// further deliveries queue at the broker while all permits are held.
    #[serde(default = "default_max_concurrent_invocations")]
    pub max_concurrent_invocations: usize,
    /// Redelivery window: an unacked delivery is considered lost and retried
    /// after this long.
    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u64,
    /// Delivery attempts per message before it is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_aggregation_timeout_secs() -> u64 {
    10
}

fn default_grace_window_secs() -> u64 {
    5
}

fn default_max_retention_secs() -> u64 {
    60
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_early_buffer_capacity() -> usize {
    256
}

fn default_max_concurrent_invocations() -> usize {
    8
}

fn default_ack_deadline_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            aggregation_timeout_secs: default_aggregation_timeout_secs(),
            grace_window_secs: default_grace_window_secs(),
            max_retention_secs: default_max_retention_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            early_buffer_capacity: default_early_buffer_capacity(),
            max_concurrent_invocations: default_max_concurrent_invocations(),
            ack_deadline_secs: default_ack_deadline_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl CoordinationConfig {
    pub fn aggregation_timeout(&self) -> Duration {
        Duration::from_secs(self.aggregation_timeout_secs)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn max_retention(&self) -> Duration {
        Duration::from_secs(self.max_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_deserializes_to_defaults() {
        let config: CoordinationConfig = serde_json::from_str("{}").expect("empty section");
        assert_eq!(config, CoordinationConfig::default());
        assert_eq!(config.aggregation_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_section_keeps_remaining_defaults() {
        let config: CoordinationConfig =
            serde_json::from_str(r#"{"aggregation_timeout_secs": 2, "max_attempts": 1}"#)
                .expect("partial section");
        assert_eq!(config.aggregation_timeout_secs, 2);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.grace_window_secs, default_grace_window_secs());
    }

    #[test]
    fn sweep_interval_never_zero() {
        let config = CoordinationConfig {
            sweep_interval_ms: 0,
            ..CoordinationConfig::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_millis(1));
    }
}
