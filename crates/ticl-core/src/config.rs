//! Client configuration
//!
//! All delays are stored as milliseconds so configurations round-trip
//! cleanly through TOML and the marshalled client state; use the
//! `Duration` accessors in code.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TiclError};

// ----------------------------------------------------------------------------
// Protocol Handler Configuration
// ----------------------------------------------------------------------------

/// Configuration for the outbound message batcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolHandlerConfig {
    /// Delay between the first batched operation and the flush to the server
    pub batching_delay_ms: u64,
}

impl Default for ProtocolHandlerConfig {
    fn default() -> Self {
        Self {
            batching_delay_ms: 500,
        }
    }
}

impl ProtocolHandlerConfig {
    pub fn batching_delay(&self) -> Duration {
        Duration::from_millis(self.batching_delay_ms)
    }

    /// Configuration for unit tests
    pub fn for_test() -> Self {
        Self {
            batching_delay_ms: 50,
        }
    }
}

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Configuration for a client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long to wait for the server before retrying a network request
    pub network_timeout_delay_ms: u64,
    /// Retry delay for a failed persistent write
    pub write_retry_delay_ms: u64,
    /// Interval between liveness heartbeats
    pub heartbeat_interval_ms: u64,
    /// Interval between unsolicited performance counter uploads
    pub perf_counter_delay_ms: u64,
    /// Cap on the exponential backoff multiplier
    pub max_exponential_backoff_factor: u32,
    /// Random perturbation applied to every delay, in percent
    pub smear_percent: u32,
    /// Minimum delay before the first heartbeat after a persistent restart
    pub initial_persistent_heartbeat_delay_ms: u64,
    /// Whether the network channel queues messages for offline clients
    pub channel_supports_offline_delivery: bool,
    /// Silence after which coming back online triggers a heartbeat
    pub offline_heartbeat_threshold_ms: u64,
    pub protocol_handler: ProtocolHandlerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network_timeout_delay_ms: 60 * 1000,
            write_retry_delay_ms: 10 * 1000,
            heartbeat_interval_ms: 20 * 60 * 1000,
            perf_counter_delay_ms: 6 * 60 * 60 * 1000,
            max_exponential_backoff_factor: 500,
            smear_percent: 20,
            initial_persistent_heartbeat_delay_ms: 2 * 1000,
            channel_supports_offline_delivery: false,
            offline_heartbeat_threshold_ms: 60 * 1000,
            protocol_handler: ProtocolHandlerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Configuration with short delays for unit tests
    pub fn for_test() -> Self {
        Self {
            network_timeout_delay_ms: 2 * 1000,
            heartbeat_interval_ms: 5 * 1000,
            write_retry_delay_ms: 500,
            protocol_handler: ProtocolHandlerConfig::for_test(),
            ..Self::default()
        }
    }

    /// Reject configurations the scheduler cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.smear_percent > 100 {
            return Err(TiclError::config_error(format!(
                "smear_percent must be at most 100, got {}",
                self.smear_percent
            )));
        }
        if self.max_exponential_backoff_factor == 0 {
            return Err(TiclError::config_error(
                "max_exponential_backoff_factor must be positive",
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(TiclError::config_error(
                "heartbeat_interval_ms must be positive",
            ));
        }
        Ok(())
    }

    pub fn network_timeout_delay(&self) -> Duration {
        Duration::from_millis(self.network_timeout_delay_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn perf_counter_delay(&self) -> Duration {
        Duration::from_millis(self.perf_counter_delay_ms)
    }

    pub fn initial_persistent_heartbeat_delay(&self) -> Duration {
        Duration::from_millis(self.initial_persistent_heartbeat_delay_ms)
    }

    pub fn offline_heartbeat_threshold(&self) -> Duration {
        Duration::from_millis(self.offline_heartbeat_threshold_ms)
    }

    /// Performance counters reported to the server alongside the statistics
    pub fn as_counters(&self) -> Vec<(String, u64)> {
        vec![
            ("network_timeout_delay_ms".into(), self.network_timeout_delay_ms),
            ("write_retry_delay_ms".into(), self.write_retry_delay_ms),
            ("heartbeat_interval_ms".into(), self.heartbeat_interval_ms),
            ("perf_counter_delay_ms".into(), self.perf_counter_delay_ms),
            (
                "max_exponential_backoff_factor".into(),
                self.max_exponential_backoff_factor as u64,
            ),
            ("smear_percent".into(), self.smear_percent as u64),
            (
                "batching_delay_ms".into(),
                self.protocol_handler.batching_delay_ms,
            ),
        ]
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
