//! Engine configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One sliding-window rate rule: at most `max_count` fires per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRule {
    pub window_ms: u64,
    pub max_count: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("smear_fraction {0} outside (0, 1]")]
    SmearFraction(String),
    #[error("throttle rule with max_count 0 would block all sends")]
    ZeroCountRule,
    #[error("throttle rule with zero window")]
    ZeroWindowRule,
    #[error("{0} must be nonzero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Nominal delay before batched work (registrations, acks, sync data)
    /// is flushed to the server.
    pub batching_delay_ms: u64,
    /// Nominal heartbeat period; the server may lengthen it per session.
    pub heartbeat_interval_ms: u64,
    /// Nominal poll period; the server may lengthen it per session.
    pub poll_interval_ms: u64,
    /// First heartbeat after start fires sooner than the steady period.
    pub initial_heartbeat_delay_ms: u64,
    /// Fraction in (0, 1] by which scheduled delays are randomized.
    pub smear_fraction: f64,
    pub throttle_rules: Vec<ThrottleRule>,
    /// Initial bound for the token-request retry backoff.
    pub initial_backoff_ms: u64,
    /// Backoff is capped at `initial_backoff_ms * max_backoff_factor`.
    pub max_backoff_factor: u32,
    /// Hard limit on one encoded outbound message.
    pub max_message_bytes: usize,
    /// Registration ops / acks drained into a single outbound message;
    /// overflow stays pending and reschedules the batcher.
    pub max_ops_per_message: usize,
    /// Seed for all engine randomness (smearing, backoff, nonces).
    pub rng_seed: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            batching_delay_ms: 500,
            heartbeat_interval_ms: 20 * 60 * 1000,
            poll_interval_ms: 6 * 20 * 60 * 1000,
            initial_heartbeat_delay_ms: 2_000,
            smear_fraction: 0.2,
            throttle_rules: vec![
                ThrottleRule {
                    window_ms: 1_000,
                    max_count: 1,
                },
                ThrottleRule {
                    window_ms: 60_000,
                    max_count: 6,
                },
            ],
            initial_backoff_ms: 2_000,
            max_backoff_factor: 10,
            max_message_bytes: 64 * 1024,
            max_ops_per_message: 512,
            rng_seed: 0,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.smear_fraction > 0.0 && self.smear_fraction <= 1.0) {
            return Err(ConfigError::SmearFraction(format!(
                "{}",
                self.smear_fraction
            )));
        }
        for rule in &self.throttle_rules {
            if rule.max_count == 0 {
                return Err(ConfigError::ZeroCountRule);
            }
            if rule.window_ms == 0 {
                return Err(ConfigError::ZeroWindowRule);
            }
        }
        if self.batching_delay_ms == 0 {
            return Err(ConfigError::ZeroInterval("batching_delay_ms"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("heartbeat_interval_ms"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("poll_interval_ms"));
        }
        Ok(())
    }

    /// Name/value pairs echoed to the server in info messages.
    pub fn config_params(&self) -> Vec<(&'static str, i64)> {
        vec![
            ("batching_delay_ms", self.batching_delay_ms as i64),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms as i64),
            ("poll_interval_ms", self.poll_interval_ms as i64),
            (
                "initial_heartbeat_delay_ms",
                self.initial_heartbeat_delay_ms as i64,
            ),
            (
                "smear_percent",
                (self.smear_fraction * 100.0).round() as i64,
            ),
            ("initial_backoff_ms", self.initial_backoff_ms as i64),
            ("max_backoff_factor", self.max_backoff_factor as i64),
            ("max_message_bytes", self.max_message_bytes as i64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_smear() {
        let mut config = ClientConfig {
            smear_fraction: 0.0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
        config.smear_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unsatisfiable_throttle_rule() {
        let config = ClientConfig {
            throttle_rules: vec![ThrottleRule {
                window_ms: 1_000,
                max_count: 0,
            }],
            ..ClientConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroCountRule));
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batching_delay_ms, 500);
        assert_eq!(config.throttle_rules.len(), 2);
    }
}
