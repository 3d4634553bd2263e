//! Lease subsystem configuration.
//!
//! Durations and limits governing grant lifetime, interrupt escalation and
//! global eviction. Missing options take the documented defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the lease service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Minimum time a freshly granted lease is immune from revocation.
    pub min_lease_duration: Duration,
    /// Interval between redeliveries of an unacknowledged interrupt.
    pub lease_interrupt_interval: Duration,
    /// Number of delivery attempts before a holder is declared dead.
    pub lease_interrupt_limit: u32,
    /// Eviction passes stop once the live-lease count reaches this.
    pub lease_evict_low_limit: usize,
    /// Crossing this live-lease count triggers an eviction pass.
    pub lease_evict_high_limit: usize,
    /// Capacity of each per-inode coordinator's operation channel.
    pub request_channel_capacity: usize,
    /// Capacity of each mount's interrupt callback channel.
    pub callback_channel_capacity: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            min_lease_duration: Duration::from_millis(250),
            lease_interrupt_interval: Duration::from_millis(250),
            lease_interrupt_limit: 20,
            lease_evict_low_limit: 100_000,
            lease_evict_high_limit: 100_010,
            request_channel_capacity: 64,
            callback_channel_capacity: 64,
        }
    }
}

/// Configuration validation failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A duration option must be greater than zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// A count option must be greater than zero.
    #[error("{0} must be greater than zero")]
    ZeroCount(&'static str),
    /// The eviction low limit must not exceed the high limit.
    #[error("lease_evict_low_limit {low} exceeds lease_evict_high_limit {high}")]
    EvictLimitsInverted {
        /// Configured low limit.
        low: usize,
        /// Configured high limit.
        high: usize,
    },
}

impl LeaseConfig {
    /// Checks that the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_lease_duration.is_zero() {
            return Err(ConfigError::ZeroDuration("min_lease_duration"));
        }
        if self.lease_interrupt_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("lease_interrupt_interval"));
        }
        if self.lease_interrupt_limit == 0 {
            return Err(ConfigError::ZeroCount("lease_interrupt_limit"));
        }
        if self.request_channel_capacity == 0 {
            return Err(ConfigError::ZeroCount("request_channel_capacity"));
        }
        if self.callback_channel_capacity == 0 {
            return Err(ConfigError::ZeroCount("callback_channel_capacity"));
        }
        if self.lease_evict_low_limit > self.lease_evict_high_limit {
            return Err(ConfigError::EvictLimitsInverted {
                low: self.lease_evict_low_limit,
                high: self.lease_evict_high_limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LeaseConfig::default();
        assert_eq!(config.min_lease_duration, Duration::from_millis(250));
        assert_eq!(config.lease_interrupt_interval, Duration::from_millis(250));
        assert_eq!(config.lease_interrupt_limit, 20);
        assert_eq!(config.lease_evict_low_limit, 100_000);
        assert_eq!(config.lease_evict_high_limit, 100_010);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_takes_defaults() {
        let config: LeaseConfig = serde_json::from_str(r#"{"lease_interrupt_limit": 5}"#).unwrap();
        assert_eq!(config.lease_interrupt_limit, 5);
        assert_eq!(config.min_lease_duration, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let config = LeaseConfig {
            min_lease_duration: Duration::ZERO,
            ..LeaseConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("min_lease_duration"))
        ));

        let config = LeaseConfig {
            lease_interrupt_interval: Duration::ZERO,
            ..LeaseConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_evict_limits() {
        let config = LeaseConfig {
            lease_evict_low_limit: 100,
            lease_evict_high_limit: 50,
            ..LeaseConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EvictLimitsInverted { low: 100, high: 50 })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interrupt_limit() {
        let config = LeaseConfig {
            lease_interrupt_limit: 0,
            ..LeaseConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = LeaseConfig::default();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: LeaseConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.lease_evict_high_limit, config.lease_evict_high_limit);
        assert_eq!(decoded.min_lease_duration, config.min_lease_duration);
    }
}
