//! Session Controller configuration.
//!
//! Configuration is loaded from environment variables. Every field has a
//! default; unparsable values fall back to it. Combinations that would make
//! a timer loop degenerate (zero attempts, zero interval) are rejected.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default number of discovery attempts before reporting "no peers found".
pub const DEFAULT_DISCOVERY_MAX_ATTEMPTS: u32 = 8;

/// Default spacing between discovery attempts.
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 2000;

/// Default delay before the first discovery attempt.
pub const DEFAULT_DISCOVERY_INITIAL_DELAY_MS: u64 = 1000;

/// Default delay between an attempt's participant-list request and its ping.
pub const DEFAULT_DISCOVERY_PING_DELAY_MS: u64 = 300;

/// Default attempt that re-issues the join request (0 disables).
pub const DEFAULT_DISCOVERY_REJOIN_ATTEMPT: u32 = 3;

/// Default delay between the re-join attempt's list request and the re-join.
pub const DEFAULT_DISCOVERY_REJOIN_DELAY_MS: u64 = 1000;

/// Default first attempt that opens a publisher-list probe (0 disables).
pub const DEFAULT_DISCOVERY_PROBE_AFTER_ATTEMPT: u32 = 4;

/// Default feed targeted by the probe. It must not exist in any room.
pub const DEFAULT_DISCOVERY_PROBE_FEED: u64 = 9_999_999_999;

/// Default lifetime of a probe attachment that never receives a reply.
pub const DEFAULT_DISCOVERY_PROBE_LINGER_MS: u64 = 2000;

/// Default delay between a probe's first reply and its detach.
pub const DEFAULT_DISCOVERY_PROBE_REPLY_GRACE_MS: u64 = 1000;

/// Default delay before the first receiver poll of a subscription.
pub const DEFAULT_TRACK_POLL_INITIAL_DELAY_MS: u64 = 1000;

/// Default spacing between receiver polls.
pub const DEFAULT_TRACK_POLL_INTERVAL_MS: u64 = 500;

/// Default number of receiver polls before reporting "no media received".
pub const DEFAULT_TRACK_POLL_MAX_CHECKS: u32 = 30;

/// Default time allowed for the join confirmation.
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 10_000;

/// Default capacity of the notification channel.
pub const DEFAULT_NOTIFICATION_BUFFER: usize = 256;

/// Discovery Engine timing and heuristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Bounded number of attempts (N).
    pub max_attempts: u32,
    /// Spacing between attempts.
    pub interval: Duration,
    /// Delay before attempt 1.
    pub initial_delay: Duration,
    /// Delay before the liveness ping within an attempt.
    pub ping_delay: Duration,
    /// Attempt number that re-issues the join request; `None` disables it.
    pub rejoin_attempt: Option<u32>,
    /// Delay of the re-join within its attempt.
    pub rejoin_delay: Duration,
    /// From this attempt on, an empty roster triggers a probe; `None`
    /// disables probing.
    pub probe_after_attempt: Option<u32>,
    /// Feed targeted by the probe.
    pub probe_feed: u64,
    /// Probe lifetime without a reply.
    pub probe_linger: Duration,
    /// Probe lifetime after its first reply.
    pub probe_reply_grace: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DISCOVERY_MAX_ATTEMPTS,
            interval: Duration::from_millis(DEFAULT_DISCOVERY_INTERVAL_MS),
            initial_delay: Duration::from_millis(DEFAULT_DISCOVERY_INITIAL_DELAY_MS),
            ping_delay: Duration::from_millis(DEFAULT_DISCOVERY_PING_DELAY_MS),
            rejoin_attempt: Some(DEFAULT_DISCOVERY_REJOIN_ATTEMPT),
            rejoin_delay: Duration::from_millis(DEFAULT_DISCOVERY_REJOIN_DELAY_MS),
            probe_after_attempt: Some(DEFAULT_DISCOVERY_PROBE_AFTER_ATTEMPT),
            probe_feed: DEFAULT_DISCOVERY_PROBE_FEED,
            probe_linger: Duration::from_millis(DEFAULT_DISCOVERY_PROBE_LINGER_MS),
            probe_reply_grace: Duration::from_millis(DEFAULT_DISCOVERY_PROBE_REPLY_GRACE_MS),
        }
    }
}

/// Receiver polling policy for each subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPollConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_checks: u32,
}

impl Default for TrackPollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_TRACK_POLL_INITIAL_DELAY_MS),
            interval: Duration::from_millis(DEFAULT_TRACK_POLL_INTERVAL_MS),
            max_checks: DEFAULT_TRACK_POLL_MAX_CHECKS,
        }
    }
}

/// Session Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub discovery: DiscoveryConfig,
    pub track_poll: TrackPollConfig,
    /// Time allowed between sending the join request and its confirmation.
    pub join_timeout: Duration,
    /// Capacity of the notification channel handed to the presentation layer.
    pub notification_buffer: usize,
    /// Overrides the role's auto-subscribe default when set.
    pub auto_subscribe: Option<bool>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            track_poll: TrackPollConfig::default(),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
            auto_subscribe: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_or<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    vars.get(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn millis_or(vars: &HashMap<String, String>, key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(parse_or(vars, key, default_ms))
}

/// Attempt numbers where 0 means "disabled".
fn optional_attempt(vars: &HashMap<String, String>, key: &str, default: u32) -> Option<u32> {
    match parse_or(vars, key, default) {
        0 => None,
        n => Some(n),
    }
}

impl SessionConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let discovery = DiscoveryConfig {
            max_attempts: parse_or(
                vars,
                "SC_DISCOVERY_MAX_ATTEMPTS",
                DEFAULT_DISCOVERY_MAX_ATTEMPTS,
            ),
            interval: millis_or(vars, "SC_DISCOVERY_INTERVAL_MS", DEFAULT_DISCOVERY_INTERVAL_MS),
            initial_delay: millis_or(
                vars,
                "SC_DISCOVERY_INITIAL_DELAY_MS",
                DEFAULT_DISCOVERY_INITIAL_DELAY_MS,
            ),
            ping_delay: millis_or(
                vars,
                "SC_DISCOVERY_PING_DELAY_MS",
                DEFAULT_DISCOVERY_PING_DELAY_MS,
            ),
            rejoin_attempt: optional_attempt(
                vars,
                "SC_DISCOVERY_REJOIN_ATTEMPT",
                DEFAULT_DISCOVERY_REJOIN_ATTEMPT,
            ),
            rejoin_delay: millis_or(
                vars,
                "SC_DISCOVERY_REJOIN_DELAY_MS",
                DEFAULT_DISCOVERY_REJOIN_DELAY_MS,
            ),
            probe_after_attempt: optional_attempt(
                vars,
                "SC_DISCOVERY_PROBE_AFTER_ATTEMPT",
                DEFAULT_DISCOVERY_PROBE_AFTER_ATTEMPT,
            ),
            probe_feed: parse_or(vars, "SC_DISCOVERY_PROBE_FEED", DEFAULT_DISCOVERY_PROBE_FEED),
            probe_linger: millis_or(
                vars,
                "SC_DISCOVERY_PROBE_LINGER_MS",
                DEFAULT_DISCOVERY_PROBE_LINGER_MS,
            ),
            probe_reply_grace: millis_or(
                vars,
                "SC_DISCOVERY_PROBE_REPLY_GRACE_MS",
                DEFAULT_DISCOVERY_PROBE_REPLY_GRACE_MS,
            ),
        };

        let track_poll = TrackPollConfig {
            initial_delay: millis_or(
                vars,
                "SC_TRACK_POLL_INITIAL_DELAY_MS",
                DEFAULT_TRACK_POLL_INITIAL_DELAY_MS,
            ),
            interval: millis_or(
                vars,
                "SC_TRACK_POLL_INTERVAL_MS",
                DEFAULT_TRACK_POLL_INTERVAL_MS,
            ),
            max_checks: parse_or(vars, "SC_TRACK_POLL_MAX_CHECKS", DEFAULT_TRACK_POLL_MAX_CHECKS),
        };

        let auto_subscribe = vars
            .get("SC_AUTO_SUBSCRIBE")
            .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            });

        let config = SessionConfig {
            discovery,
            track_poll,
            join_timeout: millis_or(vars, "SC_JOIN_TIMEOUT_MS", DEFAULT_JOIN_TIMEOUT_MS),
            notification_buffer: parse_or(
                vars,
                "SC_NOTIFICATION_BUFFER",
                DEFAULT_NOTIFICATION_BUFFER,
            ),
            auto_subscribe,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a timer loop degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "SC_DISCOVERY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.discovery.interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SC_DISCOVERY_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.track_poll.max_checks == 0 {
            return Err(ConfigError::InvalidValue(
                "SC_TRACK_POLL_MAX_CHECKS must be at least 1".to_string(),
            ));
        }
        if self.track_poll.interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SC_TRACK_POLL_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.join_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SC_JOIN_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        if self.notification_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "SC_NOTIFICATION_BUFFER must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = SessionConfig::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.discovery.max_attempts, 8);
        assert_eq!(config.discovery.interval, Duration::from_secs(2));
        assert_eq!(config.discovery.initial_delay, Duration::from_secs(1));
        assert_eq!(config.discovery.rejoin_attempt, Some(3));
        assert_eq!(config.discovery.probe_after_attempt, Some(4));
        assert_eq!(config.discovery.probe_feed, 9_999_999_999);
        assert_eq!(config.track_poll.max_checks, 30);
        assert_eq!(config.track_poll.interval, Duration::from_millis(500));
        assert_eq!(config.auto_subscribe, None);
    }

    #[test]
    fn test_from_vars_custom_values() {
        let config = SessionConfig::from_vars(&vars(&[
            ("SC_DISCOVERY_MAX_ATTEMPTS", "3"),
            ("SC_DISCOVERY_INTERVAL_MS", "250"),
            ("SC_TRACK_POLL_MAX_CHECKS", "4"),
            ("SC_JOIN_TIMEOUT_MS", "1500"),
            ("SC_AUTO_SUBSCRIBE", "true"),
        ]))
        .expect("config should load");

        assert_eq!(config.discovery.max_attempts, 3);
        assert_eq!(config.discovery.interval, Duration::from_millis(250));
        assert_eq!(config.track_poll.max_checks, 4);
        assert_eq!(config.join_timeout, Duration::from_millis(1500));
        assert_eq!(config.auto_subscribe, Some(true));
    }

    #[test]
    fn test_zero_disables_heuristics() {
        let config = SessionConfig::from_vars(&vars(&[
            ("SC_DISCOVERY_REJOIN_ATTEMPT", "0"),
            ("SC_DISCOVERY_PROBE_AFTER_ATTEMPT", "0"),
        ]))
        .expect("config should load");

        assert_eq!(config.discovery.rejoin_attempt, None);
        assert_eq!(config.discovery.probe_after_attempt, None);
    }

    #[test]
    fn test_unparsable_values_fall_back_to_defaults() {
        let config = SessionConfig::from_vars(&vars(&[
            ("SC_DISCOVERY_MAX_ATTEMPTS", "eight"),
            ("SC_TRACK_POLL_INTERVAL_MS", "-5"),
            ("SC_AUTO_SUBSCRIBE", "maybe"),
        ]))
        .expect("config should load");

        assert_eq!(config.discovery.max_attempts, DEFAULT_DISCOVERY_MAX_ATTEMPTS);
        assert_eq!(
            config.track_poll.interval,
            Duration::from_millis(DEFAULT_TRACK_POLL_INTERVAL_MS)
        );
        assert_eq!(config.auto_subscribe, None);
    }

    #[test]
    fn test_degenerate_values_rejected() {
        for (key, value) in [
            ("SC_DISCOVERY_MAX_ATTEMPTS", "0"),
            ("SC_DISCOVERY_INTERVAL_MS", "0"),
            ("SC_TRACK_POLL_MAX_CHECKS", "0"),
            ("SC_TRACK_POLL_INTERVAL_MS", "0"),
            ("SC_JOIN_TIMEOUT_MS", "0"),
            ("SC_NOTIFICATION_BUFFER", "0"),
        ] {
            let result = SessionConfig::from_vars(&vars(&[(key, value)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(ref msg)) if msg.contains(key)),
                "{key}={value} should be rejected"
            );
        }
    }
}
