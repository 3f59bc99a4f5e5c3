//! Common configuration types for Telecare components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default tracing filter directive.
pub const DEFAULT_LOG_FILTER: &str = "session_controller=debug,videoroom_loopback=info";

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive used when `RUST_LOG` is not set
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Load from a variable map (`LOG_FILTER`, `LOG_JSON`).
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            log_filter: vars
                .get("LOG_FILTER")
                .cloned()
                .unwrap_or(defaults.log_filter),
            json_logs: vars
                .get("LOG_JSON")
                .and_then(|v| parse_bool(v))
                .unwrap_or(defaults.json_logs),
        }
    }
}

/// Parse a boolean flag in the forms accepted by environment variables.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_forms() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" on "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_observability_from_vars() {
        let vars = HashMap::from([
            ("LOG_FILTER".to_string(), "info".to_string()),
            ("LOG_JSON".to_string(), "yes".to_string()),
        ]);
        let config = ObservabilityConfig::from_vars(&vars);
        assert_eq!(config.log_filter, "info");
        assert!(config.json_logs);

        let config = ObservabilityConfig::from_vars(&HashMap::new());
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
        assert!(!config.json_logs);
    }
}
