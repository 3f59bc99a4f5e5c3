//! Demo configuration.
//!
//! Loaded from environment variables. The session tuning (`SC_*`) and log
//! settings (`LOG_FILTER`, `LOG_JSON`) come from the same variable map.

use common::config::{parse_bool, ObservabilityConfig};
use common::types::RoomId;
use session_controller::config::{ConfigError, SessionConfig};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;
use videoroom_loopback::{AnnouncementMode, LoopbackConfig, TrackDelivery};

/// Default consultation room.
pub const DEFAULT_ROOM_ID: u64 = 1234;

/// Default number of doctors joining the patient.
pub const DEFAULT_DOCTORS: usize = 1;

#[derive(Debug, Error)]
pub enum DemoConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Session(#[from] ConfigError),
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub room_id: RoomId,
    pub doctors: usize,
    /// `None` runs until Ctrl+C.
    pub run_for: Option<Duration>,
    pub loopback: LoopbackConfig,
    pub session: SessionConfig,
    pub observability: ObservabilityConfig,
}

impl DemoConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, DemoConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, DemoConfigError> {
        let room_id = match vars.get("DEMO_ROOM_ID") {
            Some(raw) => raw.trim().parse().map_err(|e| {
                DemoConfigError::InvalidValue(format!("DEMO_ROOM_ID must be a number: {e}"))
            })?,
            None => DEFAULT_ROOM_ID,
        };

        let doctors = vars
            .get("DEMO_DOCTORS")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_DOCTORS);

        let run_for = vars
            .get("DEMO_RUN_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let flag = |key: &str| vars.get(key).and_then(|v| parse_bool(v)).unwrap_or(false);

        let track_delivery = match vars.get("DEMO_TRACK_DELIVERY") {
            Some(raw) => raw
                .parse::<TrackDelivery>()
                .map_err(|e| DemoConfigError::InvalidValue(e.to_string()))?,
            None => TrackDelivery::default(),
        };

        let loopback = LoopbackConfig {
            suppress_join_publishers: flag("DEMO_SUPPRESS_JOIN_PUBLISHERS"),
            announcements: if flag("DEMO_BUFFER_ANNOUNCEMENTS") {
                AnnouncementMode::Buffered
            } else {
                AnnouncementMode::Immediate
            },
            track_delivery,
            ..LoopbackConfig::default()
        };

        Ok(Self {
            room_id: RoomId(room_id),
            doctors,
            run_for,
            loopback,
            session: SessionConfig::from_vars(vars)?,
            observability: ObservabilityConfig::from_vars(vars),
        })
    }
}
