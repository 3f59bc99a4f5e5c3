//! Metrics definitions for the session controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for session controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded, never peer or room identifiers:
//! - `state`: 8 values (session states)
//! - `outcome`: 2 values for discovery runs, 4 for probes
//! - `stage`: bounded by subscription steps (attach, join, answer)
//! - `kind`: 2 values (audio, video)
//! - `path`: 4 values (track delivery paths)
//! - `resource`: 4 values (subscriber, probe, publisher, connection)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle for
/// rendering.
///
/// Must be called before any metrics are recorded. Join duration buckets
/// cover a local loopback join (milliseconds) up to a slow gateway
/// (tens of seconds).
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("sc_join_duration_seconds".to_string()),
            &[
                0.005, 0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000,
            ],
        )
        .map_err(|e| format!("Failed to set join duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Record a session state transition.
///
/// Metric: `sc_session_transitions_total`
/// Labels: `state` (the state entered)
pub fn record_session_transition(state: &str) {
    counter!("sc_session_transitions_total", "state" => state.to_string()).increment(1);
}

/// Record the time from `join` to the gateway's join confirmation.
///
/// Metric: `sc_join_duration_seconds`
/// Labels: none
pub fn record_join_duration(duration: Duration) {
    histogram!("sc_join_duration_seconds").record(duration.as_secs_f64());
}

/// Record a notification dropped because the presentation layer fell behind.
///
/// Metric: `sc_notifications_dropped_total`
/// Labels: none
pub fn record_notification_dropped() {
    counter!("sc_notifications_dropped_total").increment(1);
}

/// Record a resource whose release failed during teardown.
///
/// Metric: `sc_release_errors_total`
/// Labels: `resource` (subscriber, probe, publisher, connection)
pub fn record_release_error(resource: &str) {
    counter!("sc_release_errors_total", "resource" => resource.to_string()).increment(1);
}

// ============================================================================
// Discovery Metrics
// ============================================================================

/// Record one discovery attempt (a participant-list request).
///
/// Metric: `sc_discovery_attempts_total`
/// Labels: none
pub fn record_discovery_attempt() {
    counter!("sc_discovery_attempts_total").increment(1);
}

/// Record the outcome of a discovery run.
///
/// Metric: `sc_discovery_outcomes_total`
/// Labels: `outcome` (converged, exhausted)
pub fn record_discovery_outcome(outcome: &str) {
    counter!("sc_discovery_outcomes_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a discovery probe lifecycle event.
///
/// Metric: `sc_discovery_probes_total`
/// Labels: `outcome` (opened, replied, attach_failed, expired)
pub fn record_discovery_probe(outcome: &str) {
    counter!("sc_discovery_probes_total", "outcome" => outcome.to_string()).increment(1);
}

// ============================================================================
// Subscription & Track Metrics
// ============================================================================

/// Set the number of open subscriptions.
///
/// Metric: `sc_subscriptions_active`
/// Labels: none
pub fn set_subscriptions_active(count: u64) {
    // u64 to f64 conversion is safe for realistic subscription counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_subscriptions_active").set(count as f64);
}

/// Record a failed subscription.
///
/// Metric: `sc_subscription_failures_total`
/// Labels: `stage` (attach, join, answer)
pub fn record_subscription_failure(stage: &str) {
    counter!("sc_subscription_failures_total", "stage" => stage.to_string()).increment(1);
}

/// Record a new remote track.
///
/// Metric: `sc_tracks_received_total`
/// Labels: `kind` (audio, video), `path` (delivery path)
pub fn record_track_received(kind: &str, path: &str) {
    counter!(
        "sc_tracks_received_total",
        "kind" => kind.to_string(),
        "path" => path.to_string()
    )
    .increment(1);
}

/// Record a track reported again through some delivery path.
///
/// Metric: `sc_tracks_duplicate_total`
/// Labels: `path`
pub fn record_track_duplicate(path: &str) {
    counter!("sc_tracks_duplicate_total", "path" => path.to_string()).increment(1);
}
