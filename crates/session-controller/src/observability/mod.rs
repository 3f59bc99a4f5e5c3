//! Observability for the session controller.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with explicit safe fields.
//! Display names and SDP never appear in spans or metric labels; peers are
//! logged by feed id only.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sc_session_transitions_total` | Counter | `state` | Session state machine activity |
//! | `sc_join_duration_seconds` | Histogram | none | Time to join confirmation |
//! | `sc_discovery_attempts_total` | Counter | none | Participant-list requests |
//! | `sc_discovery_outcomes_total` | Counter | `outcome` | Converged vs exhausted runs |
//! | `sc_discovery_probes_total` | Counter | `outcome` | Probe subscriber lifecycle |
//! | `sc_subscriptions_active` | Gauge | none | Open subscriptions |
//! | `sc_subscription_failures_total` | Counter | `stage` | Failed subscriptions |
//! | `sc_tracks_received_total` | Counter | `kind`, `path` | New remote tracks |
//! | `sc_tracks_duplicate_total` | Counter | `path` | Tracks reported more than once |
//! | `sc_notifications_dropped_total` | Counter | none | Presentation layer backpressure |
//! | `sc_release_errors_total` | Counter | `resource` | Teardown failures skipped |

pub mod metrics;

pub use metrics::init_metrics_recorder;
