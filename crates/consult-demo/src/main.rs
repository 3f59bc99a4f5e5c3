//! Consultation Demo
//!
//! Runs one patient and a configurable number of doctors against the
//! in-process videoroom and logs what each participant sees.
//!
//! # Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Join the patient and wait until it is publishing
//! 4. Join the doctors, which discover and subscribe to the patient
//! 5. Wait for Ctrl+C or `DEMO_RUN_SECS`
//! 6. Leave every session, log final snapshots and print the metrics

#![warn(clippy::pedantic)]

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use config::DemoConfig;
use session_controller::actors::{
    Role, SessionActor, SessionHandle, SessionNotification, SessionState,
};
use session_controller::observability::init_metrics_recorder;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use videoroom_loopback::{LoopbackCapture, LoopbackGateway};

/// Time allowed for the patient to start publishing before doctors join.
const PATIENT_READY_TIMEOUT: Duration = Duration::from_secs(30);

struct Participant {
    label: String,
    handle: SessionHandle,
    task: JoinHandle<()>,
    logger: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DemoConfig::from_env().context("failed to load configuration")?;

    let json = config.observability.json_logs;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.observability.log_filter.clone().into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    info!(
        room_id = %config.room_id,
        doctors = config.doctors,
        track_delivery = %config.loopback.track_delivery,
        suppress_join_publishers = config.loopback.suppress_join_publishers,
        announcements = ?config.loopback.announcements,
        "Starting consultation demo"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow!(e)
    })?;

    let gateway = LoopbackGateway::new(config.loopback.clone());
    let shutdown_token = CancellationToken::new();

    let patient = start_participant(
        &config,
        &gateway,
        &shutdown_token,
        "patient".to_string(),
        "Patient",
        Role::Patient,
    )
    .await?;

    let ready = tokio::time::timeout(
        PATIENT_READY_TIMEOUT,
        patient
            .handle
            .wait_for_state(|s| matches!(s, SessionState::Active | SessionState::Failed(_))),
    )
    .await
    .context("patient did not become active in time")??;
    if let SessionState::Failed(cause) = ready {
        error!(cause = %cause, "Patient failed to join");
    }

    let mut participants = vec![patient];
    for n in 1..=config.doctors {
        let label = format!("doctor-{n}");
        let display = format!("Dr. {n}");
        participants.push(
            start_participant(
                &config,
                &gateway,
                &shutdown_token,
                label,
                &display,
                Role::Doctor,
            )
            .await?,
        );
    }

    match config.run_for {
        Some(duration) => {
            info!(secs = duration.as_secs(), "Demo running");
            tokio::select! {
                () = shutdown_signal() => {}
                () = tokio::time::sleep(duration) => {}
            }
        }
        None => {
            info!("Demo running - press Ctrl+C to stop");
            shutdown_signal().await;
        }
    }

    info!("Leaving room...");
    for participant in &participants {
        let label = &participant.label;
        match participant.handle.snapshot().await {
            Ok(snapshot) => match serde_json::to_string(&snapshot) {
                Ok(json) => info!(participant = %label, snapshot = %json, "Final state"),
                Err(e) => warn!(participant = %label, error = %e, "Snapshot encoding failed"),
            },
            Err(e) => warn!(participant = %label, error = %e, "Snapshot failed"),
        }
        if let Err(e) = participant.handle.leave().await {
            warn!(participant = %label, error = %e, "Leave failed");
        }
    }

    shutdown_token.cancel();
    for participant in participants {
        if let Err(e) = participant.task.await {
            warn!(participant = %participant.label, error = %e, "Session task ended abnormally");
        }
        let _ = participant.logger.await;
    }

    info!(
        live_handles = gateway.live_handles(),
        live_connections = gateway.live_connections(),
        "Demo complete"
    );
    println!("{}", prometheus_handle.render());
    Ok(())
}

async fn start_participant(
    config: &DemoConfig,
    gateway: &LoopbackGateway,
    shutdown_token: &CancellationToken,
    label: String,
    display: &str,
    role: Role,
) -> anyhow::Result<Participant> {
    let (handle, notifications, task) = SessionActor::spawn(
        config.session.clone(),
        Arc::new(gateway.clone()),
        Arc::new(LoopbackCapture::new()),
        shutdown_token.child_token(),
    );
    let logger = tokio::spawn(log_notifications(label.clone(), notifications));

    handle
        .join(config.room_id, display, role)
        .await
        .with_context(|| format!("{label} could not join"))?;
    info!(participant = %label, role = %role, "Joining room");

    Ok(Participant {
        label,
        handle,
        task,
        logger,
    })
}

/// Stand-in for a presentation layer: log every notification.
async fn log_notifications(label: String, mut notifications: mpsc::Receiver<SessionNotification>) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            SessionNotification::StatusChanged(text) => {
                info!(participant = %label, status = %text, "Status");
            }
            SessionNotification::StateChanged(state) => {
                info!(participant = %label, state = %state, "State");
            }
            SessionNotification::LocalStreamReady(stream) => {
                info!(participant = %label, tracks = stream.tracks().len(), "Local stream ready");
            }
            SessionNotification::ParticipantReady {
                peer_id,
                display_name,
                tracks,
            } => {
                info!(
                    participant = %label,
                    peer_id = %peer_id,
                    display_name = %display_name,
                    tracks = tracks.len(),
                    "Participant ready"
                );
            }
            SessionNotification::ParticipantRemoved { peer_id } => {
                info!(participant = %label, peer_id = %peer_id, "Participant removed");
            }
            SessionNotification::RosterChanged(roster) => {
                info!(participant = %label, peers = roster.len(), "Roster changed");
            }
            SessionNotification::NoPeersFound => {
                warn!(participant = %label, "No participants found");
            }
            SessionNotification::NoMediaReceived { peer_id } => {
                warn!(participant = %label, peer_id = %peer_id, "No media received");
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
