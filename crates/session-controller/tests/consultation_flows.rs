//! End-to-end consultation flows against the in-process videoroom.
//!
//! Every test runs on paused time: discovery and polling timers fire as
//! soon as the runtime is otherwise idle, so the default multi-second
//! schedules complete instantly and in a fixed order.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::types::{HandleId, PeerId, RoomId};
use session_controller::actors::{
    DiscoveryStatus, Role, SessionActor, SessionHandle, SessionNotification, SessionSnapshot,
    SessionState, TrackSetView,
};
use session_controller::config::{DiscoveryConfig, SessionConfig, TrackPollConfig};
use session_controller::errors::{ScError, SessionFailure};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use videoroom_loopback::{
    init_test_tracing, AnnouncementMode, LoopbackCapture, LoopbackGateway, TrackDelivery,
};

const ROOM: RoomId = RoomId(42);

/// Upper bound for any wait; generous because time is virtual.
const WAIT_LIMIT: Duration = Duration::from_secs(600);

/// Default timings with the re-join and probe heuristics off, so request
/// counts only reflect the behavior under test.
fn quiet_config() -> SessionConfig {
    SessionConfig {
        discovery: DiscoveryConfig {
            rejoin_attempt: None,
            probe_after_attempt: None,
            ..DiscoveryConfig::default()
        },
        ..SessionConfig::default()
    }
}

struct Participant {
    handle: SessionHandle,
    seen: Arc<Mutex<Vec<SessionNotification>>>,
    _task: JoinHandle<()>,
}

impl Participant {
    fn spawn(gateway: &LoopbackGateway, config: SessionConfig) -> Self {
        Self::spawn_with_capture(gateway, config, LoopbackCapture::new())
    }

    fn spawn_with_capture(
        gateway: &LoopbackGateway,
        config: SessionConfig,
        capture: LoopbackCapture,
    ) -> Self {
        let (handle, mut notifications, task) = SessionActor::spawn(
            config,
            Arc::new(gateway.clone()),
            Arc::new(capture),
            CancellationToken::new(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                sink.lock().unwrap().push(notification);
            }
        });
        Self {
            handle,
            seen,
            _task: task,
        }
    }

    async fn joined(
        gateway: &LoopbackGateway,
        config: SessionConfig,
        display: &str,
        role: Role,
    ) -> Self {
        let participant = Self::spawn(gateway, config);
        participant.handle.join(ROOM, display, role).await.unwrap();
        participant
    }

    fn count(&self, predicate: impl Fn(&SessionNotification) -> bool) -> usize {
        self.seen.lock().unwrap().iter().filter(|n| predicate(*n)).count()
    }

    async fn wait_for_notification(&self, predicate: impl Fn(&SessionNotification) -> bool) {
        tokio::time::timeout(WAIT_LIMIT, async {
            while self.count(&predicate) == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("notification did not arrive");
    }

    async fn wait_for_snapshot(
        &self,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let snapshot = self.handle.snapshot().await.unwrap();
                if predicate(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("snapshot condition not reached")
    }

    async fn wait_until_active(&self) -> PeerId {
        let state = tokio::time::timeout(
            WAIT_LIMIT,
            self.handle
                .wait_for_state(|s| matches!(s, SessionState::Active | SessionState::Failed(_))),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(state, SessionState::Active);
        self.handle.snapshot().await.unwrap().own_feed.unwrap()
    }

    /// Track view handed out with the first `ParticipantReady` for `peer`.
    fn ready_view(&self, peer: PeerId) -> TrackSetView {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .find_map(|n| match n {
                SessionNotification::ParticipantReady {
                    peer_id, tracks, ..
                } if *peer_id == peer => Some(tracks.clone()),
                _ => None,
            })
            .expect("participant was never ready")
    }

    /// Wait until the subscription to `peer` has received its video.
    async fn wait_until_ready(&self, peer: PeerId) -> SessionSnapshot {
        self.wait_for_snapshot(|s| {
            s.subscriptions
                .iter()
                .any(|sub| sub.peer_id == peer && sub.ready)
        })
        .await
    }
}

fn is_ready_for(peer: PeerId) -> impl Fn(&SessionNotification) -> bool {
    move |n| matches!(n, SessionNotification::ParticipantReady { peer_id, .. } if *peer_id == peer)
}

fn is_removed(peer: PeerId) -> impl Fn(&SessionNotification) -> bool {
    move |n| matches!(n, SessionNotification::ParticipantRemoved { peer_id } if *peer_id == peer)
}

/// Handles that sent a join without being one of `publishers`.
fn subscriber_joins(gateway: &LoopbackGateway, publishers: &[PeerId]) -> Vec<HandleId> {
    gateway
        .requests()
        .iter()
        .filter(|r| r.request == "join" && !publishers.iter().any(|p| HandleId(p.0) == r.handle))
        .map(|r| r.handle)
        .collect()
}

fn requests_from(gateway: &LoopbackGateway, feed: PeerId, request: &str) -> usize {
    gateway
        .requests()
        .iter()
        .filter(|r| r.handle == HandleId(feed.0) && r.request == request)
        .count()
}

async fn publishing_patient(gateway: &LoopbackGateway) -> (Participant, PeerId) {
    let patient = Participant::joined(gateway, quiet_config(), "Patient", Role::Patient).await;
    let feed = patient.wait_until_active().await;
    (patient, feed)
}

#[tokio::test(start_paused = true)]
async fn test_doctor_finds_patient_on_first_attempt() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder().suppress_join_publishers().build();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;

    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;
    doctor.wait_for_notification(is_ready_for(patient_feed)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let snapshot = doctor.wait_until_ready(patient_feed).await;
    assert_eq!(snapshot.discovery, DiscoveryStatus::Converged { attempts: 1 });
    assert!(snapshot.joined_at.is_some());
    assert_eq!(snapshot.roster.len(), 1);
    assert_eq!(snapshot.roster[0].display_name, "Patient");
    assert!(snapshot.roster[0].active);
    assert_eq!(snapshot.subscriptions.len(), 1);
    assert_eq!(snapshot.subscriptions[0].audio_tracks, 1);
    assert_eq!(snapshot.subscriptions[0].video_tracks, 1);
    assert_eq!(doctor.count(is_ready_for(patient_feed)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_converged_discovery_stops_querying_the_room() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder().suppress_join_publishers().build();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;

    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    let doctor_feed = doctor.wait_until_active().await;
    doctor.wait_until_ready(patient_feed).await;

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(requests_from(&gateway, doctor_feed, "listparticipants"), 1);
    assert_eq!(requests_from(&gateway, doctor_feed, "join"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_joined_event_publishers_converge_without_attempts() {
    init_test_tracing();
    let gateway = LoopbackGateway::default();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;

    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    let doctor_feed = doctor.wait_until_active().await;
    let snapshot = doctor.wait_until_ready(patient_feed).await;

    assert_eq!(snapshot.discovery, DiscoveryStatus::Converged { attempts: 0 });
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(requests_from(&gateway, doctor_feed, "listparticipants"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_three_doctors_one_leaves() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder().suppress_join_publishers().build();
    let (patient, patient_feed) = publishing_patient(&gateway).await;

    let mut doctors = Vec::new();
    for name in ["Dr. Grey", "Dr. House", "Dr. Quinn"] {
        let doctor = Participant::joined(&gateway, quiet_config(), name, Role::Doctor).await;
        doctor.wait_until_active().await;
        doctors.push(doctor);
    }
    for doctor in &doctors {
        doctor.wait_until_ready(patient_feed).await;
    }
    // Patient publisher plus a publisher and a subscriber per doctor.
    assert_eq!(gateway.live_handles(), 7);

    doctors[1].handle.leave().await.unwrap();
    assert_eq!(doctors[1].handle.state(), SessionState::Idle);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(gateway.live_handles(), 5);
    assert_eq!(gateway.feeds(ROOM).len(), 3);
    for doctor in [&doctors[0], &doctors[2]] {
        let snapshot = doctor.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Active);
        assert!(snapshot.subscriptions[0].ready);
        assert_eq!(doctor.count(is_ready_for(patient_feed)), 1);
    }
    assert_eq!(patient.handle.state(), SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_exhausts_after_configured_attempts() {
    init_test_tracing();
    let gateway = LoopbackGateway::default();
    let mut config = quiet_config();
    config.discovery.max_attempts = 3;

    let doctor = Participant::joined(&gateway, config, "Dr. Grey", Role::Doctor).await;
    let doctor_feed = doctor.wait_until_active().await;
    doctor
        .wait_for_notification(|n| matches!(n, SessionNotification::NoPeersFound))
        .await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let snapshot = doctor.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.discovery, DiscoveryStatus::Exhausted { attempts: 3 });
    assert!(snapshot.roster.is_empty());
    assert_eq!(requests_from(&gateway, doctor_feed, "listparticipants"), 3);
    assert_eq!(requests_from(&gateway, doctor_feed, "ping"), 3);
    assert_eq!(
        doctor.count(|n| matches!(n, SessionNotification::NoPeersFound)),
        1
    );

    // A publisher arriving after exhaustion is still picked up.
    let (_patient, patient_feed) = publishing_patient(&gateway).await;
    let snapshot = doctor.wait_until_ready(patient_feed).await;
    assert_eq!(snapshot.discovery, DiscoveryStatus::Converged { attempts: 3 });
}

#[tokio::test(start_paused = true)]
async fn test_probes_open_late_and_are_released() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder()
        .announcements(AnnouncementMode::Dropped)
        .build();
    let mut config = quiet_config();
    config.discovery.max_attempts = 5;
    config.discovery.probe_after_attempt = Some(4);

    let doctor = Participant::joined(&gateway, config, "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;
    doctor
        .wait_for_notification(|n| matches!(n, SessionNotification::NoPeersFound))
        .await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    // One publisher join plus one subscriber join per probe (attempts 4, 5).
    assert_eq!(gateway.request_count("join"), 3);
    assert_eq!(gateway.live_handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_buffered_announcement_arrives_with_next_request() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder()
        .announcements(AnnouncementMode::Buffered)
        .build();

    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;
    let (_patient, patient_feed) = publishing_patient(&gateway).await;

    let snapshot = doctor.wait_until_ready(patient_feed).await;
    assert!(matches!(
        snapshot.discovery,
        DiscoveryStatus::Converged { attempts } if attempts >= 1
    ));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_then_reconnect_replaces_subscription() {
    init_test_tracing();
    let gateway = LoopbackGateway::default();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;
    doctor.wait_until_ready(patient_feed).await;

    doctor.handle.disconnect_from_peer(patient_feed).await.unwrap();
    doctor
        .wait_for_notification(|n| {
            matches!(
                n,
                SessionNotification::ParticipantRemoved { peer_id } if *peer_id == patient_feed
            )
        })
        .await;
    let snapshot = doctor.handle.snapshot().await.unwrap();
    assert!(snapshot.subscriptions.is_empty());
    assert!(snapshot.roster[0].dismissed);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(gateway.live_handles(), 2);

    doctor.handle.connect_to_peer(patient_feed).await.unwrap();
    let snapshot = doctor.wait_until_ready(patient_feed).await;
    assert!(!snapshot.roster[0].dismissed);
    assert_eq!(snapshot.subscriptions.len(), 1);
    assert_eq!(doctor.count(is_ready_for(patient_feed)), 2);
    // Patient, doctor and two subscriber joins; the first subscriber is gone.
    assert_eq!(gateway.request_count("join"), 4);
    assert_eq!(gateway.live_handles(), 3);

    let unknown = doctor.handle.connect_to_peer(PeerId(31337)).await;
    assert!(matches!(unknown, Err(ScError::UnknownPeer(31337))));
}

#[tokio::test(start_paused = true)]
async fn test_patient_connects_to_publishing_doctor() {
    init_test_tracing();
    let gateway = LoopbackGateway::default();
    let (patient, _) = publishing_patient(&gateway).await;
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    let doctor_feed = doctor.wait_until_active().await;

    doctor.handle.publish().await.unwrap();
    doctor
        .wait_for_notification(|n| matches!(n, SessionNotification::LocalStreamReady(_)))
        .await;

    let snapshot = patient
        .wait_for_snapshot(|s| s.roster.iter().any(|p| p.peer_id == doctor_feed))
        .await;
    assert_eq!(snapshot.roster[0].display_name, "Dr. Grey");
    assert!(snapshot.subscriptions.is_empty());

    patient.handle.connect_to_peer(doctor_feed).await.unwrap();
    let snapshot = patient.wait_until_ready(doctor_feed).await;
    assert_eq!(snapshot.subscriptions[0].video_tracks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_is_idempotent_and_releases_everything() {
    init_test_tracing();
    let gateway = LoopbackGateway::default();
    let (patient, patient_feed) = publishing_patient(&gateway).await;
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;
    doctor.wait_until_ready(patient_feed).await;

    doctor.handle.leave().await.unwrap();
    doctor.handle.leave().await.unwrap();
    assert_eq!(doctor.handle.state(), SessionState::Idle);

    patient.handle.leave().await.unwrap();
    assert_eq!(patient.handle.state(), SessionState::Idle);
    assert_eq!(gateway.live_handles(), 0);
    assert_eq!(gateway.live_connections(), 0);

    let snapshot = doctor.handle.snapshot().await.unwrap();
    assert_eq!(snapshot, SessionSnapshot::idle(SessionState::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_patient_leaving_removes_participant() {
    init_test_tracing();
    let gateway = LoopbackGateway::default();
    let (patient, patient_feed) = publishing_patient(&gateway).await;
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;
    doctor.wait_until_ready(patient_feed).await;

    patient.handle.leave().await.unwrap();
    let snapshot = doctor
        .wait_for_snapshot(|s| s.roster.is_empty() && s.subscriptions.is_empty())
        .await;
    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(
        doctor.count(|n| matches!(n, SessionNotification::ParticipantRemoved { .. })),
        1
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(gateway.live_handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_join_fails_session() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder()
        .reject_join(426, "No such room")
        .build();
    let patient = Participant::joined(&gateway, quiet_config(), "Patient", Role::Patient).await;

    let state = patient
        .handle
        .wait_for_state(|s| matches!(s, SessionState::Failed(_)))
        .await
        .unwrap();
    assert_eq!(
        state,
        SessionState::Failed(SessionFailure::JoinRejected {
            code: 426,
            reason: "No such room".to_string(),
        })
    );

    let again = patient.handle.join(ROOM, "Patient", Role::Patient).await;
    assert!(matches!(again, Err(ScError::InvalidState { .. })));

    patient.handle.leave().await.unwrap();
    assert_eq!(patient.handle.state(), SessionState::Idle);
    assert_eq!(gateway.live_handles(), 0);
    assert_eq!(gateway.live_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tracks_found_by_receiver_polling() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder()
        .track_delivery(TrackDelivery::ReceiversOnly)
        .build();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;

    let snapshot = doctor.wait_until_ready(patient_feed).await;
    assert_eq!(snapshot.subscriptions[0].audio_tracks, 1);
    assert_eq!(snapshot.subscriptions[0].video_tracks, 1);
    assert!(!snapshot.subscriptions[0].polling);
}

#[tokio::test(start_paused = true)]
async fn test_withheld_media_reported_after_polling() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder()
        .track_delivery(TrackDelivery::Withheld)
        .build();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;
    let config = SessionConfig {
        track_poll: TrackPollConfig {
            max_checks: 3,
            ..TrackPollConfig::default()
        },
        ..quiet_config()
    };
    let doctor = Participant::joined(&gateway, config, "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;

    doctor
        .wait_for_notification(|n| {
            matches!(
                n,
                SessionNotification::NoMediaReceived { peer_id } if *peer_id == patient_feed
            )
        })
        .await;
    let snapshot = doctor.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.subscriptions.len(), 1);
    assert!(!snapshot.subscriptions[0].ready);
    assert_eq!(snapshot.subscriptions[0].audio_tracks, 0);
    assert_eq!(doctor.count(is_ready_for(patient_feed)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tracks_reported_on_every_path_are_counted_once() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder()
        .track_delivery(TrackDelivery::All)
        .build();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;
    doctor.wait_until_ready(patient_feed).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    let snapshot = doctor.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.subscriptions[0].audio_tracks, 1);
    assert_eq!(snapshot.subscriptions[0].video_tracks, 1);
    assert_eq!(doctor.count(is_ready_for(patient_feed)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_level_reports_make_participant_ready() {
    init_test_tracing();
    for delivery in [TrackDelivery::StreamEvents, TrackDelivery::RemoteStream] {
        let gateway = LoopbackGateway::builder().track_delivery(delivery).build();
        let (_patient, patient_feed) = publishing_patient(&gateway).await;
        let doctor =
            Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
        doctor.wait_until_active().await;

        let snapshot = doctor.wait_until_ready(patient_feed).await;
        assert_eq!(snapshot.subscriptions[0].video_tracks, 1, "{delivery}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_subscribed_replaces_live_subscription() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder()
        .track_delivery(TrackDelivery::Withheld)
        .build();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;
    let config = SessionConfig {
        track_poll: TrackPollConfig {
            max_checks: 3,
            ..TrackPollConfig::default()
        },
        ..quiet_config()
    };
    let doctor = Participant::joined(&gateway, config, "Dr. Grey", Role::Doctor).await;
    let doctor_feed = doctor.wait_until_active().await;
    let publishers = [patient_feed, doctor_feed];
    doctor
        .wait_for_snapshot(|s| s.subscriptions.iter().any(|sub| sub.polling))
        .await;
    assert_eq!(subscriber_joins(&gateway, &publishers).len(), 1);

    doctor.handle.connect_to_peer(patient_feed).await.unwrap();
    let snapshot = doctor
        .wait_for_snapshot(|s| s.subscriptions.iter().any(|sub| sub.polling))
        .await;
    assert_eq!(snapshot.subscriptions.len(), 1);
    let joins = subscriber_joins(&gateway, &publishers);
    assert_eq!(joins.len(), 2);
    assert_ne!(joins[0], joins[1]);

    doctor
        .wait_for_notification(|n| matches!(n, SessionNotification::NoMediaReceived { .. }))
        .await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    // The first subscriber is detached and its polling never reports.
    assert_eq!(gateway.live_handles(), 3);
    assert_eq!(
        doctor.count(|n| matches!(n, SessionNotification::NoMediaReceived { .. })),
        1
    );
    assert_eq!(doctor.count(is_removed(patient_feed)), 0);
    let snapshot = doctor.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.subscriptions.len(), 1);
    assert_eq!(snapshot.subscriptions[0].audio_tracks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_negotiation_only_drops_that_peer() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder().fail_answer().build();
    let (patient, patient_feed) = publishing_patient(&gateway).await;
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    let doctor_feed = doctor.wait_until_active().await;

    let snapshot = doctor
        .wait_for_snapshot(|s| !s.roster.is_empty() && s.subscriptions.is_empty())
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(snapshot.roster[0].peer_id, patient_feed);
    assert!(!snapshot.roster[0].active);
    assert_eq!(
        doctor.count(|n| {
            matches!(n, SessionNotification::StatusChanged(text) if text.starts_with("Could not"))
        }),
        1
    );
    assert_eq!(doctor.count(is_ready_for(patient_feed)), 0);
    assert_eq!(subscriber_joins(&gateway, &[patient_feed, doctor_feed]).len(), 1);
    // Both publishers remain; the subscriber handle is gone.
    assert_eq!(gateway.live_handles(), 2);
    assert_eq!(doctor.handle.state(), SessionState::Active);
    assert_eq!(patient.handle.state(), SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_gateway_cleanup_tears_down_subscription() {
    init_test_tracing();
    let gateway = LoopbackGateway::default();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    doctor.wait_until_active().await;
    doctor.wait_until_ready(patient_feed).await;
    let view = doctor.ready_view(patient_feed);
    assert_eq!(view.len(), 2);
    assert_eq!(gateway.live_handles(), 3);

    assert_eq!(gateway.hang_up_subscribers(patient_feed), 1);
    doctor.wait_for_notification(is_removed(patient_feed)).await;
    let snapshot = doctor.wait_for_snapshot(|s| s.subscriptions.is_empty()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(snapshot.state, SessionState::Active);
    // The patient still publishes; only the subscription went away.
    assert_eq!(snapshot.roster.len(), 1);
    assert!(!snapshot.roster[0].active);
    assert!(view.is_empty());
    assert_eq!(doctor.count(is_removed(patient_feed)), 1);
    assert_eq!(gateway.feeds(ROOM).len(), 2);
    assert_eq!(gateway.live_handles(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_denied_camera_still_joins_and_discovers() {
    init_test_tracing();
    let gateway = LoopbackGateway::builder().suppress_join_publishers().build();
    let doctor = Participant::joined(&gateway, quiet_config(), "Dr. Grey", Role::Doctor).await;
    let doctor_feed = doctor.wait_until_active().await;
    doctor.handle.publish().await.unwrap();
    doctor
        .wait_for_notification(|n| matches!(n, SessionNotification::LocalStreamReady(_)))
        .await;

    let patient =
        Participant::spawn_with_capture(&gateway, quiet_config(), LoopbackCapture::denied());
    patient
        .handle
        .join(ROOM, "Patient", Role::Patient)
        .await
        .unwrap();
    let patient_feed = patient.wait_until_active().await;

    let snapshot = patient
        .wait_for_snapshot(|s| s.roster.iter().any(|p| p.peer_id == doctor_feed))
        .await;
    assert_eq!(snapshot.state, SessionState::Active);
    assert!(!snapshot.local_stream);
    assert_eq!(snapshot.discovery, DiscoveryStatus::Converged { attempts: 1 });
    assert_eq!(requests_from(&gateway, patient_feed, "listparticipants"), 1);
    assert_eq!(requests_from(&gateway, patient_feed, "configure"), 0);
    assert_eq!(
        patient.count(|n| matches!(n, SessionNotification::LocalStreamReady(_))),
        0
    );
    assert_eq!(
        patient.count(|n| matches!(n, SessionNotification::StateChanged(SessionState::Failed(_)))),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_reader_still_gets_ready_and_removed() {
    init_test_tracing();
    let gateway = LoopbackGateway::default();
    let (_patient, patient_feed) = publishing_patient(&gateway).await;
    let config = SessionConfig {
        notification_buffer: 1,
        ..quiet_config()
    };
    let (handle, mut notifications, _task) = SessionActor::spawn(
        config,
        Arc::new(gateway.clone()),
        Arc::new(LoopbackCapture::new()),
        CancellationToken::new(),
    );

    // Nothing reads notifications until the session is done.
    handle.join(ROOM, "Dr. Grey", Role::Doctor).await.unwrap();
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            let snapshot = handle.snapshot().await.unwrap();
            if snapshot.subscriptions.iter().any(|sub| sub.ready) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscription never became ready");
    handle.leave().await.unwrap();

    let mut received = Vec::new();
    while let Ok(Some(notification)) =
        tokio::time::timeout(Duration::from_secs(5), notifications.recv()).await
    {
        received.push(notification);
    }

    let count = |predicate: &dyn Fn(&SessionNotification) -> bool| {
        received.iter().filter(|n| predicate(n)).count()
    };
    assert_eq!(count(&is_ready_for(patient_feed)), 1);
    assert_eq!(count(&is_removed(patient_feed)), 1);
    let states: Vec<SessionState> = received
        .iter()
        .filter_map(|n| match n {
            SessionNotification::StateChanged(state) => Some(state.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(states.first(), Some(&SessionState::Connecting));
    assert!(states.contains(&SessionState::Active));
    assert_eq!(states.last(), Some(&SessionState::Idle));
}
