//! Single-session behaviour against a scripted relay connection.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use meshmeet::error::{DeviceError, PresenceError, SessionError};
use meshmeet::events::{create_event_bus, EventReceiver};
use meshmeet::media::TrackKind;
use meshmeet::models::{
    AttendanceRecord, MediaFlags, MeetingId, ParticipantId, PresenceStatus, SessionSnapshot, SessionState,
};
use meshmeet::presence::{MemoryPresenceStore, PresenceStore};
use meshmeet::signaling::{ReconnectPolicy, SignalingEnvelope, SignalingStatus};
use meshmeet::testing::{FakeCaptureBackend, FakeConnector, FakePeerConnector, FakeRemote};
use meshmeet::{SessionConfig, SessionDeps, SessionEvent, SessionHandle};

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    presence: Arc<MemoryPresenceStore>,
    signaling: FakeConnector,
    peers: FakePeerConnector,
    capture: FakeCaptureBackend,
}

impl Fixture {
    fn new() -> Self {
        Self {
            presence: Arc::new(MemoryPresenceStore::new()),
            signaling: FakeConnector::new(),
            peers: FakePeerConnector::new(),
            capture: FakeCaptureBackend::new(),
        }
    }

    fn deps(&self) -> SessionDeps {
        SessionDeps {
            presence: self.presence.clone(),
            signaling: Arc::new(self.signaling.clone()),
            peers: Arc::new(self.peers.clone()),
            capture: Arc::new(self.capture.clone()),
        }
    }

    async fn status_of(&self, id: &str) -> Option<PresenceStatus> {
        self.presence.status_of(&"m1".into(), &id.into()).await
    }
}

fn config(id: &str) -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectPolicy::fixed(Duration::from_millis(20), 5),
        // Only the seed poll runs; reconciliation is covered by the mesh tests.
        poll_interval: Duration::from_secs(3600),
        ..SessionConfig::new("m1", id)
    }
}

async fn recv(remote: &mut FakeRemote) -> SignalingEnvelope {
    tokio::time::timeout(WAIT, remote.recv_envelope())
        .await
        .expect("timed out waiting for an envelope")
        .expect("client hung up")
}

async fn recv_kind(remote: &mut FakeRemote, kind: &str) -> SignalingEnvelope {
    loop {
        let envelope = recv(remote).await;
        if envelope.kind() == kind {
            return envelope;
        }
    }
}

async fn wait_for(session: &SessionHandle, pred: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
    let mut state = session.watch_state();
    let snapshot = tokio::time::timeout(WAIT, state.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for session state")
        .expect("session state dropped")
        .clone();
    snapshot
}

fn states(events: &mut EventReceiver) -> Vec<SessionState> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            out.push(state);
        }
    }
    out
}

fn user_joined(id: &str) -> SignalingEnvelope {
    SignalingEnvelope::UserJoined {
        meeting_id: "m1".into(),
        participant_id: id.into(),
        display_name: None,
    }
}

/// Store that refuses every request.
struct UnreachablePresence;

#[async_trait]
impl PresenceStore for UnreachablePresence {
    async fn join(&self, _: &MeetingId, _: &ParticipantId, _: &str, _: MediaFlags) -> Result<(), PresenceError> {
        Err(PresenceError::Status {
            status: 503,
            body: "unavailable".to_string(),
        })
    }

    async fn leave(&self, _: &MeetingId, user_id: &ParticipantId) -> Result<(), PresenceError> {
        Err(PresenceError::ParticipantNotFound(user_id.clone()))
    }

    async fn update_status(&self, _: &MeetingId, user_id: &ParticipantId, _: MediaFlags) -> Result<(), PresenceError> {
        Err(PresenceError::ParticipantNotFound(user_id.clone()))
    }

    async fn list(&self, _: &MeetingId) -> Result<Vec<AttendanceRecord>, PresenceError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn startup_announces_join_then_media_state() {
    let fx = Fixture::new();
    let (events, mut rx) = create_event_bus();
    let session = SessionHandle::start_with_events(config("alice"), fx.deps(), events)
        .await
        .unwrap();

    let mut remote = fx.signaling.next_remote().await;
    match recv(&mut remote).await {
        SignalingEnvelope::Join { participant_id, .. } => assert_eq!(participant_id.as_str(), "alice"),
        other => panic!("expected join, got {other:?}"),
    }
    match recv(&mut remote).await {
        SignalingEnvelope::MediaUpdate {
            has_audio, has_video, ..
        } => {
            assert!(has_audio);
            assert!(!has_video);
        }
        other => panic!("expected media-update, got {other:?}"),
    }

    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Active);
    assert!(snapshot.media.has_audio);
    assert_eq!(fx.status_of("alice").await, Some(PresenceStatus::Joined));
    assert_eq!(fx.capture.acquisitions(TrackKind::Audio), 1);
    assert_eq!(states(&mut rx), vec![SessionState::Joining, SessionState::Active]);

    session.leave().await.unwrap();
}

#[tokio::test]
async fn blank_participant_id_is_rejected_before_any_io() {
    let fx = Fixture::new();
    let err = SessionHandle::start(SessionConfig::new("m1", "  "), fx.deps())
        .await
        .err()
        .expect("start should fail");

    assert!(matches!(err, SessionError::MissingIdentifier("participant id")));
    assert_eq!(fx.signaling.connect_count(), 0);
    assert_eq!(fx.capture.acquisitions(TrackKind::Audio), 0);
}

#[tokio::test]
async fn unreachable_presence_fails_the_join() {
    let fx = Fixture::new();
    let deps = SessionDeps {
        presence: Arc::new(UnreachablePresence),
        ..fx.deps()
    };
    let (events, mut rx) = create_event_bus();
    let err = SessionHandle::start_with_events(config("alice"), deps, events)
        .await
        .err()
        .expect("start should fail");

    assert!(matches!(err, SessionError::Presence(PresenceError::Status { status: 503, .. })));
    assert_eq!(fx.signaling.connect_count(), 0);
    assert_eq!(states(&mut rx), vec![SessionState::Joining, SessionState::Closed]);
}

#[tokio::test]
async fn signaling_failure_at_startup_releases_attendance() {
    let fx = Fixture::new();
    fx.signaling.fail_next(1);

    let err = SessionHandle::start(config("alice"), fx.deps())
        .await
        .err()
        .expect("start should fail");

    assert!(matches!(err, SessionError::Signaling(_)));
    assert_eq!(fx.status_of("alice").await, Some(PresenceStatus::Left));
    assert_eq!(fx.capture.acquisitions(TrackKind::Audio), 0);
}

#[tokio::test]
async fn missing_microphone_does_not_block_the_join() {
    let fx = Fixture::new();
    fx.capture.fail(TrackKind::Audio, DeviceError::NotFound(TrackKind::Audio));

    let session = SessionHandle::start(config("alice"), fx.deps()).await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Active);
    assert!(!snapshot.media.has_audio);

    session.leave().await.unwrap();
}

#[tokio::test]
async fn reconnect_reannounces_current_media_state() {
    let fx = Fixture::new();
    let session = SessionHandle::start(config("alice"), fx.deps()).await.unwrap();
    let mut events = session.subscribe();

    let mut first = fx.signaling.next_remote().await;
    recv_kind(&mut first, "media-update").await;
    session.set_hand_raised(true).await.unwrap();
    match recv(&mut first).await {
        SignalingEnvelope::MediaUpdate { hand_raised, .. } => assert!(hand_raised),
        other => panic!("expected media-update, got {other:?}"),
    }
    first.send_envelope(&user_joined("bob")).await;
    recv_kind(&mut first, "offer").await;

    // Two failed attempts keep the channel down long enough to queue
    // outbound traffic.
    fx.signaling.fail_next(2);
    first.disconnect();
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::Signaling(SignalingStatus::Reconnecting { .. })) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("channel should start reconnecting");
    let candidate = serde_json::json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host"});
    assert!(fx.peers.report_candidate(&"bob".into(), candidate.clone()).await);

    let mut second = fx.signaling.next_remote().await;
    assert!(matches!(recv(&mut second).await, SignalingEnvelope::Join { .. }));
    match recv(&mut second).await {
        SignalingEnvelope::MediaUpdate {
            has_audio,
            has_video,
            hand_raised,
            ..
        } => {
            assert!(has_audio);
            assert!(!has_video);
            assert!(hand_raised);
        }
        other => panic!("expected media-update, got {other:?}"),
    }
    match recv(&mut second).await {
        SignalingEnvelope::IceCandidate { to, candidate: sent, .. } => {
            assert_eq!(to.as_str(), "bob");
            assert_eq!(sent, candidate);
        }
        other => panic!("expected the queued candidate, got {other:?}"),
    }
    assert_eq!(fx.signaling.connect_count(), 4);

    let reconnected = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Signaling(SignalingStatus::Reconnected)) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(reconnected);
    assert_eq!(session.snapshot().state, SessionState::Active);

    session.leave().await.unwrap();
}

#[tokio::test]
async fn relay_announcements_drive_the_roster() {
    let fx = Fixture::new();
    let session = SessionHandle::start(config("alice"), fx.deps()).await.unwrap();
    let mut remote = fx.signaling.next_remote().await;
    recv_kind(&mut remote, "media-update").await;

    // The participant already in the meeting makes the offer.
    remote.send_envelope(&user_joined("bob")).await;
    match recv_kind(&mut remote, "offer").await {
        SignalingEnvelope::Offer { from, to, .. } => {
            assert_eq!(from.as_str(), "alice");
            assert_eq!(to.as_str(), "bob");
        }
        other => panic!("expected offer, got {other:?}"),
    }
    wait_for(&session, |s| s.participants.len() == 1).await;

    // A second announcement for the same participant is a no-op once the
    // link has its answer.
    remote
        .send_envelope(&SignalingEnvelope::Answer {
            meeting_id: "m1".into(),
            from: "bob".into(),
            to: "alice".into(),
            sdp: serde_json::json!({"type": "answer", "sdp": "v=0"}),
        })
        .await;
    wait_for(&session, |s| s.connected_peers.len() == 1).await;
    remote.send_envelope(&user_joined("bob")).await;

    remote
        .send_envelope(&SignalingEnvelope::UserLeft {
            meeting_id: "m1".into(),
            participant_id: "bob".into(),
        })
        .await;
    let snapshot = wait_for(&session, |s| s.participants.is_empty()).await;
    assert!(snapshot.connected_peers.is_empty());
    assert_eq!(fx.peers.connect_count(), 1);

    session.leave().await.unwrap();
}

#[tokio::test]
async fn camera_toggles_while_acquiring_coalesce() {
    let fx = Fixture::new();
    let session = SessionHandle::start(config("alice"), fx.deps()).await.unwrap();
    let mut remote = fx.signaling.next_remote().await;
    recv_kind(&mut remote, "media-update").await;
    remote.send_envelope(&user_joined("bob")).await;
    recv_kind(&mut remote, "offer").await;
    let (_, transport) = fx.peers.transport_for(&"bob".into()).unwrap();

    fx.capture.hold(TrackKind::Camera);
    let capture = fx.capture.clone();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        capture.release(TrackKind::Camera);
    });

    let (on, off, on_again) = tokio::join!(
        session.set_video_enabled(true),
        session.set_video_enabled(false),
        session.set_video_enabled(true),
    );
    releaser.await.unwrap();
    assert!(on.is_ok());
    assert!(off.is_ok());
    assert!(on_again.is_ok());

    assert_eq!(fx.capture.acquisitions(TrackKind::Camera), 1);
    let replaced = transport.replaced_tracks();
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].video.as_ref().map(|t| t.kind()), Some(TrackKind::Camera));
    wait_for(&session, |s| s.media.has_video).await;

    session.leave().await.unwrap();
}

#[tokio::test]
async fn device_errors_are_returned_and_leave_media_unchanged() {
    let fx = Fixture::new();
    let session = SessionHandle::start(config("alice"), fx.deps()).await.unwrap();
    fx.capture.fail(TrackKind::Camera, DeviceError::Denied(TrackKind::Camera));

    let err = session.set_video_enabled(true).await.unwrap_err();
    assert!(matches!(err, SessionError::Device(DeviceError::Denied(TrackKind::Camera))));

    let snapshot = session.snapshot();
    assert!(!snapshot.media.has_video);
    assert!(snapshot.media.has_audio);
    assert_eq!(snapshot.state, SessionState::Active);

    session.leave().await.unwrap();
}

#[tokio::test]
async fn leave_releases_everything_and_is_idempotent() {
    let fx = Fixture::new();
    let (events, mut rx) = create_event_bus();
    let session = SessionHandle::start_with_events(config("alice"), fx.deps(), events)
        .await
        .unwrap();
    let mut remote = fx.signaling.next_remote().await;
    recv_kind(&mut remote, "media-update").await;

    session.leave().await.unwrap();

    assert_eq!(session.snapshot().state, SessionState::Closed);
    assert_eq!(fx.status_of("alice").await, Some(PresenceStatus::Left));
    assert_eq!(fx.capture.stops(TrackKind::Audio), 1);
    assert_eq!(
        states(&mut rx),
        vec![
            SessionState::Joining,
            SessionState::Active,
            SessionState::Leaving,
            SessionState::Closed
        ]
    );
    tokio::time::timeout(WAIT, async { while remote.recv_envelope().await.is_some() {} })
        .await
        .expect("connection should be closed");

    session.leave().await.unwrap();
    assert!(matches!(session.set_audio_enabled(false).await, Err(SessionError::Closed)));
}

#[tokio::test]
async fn cancel_tears_the_session_down() {
    let fx = Fixture::new();
    let session = SessionHandle::start(config("alice"), fx.deps()).await.unwrap();

    session.cancel();
    tokio::time::timeout(WAIT, session.closed()).await.unwrap();
    assert_eq!(fx.status_of("alice").await, Some(PresenceStatus::Left));
}
