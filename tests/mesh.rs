//! Several sessions meeting through the relay's routing, with attendance
//! shared in memory.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;

use meshmeet::events::{EventReceiver, LeaveReason};
use meshmeet::models::{PresenceStatus, SessionSnapshot};
use meshmeet::peer::TransportState;
use meshmeet::presence::MemoryPresenceStore;
use meshmeet::signaling::ReconnectPolicy;
use meshmeet::testing::{FakeCaptureBackend, FakePeerConnector, LocalRelay, TransportCall};
use meshmeet::{SessionConfig, SessionDeps, SessionEvent, SessionHandle};

const WAIT: Duration = Duration::from_secs(10);

struct Meeting {
    presence: Arc<MemoryPresenceStore>,
    relay: LocalRelay,
}

struct Member {
    session: SessionHandle,
    peers: FakePeerConnector,
}

impl Meeting {
    fn new() -> Self {
        let presence = Arc::new(MemoryPresenceStore::new());
        let relay = LocalRelay::new(presence.clone());
        Self { presence, relay }
    }

    async fn join(&self, id: &str) -> Member {
        let peers = FakePeerConnector::new();
        let deps = SessionDeps {
            presence: self.presence.clone(),
            signaling: Arc::new(self.relay.clone()),
            peers: Arc::new(peers.clone()),
            capture: Arc::new(FakeCaptureBackend::new()),
        };
        let config = SessionConfig {
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(20), 10),
            poll_interval: Duration::from_millis(50),
            ..SessionConfig::new("m1", id)
        };
        let session = SessionHandle::start(config, deps).await.unwrap();
        Member { session, peers }
    }

    async fn status_of(&self, id: &str) -> Option<PresenceStatus> {
        self.presence.status_of(&"m1".into(), &id.into()).await
    }
}

fn ids(list: &[meshmeet::models::ParticipantId]) -> Vec<&str> {
    list.iter().map(|id| id.as_str()).collect()
}

async fn wait_for(member: &Member, pred: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
    let mut state = member.session.watch_state();
    let snapshot = tokio::time::timeout(WAIT, state.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for session state")
        .expect("session state dropped")
        .clone();
    snapshot
}

/// Wait until `member` is connected to exactly `expected` (sorted).
async fn wait_connected(member: &Member, expected: &[&str]) {
    wait_for(member, |s| ids(&s.connected_peers) == expected).await;
}

async fn wait_left(events: &mut EventReceiver, id: &str) -> LeaveReason {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ParticipantLeft { participant_id, reason }) if participant_id.as_str() == id => {
                    return reason
                }
                Ok(_) => continue,
                Err(e) => panic!("event bus failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for the participant to leave")
}

/// `ParticipantLeft` events already on the bus.
fn departures(events: &mut EventReceiver) -> Vec<(String, LeaveReason)> {
    let mut left = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SessionEvent::ParticipantLeft { participant_id, reason }) => {
                left.push((participant_id.to_string(), reason))
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return left,
        }
    }
}

#[tokio::test]
async fn three_participants_form_a_full_mesh() {
    let meeting = Meeting::new();
    let alice = meeting.join("alice").await;
    let bob = meeting.join("bob").await;
    let carol = meeting.join("carol").await;

    wait_connected(&alice, &["bob", "carol"]).await;
    wait_connected(&bob, &["alice", "carol"]).await;
    wait_connected(&carol, &["alice", "bob"]).await;

    assert_eq!(
        ids(&meeting.relay.state().members(&"m1".into()).await),
        vec!["alice", "bob", "carol"]
    );

    for member in [&alice, &bob, &carol] {
        member.session.leave().await.unwrap();
    }
}

#[tokio::test]
async fn only_the_present_participant_offers() {
    let meeting = Meeting::new();
    let alice = meeting.join("alice").await;
    let bob = meeting.join("bob").await;

    wait_connected(&alice, &["bob"]).await;
    wait_connected(&bob, &["alice"]).await;

    let (_, alice_to_bob) = alice.peers.transport_for(&"bob".into()).unwrap();
    assert!(alice_to_bob.calls().contains(&TransportCall::CreateOffer));

    let (_, bob_to_alice) = bob.peers.transport_for(&"alice".into()).unwrap();
    let calls = bob_to_alice.calls();
    assert!(calls.contains(&TransportCall::CreateAnswer));
    assert!(!calls.contains(&TransportCall::CreateOffer));

    alice.session.leave().await.unwrap();
    bob.session.leave().await.unwrap();
}

#[tokio::test]
async fn a_failed_link_drops_only_that_peer() {
    let meeting = Meeting::new();
    let alice = meeting.join("alice").await;
    let bob = meeting.join("bob").await;
    let carol = meeting.join("carol").await;
    wait_connected(&alice, &["bob", "carol"]).await;
    wait_connected(&bob, &["alice", "carol"]).await;
    wait_connected(&carol, &["alice", "bob"]).await;

    let (carol_generation, _) = alice.peers.transport_for(&"carol".into()).unwrap();
    let mut events = alice.session.subscribe();
    assert!(alice.peers.report_state(&"bob".into(), TransportState::Failed).await);

    assert_eq!(wait_left(&mut events, "bob").await, LeaveReason::ConnectionLost);
    let (generation, _) = alice.peers.transport_for(&"carol".into()).unwrap();
    assert_eq!(generation, carol_generation);

    // Bob is still in attendance, so reconciliation links him again.
    wait_connected(&alice, &["bob", "carol"]).await;
    wait_connected(&bob, &["alice", "carol"]).await;

    for member in [&alice, &bob, &carol] {
        member.session.leave().await.unwrap();
    }
}

#[tokio::test]
async fn leaving_removes_the_participant_everywhere() {
    let meeting = Meeting::new();
    let alice = meeting.join("alice").await;
    let bob = meeting.join("bob").await;
    let carol = meeting.join("carol").await;
    wait_connected(&alice, &["bob", "carol"]).await;
    wait_connected(&carol, &["alice", "bob"]).await;

    bob.session.leave().await.unwrap();

    let snapshot = wait_for(&alice, |s| ids(&s.participants) == ["carol"]).await;
    assert_eq!(ids(&snapshot.connected_peers), vec!["carol"]);
    wait_for(&carol, |s| ids(&s.participants) == ["alice"]).await;
    assert_eq!(meeting.status_of("bob").await, Some(PresenceStatus::Left));

    alice.session.leave().await.unwrap();
    carol.session.leave().await.unwrap();
}

#[tokio::test]
async fn stale_attendance_is_reconciled_away() {
    let meeting = Meeting::new();
    let alice = meeting.join("alice").await;
    let bob = meeting.join("bob").await;
    wait_connected(&alice, &["bob"]).await;

    // Bob vanishes from attendance without any signaling.
    let mut events = alice.session.subscribe();
    meeting
        .presence
        .set_status(&"m1".into(), &"bob".into(), PresenceStatus::Disconnected)
        .await;
    assert_eq!(wait_left(&mut events, "bob").await, LeaveReason::Reconciliation);
    wait_for(&alice, |s| s.participants.is_empty()).await;

    alice.session.leave().await.unwrap();
    bob.session.cancel();
}

#[tokio::test]
async fn the_mesh_survives_a_relay_outage() {
    let meeting = Meeting::new();
    let alice = meeting.join("alice").await;
    let bob = meeting.join("bob").await;
    wait_connected(&alice, &["bob"]).await;
    wait_connected(&bob, &["alice"]).await;

    let (alice_generation, _) = alice.peers.transport_for(&"bob".into()).unwrap();
    let (bob_generation, _) = bob.peers.transport_for(&"alice".into()).unwrap();
    let links_built = (alice.peers.connect_count(), bob.peers.connect_count());
    let mut alice_events = alice.session.subscribe();
    let mut bob_events = bob.session.subscribe();

    meeting.relay.drop_connections();

    tokio::time::timeout(WAIT, async {
        loop {
            let members = meeting.relay.state().members(&"m1".into()).await;
            if ids(&members) == ["alice", "bob"] && meeting.relay.connect_count() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("both clients should reconnect");
    // Let the re-announcements and a few attendance polls land.
    tokio::time::sleep(Duration::from_millis(300)).await;

    wait_connected(&alice, &["bob"]).await;
    wait_connected(&bob, &["alice"]).await;
    assert_eq!(meeting.status_of("alice").await, Some(PresenceStatus::Joined));
    assert_eq!(meeting.status_of("bob").await, Some(PresenceStatus::Joined));

    // The media links were never touched.
    assert_eq!(alice.peers.transport_for(&"bob".into()).unwrap().0, alice_generation);
    assert_eq!(bob.peers.transport_for(&"alice".into()).unwrap().0, bob_generation);
    assert_eq!((alice.peers.connect_count(), bob.peers.connect_count()), links_built);
    for events in [&mut alice_events, &mut bob_events] {
        assert!(departures(events).is_empty());
    }

    alice.session.leave().await.unwrap();
    bob.session.leave().await.unwrap();
}
