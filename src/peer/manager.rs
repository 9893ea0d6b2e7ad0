use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PeerError;
use crate::events::{EventSender, LeaveReason, SessionEvent};
use crate::media::OutgoingTracks;
use crate::models::{MediaFlags, MeetingId, Participant, ParticipantId};
use crate::peer::{
    LinkContext, LinkState, Negotiation, NegotiationRole, PeerConnector, PeerEvent, PeerLink,
};
use crate::roster::{Roster, Upsert};
use crate::signaling::{SignalingEnvelope, SignalingSender};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub meeting_id: MeetingId,
    pub local_id: ParticipantId,
    /// Soft cap on simultaneous links.
    pub max_peers: usize,
}

enum OfferAction {
    /// Unknown sender: admit as a Responder, then answer.
    Admit,
    Answer,
    /// Replace the current link with a fresh Responder, then answer.
    Recycle,
    Ignore,
}

/// Owns the roster and every `PeerLink`. The only place that adds or removes
/// links.
pub struct PeerConnectionManager {
    config: ManagerConfig,
    connector: Arc<dyn PeerConnector>,
    signaling: SignalingSender,
    events: EventSender,
    peer_events: mpsc::Sender<PeerEvent>,
    roster: Roster,
    links: HashMap<ParticipantId, PeerLink>,
    tracks: OutgoingTracks,
    next_generation: u64,
}

impl PeerConnectionManager {
    pub fn new(
        config: ManagerConfig,
        connector: Arc<dyn PeerConnector>,
        signaling: SignalingSender,
        events: EventSender,
        peer_events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            config,
            connector,
            signaling,
            events,
            peer_events,
            roster: Roster::default(),
            links: HashMap::new(),
            tracks: OutgoingTracks::default(),
            next_generation: 1,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn link_state(&self, id: &ParticipantId) -> Option<LinkState> {
        self.links.get(id).map(PeerLink::state)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Participants whose link is negotiating or connected.
    pub fn live_peers(&self) -> Vec<ParticipantId> {
        self.peers_where(|link| link.state().is_live())
    }

    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        self.peers_where(|link| link.state() == LinkState::Connected)
    }

    fn peers_where(&self, pred: impl Fn(&PeerLink) -> bool) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self
            .links
            .values()
            .filter(|link| pred(link))
            .map(|link| link.participant_id().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn tracks(&self) -> &OutgoingTracks {
        &self.tracks
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn send(&self, envelope: SignalingEnvelope) {
        let kind = envelope.kind();
        if let Err(e) = self.signaling.send(envelope).await {
            warn!(kind, "Failed to queue signaling envelope: {}", e);
        }
    }

    // ============================================================
    // Participant lifecycle
    // ============================================================

    /// Idempotent: an existing link is left alone, except that an Idle link
    /// re-announced as Initiator starts offering (both sides were seeded as
    /// Responders by their initial polls). A Responder-built transport is
    /// rebuilt as Initiator first so the offer carries the frame channel.
    pub async fn on_participant_joined(&mut self, participant: Participant, role: NegotiationRole) {
        let id = participant.id.clone();
        if id == self.config.local_id {
            return;
        }

        if let Some((state, built_as)) = self.links.get(&id).map(|link| (link.state(), link.role())) {
            if role != NegotiationRole::Initiator || state != LinkState::Idle {
                debug!(participant = %id, %state, "Duplicate join ignored");
                return;
            }
            debug!(participant = %id, "Idle link re-announced, offering");
            if built_as == NegotiationRole::Responder {
                if let Err(e) = self.recycle(&id, NegotiationRole::Initiator).await {
                    warn!(participant = %id, "Could not recreate peer link: {}", e);
                    self.drop_unlinked(id);
                    return;
                }
            }
            self.send_offer(&id).await;
            return;
        }

        if !self.admit(participant, role).await {
            return;
        }
        if role == NegotiationRole::Initiator {
            self.send_offer(&id).await;
        }
    }

    /// A relay announcement means the remote has a fresh signaling
    /// connection, so an offer still awaiting its answer may have been
    /// dropped before the remote was registered. It is restarted; a
    /// connected link is kept.
    async fn on_user_joined(&mut self, id: ParticipantId, display_name: Option<String>) {
        let pending = matches!(
            self.links.get(&id).map(PeerLink::state),
            Some(LinkState::Negotiating(Negotiation::Offering))
        );
        if !pending {
            let participant = Participant::observed(id, display_name, Utc::now());
            self.on_participant_joined(participant, NegotiationRole::Initiator)
                .await;
            return;
        }

        debug!(participant = %id, "Participant re-announced mid-offer, restarting negotiation");
        if let Err(e) = self.recycle(&id, NegotiationRole::Initiator).await {
            warn!(participant = %id, "Could not recreate peer link: {}", e);
            self.drop_unlinked(id);
            return;
        }
        self.send_offer(&id).await;
    }

    /// Insert the roster entry and its link together. Returns `false` if the
    /// participant could not be linked.
    async fn admit(&mut self, participant: Participant, role: NegotiationRole) -> bool {
        let id = participant.id.clone();
        if self.links.len() >= self.config.max_peers {
            warn!(
                participant = %id,
                max_peers = self.config.max_peers,
                "Mesh is full, ignoring participant"
            );
            return false;
        }
        if let Err(e) = self.open_link(&id, role).await {
            warn!(participant = %id, "Could not create peer link: {}", e);
            return false;
        }
        info!(participant = %id, ?role, "Participant joined");
        self.roster.upsert(participant.clone());
        self.emit(SessionEvent::ParticipantJoined(participant));
        true
    }

    async fn open_link(&mut self, id: &ParticipantId, role: NegotiationRole) -> Result<(), PeerError> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let transport = self
            .connector
            .connect(LinkContext {
                participant_id: id.clone(),
                generation,
                role,
                tracks: self.tracks.clone(),
                events: self.peer_events.clone(),
            })
            .await?;
        let link = PeerLink::new(id.clone(), generation, role, transport, self.tracks.clone());
        self.links.insert(id.clone(), link);
        Ok(())
    }

    /// Replace a participant's link with a fresh one, keeping the roster
    /// entry.
    async fn recycle(&mut self, id: &ParticipantId, role: NegotiationRole) -> Result<(), PeerError> {
        if let Some(mut old) = self.links.remove(id) {
            debug!(participant = %id, generation = old.generation(), "Recycling peer link");
            old.close().await;
        }
        self.open_link(id, role).await
    }

    /// Forget a participant whose link could not be recreated.
    fn drop_unlinked(&mut self, id: ParticipantId) {
        self.links.remove(&id);
        self.roster.remove(&id);
        self.emit(SessionEvent::ParticipantLeft {
            participant_id: id,
            reason: LeaveReason::ConnectionLost,
        });
    }

    /// No-op for unknown ids. Returns whether anything was removed.
    pub async fn on_participant_left(&mut self, id: &ParticipantId, reason: LeaveReason) -> bool {
        let Some(mut link) = self.links.remove(id) else {
            debug!(participant = %id, "Leave for unknown participant ignored");
            return false;
        };
        link.close().await;
        self.roster.remove(id);
        info!(participant = %id, ?reason, "Participant left");
        self.emit(SessionEvent::ParticipantLeft {
            participant_id: id.clone(),
            reason,
        });
        true
    }

    /// Signaling carries no server timestamp, so the entry keeps the stamp of
    /// its newest attendance record: a later record still wins, an older
    /// one never does.
    pub fn on_media_update(&mut self, id: &ParticipantId, flags: MediaFlags) {
        let Some(existing) = self.roster.get(id) else {
            debug!(participant = %id, "Media update for unknown participant ignored");
            return;
        };
        let mut next = existing.clone();
        next.media = flags;
        next.seen_at = Utc::now();
        self.apply_update(next);
    }

    /// Last-write-wins update of an existing roster entry.
    pub fn apply_update(&mut self, participant: Participant) {
        if !self.roster.contains(&participant.id) {
            return;
        }
        let id = participant.id.clone();
        if self.roster.upsert(participant) == Upsert::Updated {
            if let Some(updated) = self.roster.get(&id) {
                self.emit(SessionEvent::ParticipantUpdated(updated.clone()));
            }
        }
    }

    // ============================================================
    // Signaling
    // ============================================================

    pub async fn on_signaling_envelope(&mut self, envelope: SignalingEnvelope) {
        if *envelope.meeting_id() != self.config.meeting_id {
            debug!(kind = envelope.kind(), meeting = %envelope.meeting_id(), "Envelope for another meeting dropped");
            return;
        }
        if let Some(to) = envelope.recipient() {
            if *to != self.config.local_id {
                debug!(kind = envelope.kind(), to = %to, "Envelope for another participant dropped");
                return;
            }
        }

        match envelope {
            SignalingEnvelope::Offer { from, sdp, .. } => self.handle_offer(from, sdp).await,
            SignalingEnvelope::Answer { from, sdp, .. } => self.handle_answer(from, sdp).await,
            SignalingEnvelope::IceCandidate { from, candidate, .. } => {
                self.handle_candidate(from, candidate).await
            }
            SignalingEnvelope::UserJoined {
                participant_id,
                display_name,
                ..
            } => {
                self.on_user_joined(participant_id, display_name).await;
            }
            SignalingEnvelope::UserLeft { participant_id, .. } => {
                self.on_participant_left(&participant_id, LeaveReason::Signaling)
                    .await;
            }
            SignalingEnvelope::MediaUpdate {
                participant_id,
                has_audio,
                has_video,
                hand_raised,
                ..
            } => {
                let flags = MediaFlags {
                    has_audio,
                    has_video,
                    hand_raised,
                };
                self.on_media_update(&participant_id, flags);
            }
            SignalingEnvelope::Join { .. } => {
                debug!("Join envelope from relay ignored");
            }
        }
    }

    async fn send_offer(&mut self, id: &ParticipantId) {
        let Some(link) = self.links.get_mut(id) else {
            return;
        };
        match link.start_offer().await {
            Ok(sdp) => {
                let state = link.state();
                self.send(SignalingEnvelope::Offer {
                    meeting_id: self.config.meeting_id.clone(),
                    from: self.config.local_id.clone(),
                    to: id.clone(),
                    sdp,
                })
                .await;
                self.emit(SessionEvent::PeerStateChanged {
                    participant_id: id.clone(),
                    state,
                });
            }
            Err(e) => {
                warn!(participant = %id, "Failed to create offer: {}", e);
                self.on_participant_left(id, LeaveReason::ConnectionLost).await;
            }
        }
    }

    async fn handle_offer(&mut self, from: ParticipantId, sdp: Value) {
        if from == self.config.local_id {
            return;
        }
        let action = match self.links.get(&from).map(PeerLink::state) {
            None => OfferAction::Admit,
            Some(LinkState::Idle) => OfferAction::Answer,
            Some(LinkState::Negotiating(Negotiation::Offering)) => {
                // Polite peer: the greater id abandons its own offer.
                if self.config.local_id > from {
                    info!(participant = %from, "Offer glare, yielding to remote offer");
                    OfferAction::Recycle
                } else {
                    debug!(participant = %from, "Offer glare, keeping local offer");
                    OfferAction::Ignore
                }
            }
            Some(LinkState::Negotiating(Negotiation::Answering)) => OfferAction::Ignore,
            Some(_) => OfferAction::Recycle,
        };

        match action {
            OfferAction::Ignore => return,
            OfferAction::Answer => {}
            OfferAction::Admit => {
                let participant = Participant::observed(from.clone(), None, Utc::now());
                if !self.admit(participant, NegotiationRole::Responder).await {
                    return;
                }
            }
            OfferAction::Recycle => {
                if let Err(e) = self.recycle(&from, NegotiationRole::Responder).await {
                    warn!(participant = %from, "Could not recreate peer link: {}", e);
                    self.drop_unlinked(from);
                    return;
                }
            }
        }

        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        match link.handle_offer(sdp).await {
            Ok(answer) => {
                let state = link.state();
                self.send(SignalingEnvelope::Answer {
                    meeting_id: self.config.meeting_id.clone(),
                    from: self.config.local_id.clone(),
                    to: from.clone(),
                    sdp: answer,
                })
                .await;
                self.emit(SessionEvent::PeerStateChanged {
                    participant_id: from,
                    state,
                });
            }
            Err(e) => {
                warn!(participant = %from, "Failed to answer offer: {}", e);
                self.on_participant_left(&from, LeaveReason::ConnectionLost).await;
            }
        }
    }

    async fn handle_answer(&mut self, from: ParticipantId, sdp: Value) {
        let Some(link) = self.links.get_mut(&from) else {
            debug!(participant = %from, "Answer from unknown participant dropped");
            return;
        };
        match link.handle_answer(sdp).await {
            Ok(()) => {
                let state = link.state();
                self.emit(SessionEvent::PeerStateChanged {
                    participant_id: from,
                    state,
                });
            }
            Err(e @ PeerError::UnexpectedMessage { .. }) => {
                debug!(participant = %from, "Dropping answer: {}", e);
            }
            Err(e) => {
                warn!(participant = %from, "Failed to apply answer: {}", e);
                self.on_participant_left(&from, LeaveReason::ConnectionLost).await;
            }
        }
    }

    async fn handle_candidate(&mut self, from: ParticipantId, candidate: Value) {
        let Some(link) = self.links.get_mut(&from) else {
            debug!(participant = %from, "ICE candidate from unknown participant dropped");
            return;
        };
        if let Err(e) = link.handle_candidate(candidate).await {
            warn!(participant = %from, "ICE candidate rejected: {}", e);
        }
    }

    // ============================================================
    // Transport events
    // ============================================================

    pub async fn on_transport_event(&mut self, event: PeerEvent) {
        let id = event.participant_id().clone();
        let Some(link) = self.links.get_mut(&id) else {
            debug!(participant = %id, "Transport event for unknown participant dropped");
            return;
        };
        if link.generation() != event.generation() {
            debug!(
                participant = %id,
                generation = event.generation(),
                current = link.generation(),
                "Stale transport event dropped"
            );
            return;
        }

        match event {
            PeerEvent::LocalCandidate { candidate, .. } => {
                self.send(SignalingEnvelope::IceCandidate {
                    meeting_id: self.config.meeting_id.clone(),
                    from: self.config.local_id.clone(),
                    to: id,
                    candidate,
                })
                .await;
            }
            PeerEvent::StateChanged { state, .. } => {
                let lost = link.on_transport_state(state);
                let link_state = link.state();
                debug!(participant = %id, transport = ?state, link = %link_state, "Transport state changed");
                self.emit(SessionEvent::PeerStateChanged {
                    participant_id: id.clone(),
                    state: link_state,
                });
                if lost {
                    info!(participant = %id, "Peer connection lost");
                    self.on_participant_left(&id, LeaveReason::ConnectionLost).await;
                }
            }
            PeerEvent::RemoteTrack { track, .. } => {
                self.emit(SessionEvent::RemoteTrack {
                    participant_id: id,
                    track,
                });
            }
            PeerEvent::RemoteFrame { kind, data, .. } => {
                self.emit(SessionEvent::RemoteFrame {
                    participant_id: id,
                    kind,
                    data,
                });
            }
        }
    }

    // ============================================================
    // Media
    // ============================================================

    /// Remember `tracks` for future links and swap them on every open link.
    pub async fn replace_tracks(&mut self, tracks: OutgoingTracks) {
        for link in self.links.values_mut() {
            match link.replace_tracks(&tracks).await {
                Ok(true) => debug!(participant = %link.participant_id(), "Outgoing tracks replaced"),
                Ok(false) => {}
                Err(e) => warn!(participant = %link.participant_id(), "Track replacement failed: {}", e),
            }
        }
        self.tracks = tracks;
    }

    pub async fn close_all(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.close().await;
        }
        self.roster.clear();
        self.tracks = OutgoingTracks::default();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::{create_event_bus, EventReceiver};
    use crate::peer::TransportState;
    use crate::testing::{FakePeerConnector, TransportCall};
    use serde_json::json;

    struct Harness {
        manager: PeerConnectionManager,
        connector: FakePeerConnector,
        outbound: mpsc::Receiver<SignalingEnvelope>,
        _events: EventReceiver,
    }

    fn harness(local: &str) -> Harness {
        harness_with_cap(local, 8)
    }

    fn harness_with_cap(local: &str, max_peers: usize) -> Harness {
        let connector = FakePeerConnector::new();
        let (sig_tx, outbound) = mpsc::channel(64);
        let (events, rx) = create_event_bus();
        let (peer_tx, _peer_rx) = mpsc::channel(64);
        let manager = PeerConnectionManager::new(
            ManagerConfig {
                meeting_id: "m1".into(),
                local_id: local.into(),
                max_peers,
            },
            Arc::new(connector.clone()),
            SignalingSender::new(sig_tx),
            events,
            peer_tx,
        );
        Harness {
            manager,
            connector,
            outbound,
            _events: rx,
        }
    }

    fn participant(id: &str) -> Participant {
        Participant::observed(id.into(), None, Utc::now())
    }

    fn offer(from: &str, to: &str) -> SignalingEnvelope {
        SignalingEnvelope::Offer {
            meeting_id: "m1".into(),
            from: from.into(),
            to: to.into(),
            sdp: json!({"type": "offer", "sdp": format!("from {from}")}),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<SignalingEnvelope>) -> Vec<SignalingEnvelope> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            out.push(env);
        }
        out
    }

    #[tokio::test]
    async fn duplicate_join_keeps_a_single_link() {
        let mut h = harness("alice");
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Initiator)
            .await;
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Initiator)
            .await;

        assert_eq!(h.manager.link_count(), 1);
        assert_eq!(h.connector.connect_count(), 1);
        let offers = drain(&mut h.outbound)
            .into_iter()
            .filter(|e| e.kind() == "offer")
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn leave_for_unknown_participant_is_a_no_op() {
        let mut h = harness("alice");
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Responder)
            .await;
        assert!(!h.manager.on_participant_left(&"carol".into(), LeaveReason::Signaling).await);
        assert_eq!(h.manager.link_count(), 1);
        assert_eq!(h.manager.roster().len(), 1);
    }

    #[tokio::test]
    async fn responder_does_not_offer() {
        let mut h = harness("alice");
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Responder)
            .await;
        assert_eq!(h.manager.link_state(&"bob".into()), Some(LinkState::Idle));
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn idle_responder_reannounced_starts_offering() {
        let mut h = harness("alice");
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Responder)
            .await;
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Initiator)
            .await;
        assert_eq!(
            h.manager.link_state(&"bob".into()),
            Some(LinkState::Negotiating(Negotiation::Offering))
        );
        // The Responder transport is replaced by one built to offer.
        assert_eq!(h.connector.connect_count(), 2);
        assert_eq!(h.connector.role_of(&"bob".into()), Some(NegotiationRole::Initiator));
        let (_, first) = h.connector.transports_for(&"bob".into())[0].clone();
        assert!(first.calls().contains(&TransportCall::Close));
        assert!(!first.calls().contains(&TransportCall::CreateOffer));
        let sent = drain(&mut h.outbound);
        assert!(matches!(&sent[..], [SignalingEnvelope::Offer { .. }]));
        assert!(h.manager.roster().contains(&"bob".into()));
    }

    #[tokio::test]
    async fn relay_announcement_mid_offer_restarts_the_offer() {
        let mut h = harness("alice");
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Initiator)
            .await;
        drain(&mut h.outbound);

        let announce = SignalingEnvelope::UserJoined {
            meeting_id: "m1".into(),
            participant_id: "bob".into(),
            display_name: None,
        };
        h.manager.on_signaling_envelope(announce.clone()).await;
        assert_eq!(h.connector.connect_count(), 2);
        let sent = drain(&mut h.outbound);
        assert!(matches!(&sent[..], [SignalingEnvelope::Offer { to, .. }] if to.as_str() == "bob"));

        // Once connected, further announcements leave the link alone.
        let answer = SignalingEnvelope::Answer {
            meeting_id: "m1".into(),
            from: "bob".into(),
            to: "alice".into(),
            sdp: json!({"type": "answer", "sdp": "from bob"}),
        };
        h.manager.on_signaling_envelope(answer).await;
        h.manager.on_signaling_envelope(announce).await;
        assert_eq!(h.manager.link_state(&"bob".into()), Some(LinkState::Connected));
        assert_eq!(h.connector.connect_count(), 2);
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn offer_from_unknown_sender_is_answered() {
        let mut h = harness("alice");
        h.manager.on_signaling_envelope(offer("bob", "alice")).await;

        assert_eq!(h.manager.link_state(&"bob".into()), Some(LinkState::Connected));
        assert!(h.manager.roster().contains(&"bob".into()));
        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], SignalingEnvelope::Answer { to, .. } if to.as_str() == "bob"));
    }

    #[tokio::test]
    async fn envelopes_for_someone_else_are_dropped() {
        let mut h = harness("alice");
        h.manager.on_signaling_envelope(offer("bob", "carol")).await;
        assert_eq!(h.manager.link_count(), 0);
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn glare_greater_id_yields() {
        let mut h = harness("bob");
        h.manager
            .on_participant_joined(participant("alice"), NegotiationRole::Initiator)
            .await;
        drain(&mut h.outbound);

        h.manager.on_signaling_envelope(offer("alice", "bob")).await;
        assert_eq!(h.manager.link_state(&"alice".into()), Some(LinkState::Connected));
        assert_eq!(h.connector.connect_count(), 2);
        let sent = drain(&mut h.outbound);
        assert!(matches!(&sent[..], [SignalingEnvelope::Answer { .. }]));
    }

    #[tokio::test]
    async fn glare_smaller_id_keeps_its_offer() {
        let mut h = harness("alice");
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Initiator)
            .await;
        drain(&mut h.outbound);

        h.manager.on_signaling_envelope(offer("bob", "alice")).await;
        assert_eq!(
            h.manager.link_state(&"bob".into()),
            Some(LinkState::Negotiating(Negotiation::Offering))
        );
        assert_eq!(h.connector.connect_count(), 1);
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn stale_generation_events_are_ignored() {
        let mut h = harness("alice");
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Responder)
            .await;
        h.manager.on_signaling_envelope(offer("bob", "alice")).await;
        // Remote restart recycles the link with a new generation.
        h.manager.on_signaling_envelope(offer("bob", "alice")).await;
        assert_eq!(h.connector.connect_count(), 2);

        h.manager
            .on_transport_event(PeerEvent::StateChanged {
                participant_id: "bob".into(),
                generation: 1,
                state: TransportState::Failed,
            })
            .await;
        assert_eq!(h.manager.link_state(&"bob".into()), Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn transport_failure_removes_only_that_peer() {
        let mut h = harness("alice");
        for id in ["bob", "carol"] {
            h.manager
                .on_participant_joined(participant(id), NegotiationRole::Initiator)
                .await;
        }
        let generation = h.connector.transport_for(&"bob".into()).unwrap().0;
        h.manager
            .on_transport_event(PeerEvent::StateChanged {
                participant_id: "bob".into(),
                generation,
                state: TransportState::Failed,
            })
            .await;

        assert_eq!(h.manager.link_state(&"bob".into()), None);
        assert!(!h.manager.roster().contains(&"bob".into()));
        assert_eq!(
            h.manager.link_state(&"carol".into()),
            Some(LinkState::Negotiating(Negotiation::Offering))
        );
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded() {
        let mut h = harness("alice");
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Responder)
            .await;
        h.manager
            .on_transport_event(PeerEvent::LocalCandidate {
                participant_id: "bob".into(),
                generation: 1,
                candidate: json!({"candidate": "c"}),
            })
            .await;
        let sent = drain(&mut h.outbound);
        assert!(matches!(
            &sent[..],
            [SignalingEnvelope::IceCandidate { from, to, .. }] if from.as_str() == "alice" && to.as_str() == "bob"
        ));
    }

    #[tokio::test]
    async fn joins_beyond_the_cap_are_ignored() {
        let mut h = harness_with_cap("alice", 1);
        h.manager
            .on_participant_joined(participant("bob"), NegotiationRole::Responder)
            .await;
        h.manager
            .on_participant_joined(participant("carol"), NegotiationRole::Responder)
            .await;
        assert_eq!(h.manager.link_count(), 1);
        assert!(!h.manager.roster().contains(&"carol".into()));
    }

    #[tokio::test]
    async fn signaled_media_update_applies_and_keeps_the_server_stamp() {
        let mut h = harness("alice");
        let stamp = Utc::now() - chrono::Duration::hours(3);
        let bob = Participant {
            updated_at: stamp,
            ..participant("bob")
        };
        h.manager.on_participant_joined(bob, NegotiationRole::Responder).await;
        let video = MediaFlags {
            has_video: true,
            ..MediaFlags::default()
        };
        h.manager.on_media_update(&"bob".into(), video);
        let bob = h.manager.roster().get(&"bob".into()).unwrap();
        assert!(bob.media.has_video);
        assert_eq!(bob.updated_at, stamp);
    }
}
