//! Development relay: forwards signaling envelopes between the members of a
//! meeting and serves attendance from memory. Media never passes through it.

mod attendance;
mod server;
mod websocket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_DEPARTURE_GRACE;
use crate::models::{MeetingId, ParticipantId, PresenceStatus};
use crate::presence::MemoryPresenceStore;
use crate::signaling::SignalingEnvelope;

pub use server::{build_router, serve, start_relay};

/// Per-connection outbound queue depth.
pub const RELAY_QUEUE: usize = 256;

struct Member {
    conn_id: Uuid,
    tx: mpsc::Sender<String>,
}

type Rooms = HashMap<MeetingId, HashMap<ParticipantId, Member>>;
/// Departures waiting out the grace window, keyed by the closed connection.
type Departures = HashMap<(MeetingId, ParticipantId), (Uuid, CancellationToken)>;

/// One client connection as the relay sees it.
pub struct RelayConnection {
    conn_id: Uuid,
    tx: mpsc::Sender<String>,
    joined: Option<(MeetingId, ParticipantId)>,
}

impl RelayConnection {
    /// `tx` delivers frames to this client.
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            tx,
            joined: None,
        }
    }

    pub fn participant(&self) -> Option<&ParticipantId> {
        self.joined.as_ref().map(|(_, id)| id)
    }
}

#[derive(Clone)]
pub struct RelayState {
    rooms: Arc<Mutex<Rooms>>,
    departures: Arc<Mutex<Departures>>,
    departure_grace: Duration,
    presence: Arc<MemoryPresenceStore>,
}

impl RelayState {
    pub fn new(presence: Arc<MemoryPresenceStore>) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            departures: Arc::new(Mutex::new(HashMap::new())),
            departure_grace: DEFAULT_DEPARTURE_GRACE,
            presence,
        }
    }

    /// A client whose socket drops keeps its place for `grace`; rejoining
    /// within it is not announced as a departure. Zero announces at once.
    pub fn with_departure_grace(mut self, grace: Duration) -> Self {
        self.departure_grace = grace;
        self
    }

    pub fn presence(&self) -> &Arc<MemoryPresenceStore> {
        &self.presence
    }

    /// Ids currently connected to a meeting, sorted.
    pub async fn members(&self, meeting_id: &MeetingId) -> Vec<ParticipantId> {
        let rooms = self.rooms.lock().await;
        let mut ids: Vec<_> = rooms
            .get(meeting_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    async fn is_member(&self, meeting_id: &MeetingId, participant_id: &ParticipantId) -> bool {
        let rooms = self.rooms.lock().await;
        rooms
            .get(meeting_id)
            .is_some_and(|room| room.contains_key(participant_id))
    }

    /// Handle one text frame from `conn`.
    pub async fn on_frame(&self, conn: &mut RelayConnection, text: &str) {
        let envelope = match SignalingEnvelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Relay dropping malformed frame: {}", e);
                return;
            }
        };

        match envelope {
            SignalingEnvelope::Join {
                meeting_id,
                participant_id,
                display_name,
            } => self.join(conn, meeting_id, participant_id, display_name).await,
            SignalingEnvelope::Offer { ref meeting_id, ref to, .. }
            | SignalingEnvelope::Answer { ref meeting_id, ref to, .. }
            | SignalingEnvelope::IceCandidate { ref meeting_id, ref to, .. } => {
                self.forward(meeting_id, to, text, envelope.kind()).await
            }
            SignalingEnvelope::MediaUpdate {
                ref meeting_id,
                ref participant_id,
                ..
            } => {
                if conn.participant() != Some(participant_id) {
                    debug!(participant = %participant_id, "Ignoring media update for another participant");
                    return;
                }
                self.broadcast(meeting_id, participant_id, text.to_string()).await
            }
            SignalingEnvelope::UserJoined { .. } | SignalingEnvelope::UserLeft { .. } => {
                debug!(kind = envelope.kind(), "Ignoring relay-originated envelope from a client");
            }
        }
    }

    /// Unregister `conn` if it is still the registered socket for its
    /// participant. The departure is announced after the grace window
    /// unless the participant rejoins first; a participant whose attendance
    /// already says `left` is announced at once.
    pub async fn on_disconnect(&self, conn: RelayConnection) {
        let Some((meeting_id, participant_id)) = conn.joined else {
            return;
        };
        if !self.unregister(&meeting_id, &participant_id, conn.conn_id).await {
            debug!(participant = %participant_id, "Superseded connection closed");
            return;
        }

        let left = self.presence.status_of(&meeting_id, &participant_id).await == Some(PresenceStatus::Left);
        if left || self.departure_grace.is_zero() {
            self.depart(&meeting_id, &participant_id).await;
            return;
        }

        debug!(participant = %participant_id, grace = ?self.departure_grace, "Connection lost, holding departure");
        let cancel = CancellationToken::new();
        let conn_id = conn.conn_id;
        let key = (meeting_id, participant_id);
        if let Some((_, previous)) = self
            .departures
            .lock()
            .await
            .insert(key.clone(), (conn_id, cancel.clone()))
        {
            previous.cancel();
        }

        let state = self.clone();
        let grace = self.departure_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            let due = {
                let mut departures = state.departures.lock().await;
                match departures.get(&key) {
                    Some((pending, _)) if *pending == conn_id => {
                        departures.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if due && !state.is_member(&key.0, &key.1).await {
                state.depart(&key.0, &key.1).await;
            }
        });
    }

    async fn depart(&self, meeting_id: &MeetingId, participant_id: &ParticipantId) {
        info!(meeting = %meeting_id, participant = %participant_id, "Participant disconnected");
        self.announce_left(meeting_id, participant_id).await;
        self.presence.mark_disconnected(meeting_id, participant_id).await;
    }

    /// Drop a held departure for a participant that came back.
    async fn cancel_departure(&self, meeting_id: &MeetingId, participant_id: &ParticipantId) {
        let key = (meeting_id.clone(), participant_id.clone());
        if let Some((_, cancel)) = self.departures.lock().await.remove(&key) {
            debug!(participant = %participant_id, "Participant reconnected within the grace window");
            cancel.cancel();
        }
    }

    async fn join(
        &self,
        conn: &mut RelayConnection,
        meeting_id: MeetingId,
        participant_id: ParticipantId,
        display_name: Option<String>,
    ) {
        if let Some((old_meeting, old_id)) = conn.joined.take() {
            if (&old_meeting, &old_id) != (&meeting_id, &participant_id)
                && self.unregister(&old_meeting, &old_id, conn.conn_id).await
            {
                self.announce_left(&old_meeting, &old_id).await;
            }
        }

        {
            let mut rooms = self.rooms.lock().await;
            let replaced = rooms.entry(meeting_id.clone()).or_default().insert(
                participant_id.clone(),
                Member {
                    conn_id: conn.conn_id,
                    tx: conn.tx.clone(),
                },
            );
            if replaced.is_some_and(|old| old.conn_id != conn.conn_id) {
                debug!(participant = %participant_id, "Replacing older connection");
            }
        }
        conn.joined = Some((meeting_id.clone(), participant_id.clone()));
        self.cancel_departure(&meeting_id, &participant_id).await;
        info!(meeting = %meeting_id, participant = %participant_id, "Participant joined");

        self.presence
            .set_status(&meeting_id, &participant_id, PresenceStatus::Joined)
            .await;

        let announcement = SignalingEnvelope::UserJoined {
            meeting_id: meeting_id.clone(),
            participant_id: participant_id.clone(),
            display_name,
        };
        self.broadcast_envelope(&meeting_id, &participant_id, &announcement).await;
    }

    async fn unregister(&self, meeting_id: &MeetingId, participant_id: &ParticipantId, conn_id: Uuid) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(meeting_id) else {
            return false;
        };
        if room.get(participant_id).map(|m| m.conn_id) != Some(conn_id) {
            return false;
        }
        room.remove(participant_id);
        if room.is_empty() {
            rooms.remove(meeting_id);
        }
        true
    }

    async fn announce_left(&self, meeting_id: &MeetingId, participant_id: &ParticipantId) {
        let announcement = SignalingEnvelope::UserLeft {
            meeting_id: meeting_id.clone(),
            participant_id: participant_id.clone(),
        };
        self.broadcast_envelope(meeting_id, participant_id, &announcement).await;
    }

    async fn forward(&self, meeting_id: &MeetingId, to: &ParticipantId, text: &str, kind: &'static str) {
        let target = {
            let rooms = self.rooms.lock().await;
            rooms
                .get(meeting_id)
                .and_then(|room| room.get(to))
                .map(|member| member.tx.clone())
        };
        match target {
            Some(tx) => {
                if tx.send(text.to_string()).await.is_err() {
                    debug!(to = %to, kind, "Recipient connection already closed");
                }
            }
            None => debug!(to = %to, kind, "Dropping envelope for unknown recipient"),
        }
    }

    async fn broadcast_envelope(&self, meeting_id: &MeetingId, except: &ParticipantId, envelope: &SignalingEnvelope) {
        match envelope.encode() {
            Ok(text) => self.broadcast(meeting_id, except, text).await,
            Err(e) => warn!("Failed to encode {}: {}", envelope.kind(), e),
        }
    }

    /// Send to every member of the meeting except `except`. Senders are
    /// cloned out so no lock is held while a queue is full.
    async fn broadcast(&self, meeting_id: &MeetingId, except: &ParticipantId, text: String) {
        let targets: Vec<mpsc::Sender<String>> = {
            let rooms = self.rooms.lock().await;
            rooms
                .get(meeting_id)
                .map(|room| {
                    room.iter()
                        .filter(|(id, _)| *id != except)
                        .map(|(_, member)| member.tx.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for tx in targets {
            let _ = tx.send(text.clone()).await;
        }
    }
}
