use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::media::OutgoingTracks;
use crate::models::ParticipantId;
use crate::peer::{PeerTransport, TransportState};

/// Which side sends the offer. The participant already in the meeting
/// offers; the newcomer waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Offering,
    Answering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Negotiating(Negotiation),
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Counted towards the mesh: negotiating or connected.
    pub fn is_live(self) -> bool {
        matches!(self, LinkState::Negotiating(_) | LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Negotiating(Negotiation::Offering) => "offering",
            LinkState::Negotiating(Negotiation::Answering) => "answering",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Negotiation state for one remote participant.
pub struct PeerLink {
    participant_id: ParticipantId,
    generation: u64,
    role: NegotiationRole,
    state: LinkState,
    media_ready: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<Value>,
    tracks: OutgoingTracks,
    transport: Arc<dyn PeerTransport>,
}

impl PeerLink {
    pub fn new(
        participant_id: ParticipantId,
        generation: u64,
        role: NegotiationRole,
        transport: Arc<dyn PeerTransport>,
        tracks: OutgoingTracks,
    ) -> Self {
        Self {
            participant_id,
            generation,
            role,
            state: LinkState::Idle,
            media_ready: false,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            tracks,
            transport,
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// The transport reported connectivity at least once.
    pub fn media_ready(&self) -> bool {
        self.media_ready
    }

    pub fn tracks(&self) -> &OutgoingTracks {
        &self.tracks
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn unexpected(&self, message: &'static str) -> PeerError {
        PeerError::UnexpectedMessage {
            message,
            state: self.state.to_string(),
        }
    }

    /// `Idle -> Offering`. Returns the local offer to send.
    pub async fn start_offer(&mut self) -> Result<Value, PeerError> {
        if self.state != LinkState::Idle {
            return Err(self.unexpected("offer start"));
        }
        self.state = LinkState::Negotiating(Negotiation::Offering);
        match self.transport.create_offer().await {
            Ok(offer) => Ok(offer),
            Err(e) => {
                self.state = LinkState::Failed;
                Err(e)
            }
        }
    }

    /// Remote offer while `Idle`. Returns the answer to send; the link is
    /// considered connected once the answer exists.
    pub async fn handle_offer(&mut self, sdp: Value) -> Result<Value, PeerError> {
        if self.state != LinkState::Idle {
            return Err(self.unexpected("offer"));
        }
        self.state = LinkState::Negotiating(Negotiation::Answering);
        let result = async {
            self.apply_remote_description(sdp).await?;
            self.transport.create_answer().await
        }
        .await;
        match result {
            Ok(answer) => {
                self.state = LinkState::Connected;
                Ok(answer)
            }
            Err(e) => {
                self.state = LinkState::Failed;
                Err(e)
            }
        }
    }

    /// Remote answer while `Offering`.
    pub async fn handle_answer(&mut self, sdp: Value) -> Result<(), PeerError> {
        if self.state != LinkState::Negotiating(Negotiation::Offering) {
            return Err(self.unexpected("answer"));
        }
        match self.apply_remote_description(sdp).await {
            Ok(()) => {
                self.state = LinkState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Failed;
                Err(e)
            }
        }
    }

    /// Candidates that arrive before the remote description are queued and
    /// applied in arrival order once it is set.
    pub async fn handle_candidate(&mut self, candidate: Value) -> Result<(), PeerError> {
        if self.state == LinkState::Closed {
            return Err(PeerError::Closed);
        }
        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            debug!(
                participant = %self.participant_id,
                buffered = self.pending_candidates.len(),
                "Buffered early ICE candidate"
            );
            return Ok(());
        }
        self.transport.add_ice_candidate(candidate).await
    }

    async fn apply_remote_description(&mut self, sdp: Value) -> Result<(), PeerError> {
        self.transport.set_remote_description(sdp).await?;
        self.remote_description_set = true;
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!(participant = %self.participant_id, "Buffered ICE candidate rejected: {}", e);
            }
        }
        Ok(())
    }

    /// Apply a transport state change. Returns `true` when the link is lost
    /// and the participant should be dropped.
    pub fn on_transport_state(&mut self, state: TransportState) -> bool {
        if self.state == LinkState::Closed {
            return false;
        }
        match state {
            TransportState::Connected => {
                self.media_ready = true;
                if let LinkState::Negotiating(_) = self.state {
                    self.state = LinkState::Connected;
                }
                false
            }
            TransportState::Disconnected => {
                self.state = LinkState::Disconnected;
                true
            }
            TransportState::Failed | TransportState::Closed => {
                self.state = LinkState::Failed;
                true
            }
            TransportState::New | TransportState::Connecting => false,
        }
    }

    /// Send `tracks` from now on. Returns `false` if nothing changed.
    pub async fn replace_tracks(&mut self, tracks: &OutgoingTracks) -> Result<bool, PeerError> {
        if self.state == LinkState::Closed {
            return Err(PeerError::Closed);
        }
        if self.tracks == *tracks {
            return Ok(false);
        }
        self.transport.replace_tracks(tracks).await?;
        self.tracks = tracks.clone();
        Ok(true)
    }

    /// Release outgoing tracks, drop queued candidates and close the
    /// transport. Closing twice is harmless.
    pub async fn close(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        self.state = LinkState::Closed;
        self.pending_candidates.clear();
        self.tracks = OutgoingTracks::default();
        if let Err(e) = self.transport.close().await {
            debug!(participant = %self.participant_id, "Transport close failed: {}", e);
        }
    }
}
