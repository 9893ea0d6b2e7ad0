pub mod link;
pub mod manager;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use ::webrtc::track::track_remote::TrackRemote;

use crate::error::PeerError;
use crate::media::{OutgoingTracks, TrackKind};
use crate::models::ParticipantId;

pub use link::{LinkState, Negotiation, NegotiationRole, PeerLink};
pub use manager::{ManagerConfig, PeerConnectionManager};

/// Connection state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A remote RTP track, shared with event subscribers.
#[derive(Clone)]
pub struct RemoteTrackHandle(pub Arc<TrackRemote>);

impl fmt::Debug for RemoteTrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrackHandle")
            .field("kind", &self.0.kind())
            .finish_non_exhaustive()
    }
}

/// Transport callbacks, posted into the session loop. `generation` identifies
/// the link instance that produced the event.
#[derive(Debug)]
pub enum PeerEvent {
    LocalCandidate {
        participant_id: ParticipantId,
        generation: u64,
        candidate: Value,
    },
    StateChanged {
        participant_id: ParticipantId,
        generation: u64,
        state: TransportState,
    },
    RemoteTrack {
        participant_id: ParticipantId,
        generation: u64,
        track: RemoteTrackHandle,
    },
    RemoteFrame {
        participant_id: ParticipantId,
        generation: u64,
        kind: TrackKind,
        data: Bytes,
    },
}

impl PeerEvent {
    pub fn participant_id(&self) -> &ParticipantId {
        match self {
            PeerEvent::LocalCandidate { participant_id, .. }
            | PeerEvent::StateChanged { participant_id, .. }
            | PeerEvent::RemoteTrack { participant_id, .. }
            | PeerEvent::RemoteFrame { participant_id, .. } => participant_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            PeerEvent::LocalCandidate { generation, .. }
            | PeerEvent::StateChanged { generation, .. }
            | PeerEvent::RemoteTrack { generation, .. }
            | PeerEvent::RemoteFrame { generation, .. } => *generation,
        }
    }
}

/// The direct media connection to one remote participant.
///
/// Session descriptions and candidates are opaque JSON objects in the shape
/// browsers use (`{type, sdp}` and `{candidate, sdpMid, sdpMLineIndex}`).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<Value, PeerError>;
    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<Value, PeerError>;
    async fn set_remote_description(&self, sdp: Value) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError>;
    /// Swap outgoing tracks in place, without renegotiation.
    async fn replace_tracks(&self, tracks: &OutgoingTracks) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Everything a connector needs to build one link's transport.
pub struct LinkContext {
    pub participant_id: ParticipantId,
    pub generation: u64,
    pub role: NegotiationRole,
    pub tracks: OutgoingTracks,
    pub events: mpsc::Sender<PeerEvent>,
}

/// Builds transports. Callbacks must only post `PeerEvent`s to
/// `LinkContext::events`.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn connect(&self, ctx: LinkContext) -> Result<Arc<dyn PeerTransport>, PeerError>;
}
