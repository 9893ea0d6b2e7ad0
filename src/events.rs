use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::DeviceError;
use crate::media::TrackKind;
use crate::models::{MediaFlags, Participant, ParticipantId, SessionState};
use crate::peer::{LinkState, RemoteTrackHandle};
use crate::signaling::SignalingStatus;

/// Why a remote participant was dropped from the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// `user-left` arrived over signaling.
    Signaling,
    /// The attendance snapshot no longer lists them as present.
    Reconciliation,
    /// Their peer link disconnected or failed.
    ConnectionLost,
}

/// Session events for UI layers and the CLI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    ParticipantJoined(Participant),
    ParticipantUpdated(Participant),
    ParticipantLeft { participant_id: ParticipantId, reason: LeaveReason },
    PeerStateChanged { participant_id: ParticipantId, state: LinkState },
    RemoteTrack { participant_id: ParticipantId, track: RemoteTrackHandle },
    /// A reassembled JPEG frame from a remote camera or screen.
    RemoteFrame { participant_id: ParticipantId, kind: TrackKind, data: Bytes },
    LocalMediaChanged { media: MediaFlags, screen_sharing: bool },
    MediaError { kind: TrackKind, error: DeviceError },
    Signaling(SignalingStatus),
}

pub type EventSender = broadcast::Sender<SessionEvent>;
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
