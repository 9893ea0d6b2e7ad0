//! Error types for each layer of the session.
//!
//! Per-peer and device errors are recoverable and never end a session;
//! only `SessionError` values returned from startup are fatal.

use thiserror::Error;

use crate::media::TrackKind;
use crate::models::ParticipantId;

/// Signaling channel errors.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Could not open the connection to the relay.
    #[error("Connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    /// The channel has been closed or its task has stopped.
    #[error("Signaling channel closed")]
    Closed,

    /// An envelope could not be encoded or decoded.
    #[error("Invalid envelope: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors raised by a single peer link or its transport.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The underlying WebRTC stack failed.
    #[error("WebRTC error: {0}")]
    Transport(String),

    /// A negotiation message arrived in a state that cannot accept it.
    #[error("Unexpected {message} while {state}")]
    UnexpectedMessage { message: &'static str, state: String },

    /// The remote description or candidate payload is malformed.
    #[error("Invalid session payload: {0}")]
    InvalidPayload(String),

    #[error("Peer link closed")]
    Closed,
}

impl From<webrtc::Error> for PeerError {
    fn from(e: webrtc::Error) -> Self {
        PeerError::Transport(e.to_string())
    }
}

/// Local capture device errors. Cloned to every caller waiting on the same
/// acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("No {0} device available")]
    NotFound(TrackKind),

    #[error("{0} capture is not supported by this build")]
    Unsupported(TrackKind),

    #[error("Permission to use the {0} device was denied")]
    Denied(TrackKind),

    #[error("{kind} capture failed: {reason}")]
    Failed { kind: TrackKind, reason: String },

    /// The acquisition was aborted by session teardown.
    #[error("Device acquisition cancelled")]
    Cancelled,
}

/// Presence store errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Presence request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("Presence store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("Invalid presence URL: {0}")]
    InvalidUrl(String),
}

/// Session-level errors returned by startup and by `SessionHandle` calls.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Meeting or participant id is missing or blank.
    #[error("Missing {0}")]
    MissingIdentifier(&'static str),

    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// The session loop has already stopped.
    #[error("Session is closed")]
    Closed,
}
