use std::net::SocketAddr;
use std::time::Duration;

use crate::error::SessionError;
use crate::models::{MeetingId, ParticipantId};
use crate::signaling::ReconnectPolicy;

pub const DEFAULT_PORT: u16 = 9847;

/// Everything a session needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub meeting_id: MeetingId,
    pub participant_id: ParticipantId,
    pub display_name: Option<String>,
    pub is_organizer: bool,
    pub initial_audio: bool,
    pub initial_video: bool,
    pub reconnect: ReconnectPolicy,
    /// How often attendance is re-fetched while active.
    pub poll_interval: Duration,
    pub max_peers: usize,
}

impl SessionConfig {
    pub fn new(meeting_id: impl Into<MeetingId>, participant_id: impl Into<ParticipantId>) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            participant_id: participant_id.into(),
            display_name: None,
            is_organizer: false,
            initial_audio: true,
            initial_video: false,
            reconnect: ReconnectPolicy::default(),
            poll_interval: Duration::from_secs(3),
            max_peers: 8,
        }
    }

    /// Display name, falling back to the participant id.
    pub fn display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.participant_id.to_string())
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.meeting_id.is_blank() {
            return Err(SessionError::MissingIdentifier("meeting id"));
        }
        if self.participant_id.is_blank() {
            return Err(SessionError::MissingIdentifier("participant id"));
        }
        Ok(())
    }
}

/// How long the relay waits for a dropped client to reconnect before
/// announcing its departure. Longer than the default reconnect delay.
pub const DEFAULT_DEPARTURE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub departure_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            departure_grace: DEFAULT_DEPARTURE_GRACE,
        }
    }
}
