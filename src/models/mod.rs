use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================
// Identifiers
// ============================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Blank (empty or whitespace-only) ids are never valid on the wire.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque participant identifier. Ordering is lexicographic and is used
    /// to break offer glare.
    ParticipantId
);

string_id!(
    /// Opaque meeting identifier.
    MeetingId
);

// ============================================================
// Presence
// ============================================================

/// Local and remote media state as announced over signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFlags {
    #[serde(default)]
    pub has_audio: bool,
    #[serde(default)]
    pub has_video: bool,
    #[serde(default)]
    pub hand_raised: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Pending,
    #[serde(alias = "present")]
    Joined,
    Left,
    Disconnected,
}

impl PresenceStatus {
    /// A participant with a terminal status is no longer in the meeting.
    pub fn is_terminal(self) -> bool {
        matches!(self, PresenceStatus::Left | PresenceStatus::Disconnected)
    }
}

/// One row of a meeting's attendance as the presence store reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub user_id: ParticipantId,
    #[serde(default)]
    pub display_name: String,
    pub status: PresenceStatus,
    #[serde(default)]
    pub media: MediaFlags,
    pub updated_at: DateTime<Utc>,
}

/// A remote participant as the local session sees it.
///
/// The two timestamps come from different clocks and are never compared
/// with each other.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub media: MediaFlags,
    pub status: PresenceStatus,
    /// `updated_at` of the newest attendance record applied, on the
    /// presence server's clock. The Unix epoch until a record arrives.
    pub updated_at: DateTime<Utc>,
    /// Local clock: when this session last learned anything about them.
    pub seen_at: DateTime<Utc>,
}

impl Participant {
    /// A participant first seen through signaling at local time `seen_at`,
    /// before any attendance record arrives.
    pub fn observed(id: ParticipantId, display_name: Option<String>, seen_at: DateTime<Utc>) -> Self {
        let display_name = display_name.unwrap_or_else(|| id.to_string());
        Self {
            id,
            display_name,
            media: MediaFlags::default(),
            status: PresenceStatus::Joined,
            updated_at: DateTime::<Utc>::default(),
            seen_at,
        }
    }

    /// A participant as an attendance record describes them, learned from a
    /// fetch issued at local time `seen_at`.
    pub fn from_record(record: &AttendanceRecord, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: record.user_id.clone(),
            display_name: record.display_name.clone(),
            media: record.media,
            status: record.status,
            updated_at: record.updated_at,
            seen_at,
        }
    }

    /// Same observable state, ignoring the timestamp.
    pub fn same_state(&self, other: &Participant) -> bool {
        self.display_name == other.display_name
            && self.media == other.media
            && self.status == other.status
    }
}

// ============================================================
// Session
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Joining,
    Active,
    Leaving,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Joining => "joining",
            SessionState::Active => "active",
            SessionState::Leaving => "leaving",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Read-only view of the session published after every loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub meeting_id: MeetingId,
    pub participant_id: ParticipantId,
    pub is_organizer: bool,
    pub state: SessionState,
    pub media: MediaFlags,
    pub screen_sharing: bool,
    pub participants: Vec<ParticipantId>,
    pub connected_peers: Vec<ParticipantId>,
}

impl SessionSnapshot {
    pub fn new(meeting_id: MeetingId, participant_id: ParticipantId, is_organizer: bool) -> Self {
        Self {
            meeting_id,
            participant_id,
            is_organizer,
            state: SessionState::Joining,
            media: MediaFlags::default(),
            screen_sharing: false,
            participants: Vec::new(),
            connected_peers: Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn present_is_accepted_as_joined() {
        let record: AttendanceRecord = serde_json::from_str(
            r#"{"userId":"u1","status":"present","updatedAt":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(record.status, PresenceStatus::Joined);
        assert_eq!(record.media, MediaFlags::default());
        assert_eq!(record.display_name, "");
    }

    #[test]
    fn terminal_statuses() {
        assert!(PresenceStatus::Left.is_terminal());
        assert!(PresenceStatus::Disconnected.is_terminal());
        assert!(!PresenceStatus::Joined.is_terminal());
        assert!(!PresenceStatus::Pending.is_terminal());
    }

    #[test]
    fn blank_ids_are_detected() {
        assert!(ParticipantId::new("  ").is_blank());
        assert!(MeetingId::new("").is_blank());
        assert!(!ParticipantId::new("alice").is_blank());
    }

    #[test]
    fn observed_participant_defaults_display_name_to_id() {
        let p = Participant::observed("bob".into(), None, Utc::now());
        assert_eq!(p.display_name, "bob");
        assert_eq!(p.status, PresenceStatus::Joined);
    }
}
