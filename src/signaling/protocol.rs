use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingError;
use crate::models::{MediaFlags, MeetingId, ParticipantId};

/// One control message, carried as a JSON text frame.
///
/// `join`, `user-joined`, `user-left` and `media-update` carry their subject
/// participant in `fromUserId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingEnvelope {
    Join {
        #[serde(rename = "meetingId")]
        meeting_id: MeetingId,
        #[serde(rename = "fromUserId")]
        participant_id: ParticipantId,
        #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    Offer {
        #[serde(rename = "meetingId")]
        meeting_id: MeetingId,
        #[serde(rename = "fromUserId")]
        from: ParticipantId,
        #[serde(rename = "toUserId")]
        to: ParticipantId,
        sdp: Value,
    },
    Answer {
        #[serde(rename = "meetingId")]
        meeting_id: MeetingId,
        #[serde(rename = "fromUserId")]
        from: ParticipantId,
        #[serde(rename = "toUserId")]
        to: ParticipantId,
        sdp: Value,
    },
    IceCandidate {
        #[serde(rename = "meetingId")]
        meeting_id: MeetingId,
        #[serde(rename = "fromUserId")]
        from: ParticipantId,
        #[serde(rename = "toUserId")]
        to: ParticipantId,
        candidate: Value,
    },
    UserJoined {
        #[serde(rename = "meetingId")]
        meeting_id: MeetingId,
        #[serde(rename = "fromUserId")]
        participant_id: ParticipantId,
        #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    UserLeft {
        #[serde(rename = "meetingId")]
        meeting_id: MeetingId,
        #[serde(rename = "fromUserId")]
        participant_id: ParticipantId,
    },
    MediaUpdate {
        #[serde(rename = "meetingId")]
        meeting_id: MeetingId,
        #[serde(rename = "fromUserId")]
        participant_id: ParticipantId,
        #[serde(rename = "hasAudio", default)]
        has_audio: bool,
        #[serde(rename = "hasVideo", default)]
        has_video: bool,
        #[serde(rename = "handRaised", default)]
        hand_raised: bool,
    },
}

impl SignalingEnvelope {
    pub fn media_update(meeting_id: MeetingId, participant_id: ParticipantId, flags: MediaFlags) -> Self {
        SignalingEnvelope::MediaUpdate {
            meeting_id,
            participant_id,
            has_audio: flags.has_audio,
            has_video: flags.has_video,
            hand_raised: flags.hand_raised,
        }
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn meeting_id(&self) -> &MeetingId {
        match self {
            SignalingEnvelope::Join { meeting_id, .. }
            | SignalingEnvelope::Offer { meeting_id, .. }
            | SignalingEnvelope::Answer { meeting_id, .. }
            | SignalingEnvelope::IceCandidate { meeting_id, .. }
            | SignalingEnvelope::UserJoined { meeting_id, .. }
            | SignalingEnvelope::UserLeft { meeting_id, .. }
            | SignalingEnvelope::MediaUpdate { meeting_id, .. } => meeting_id,
        }
    }

    /// Recipient of a point-to-point envelope. Broadcast kinds have none.
    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            SignalingEnvelope::Offer { to, .. }
            | SignalingEnvelope::Answer { to, .. }
            | SignalingEnvelope::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Wire name of the envelope type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::Join { .. } => "join",
            SignalingEnvelope::Offer { .. } => "offer",
            SignalingEnvelope::Answer { .. } => "answer",
            SignalingEnvelope::IceCandidate { .. } => "ice-candidate",
            SignalingEnvelope::UserJoined { .. } => "user-joined",
            SignalingEnvelope::UserLeft { .. } => "user-left",
            SignalingEnvelope::MediaUpdate { .. } => "media-update",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_uses_wire_field_names() {
        let env = SignalingEnvelope::Offer {
            meeting_id: "m1".into(),
            from: "alice".into(),
            to: "bob".into(),
            sdp: json!({"type": "offer", "sdp": "v=0"}),
        };
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["meetingId"], "m1");
        assert_eq!(value["fromUserId"], "alice");
        assert_eq!(value["toUserId"], "bob");
        assert_eq!(value["sdp"]["type"], "offer");
    }

    #[test]
    fn decodes_ice_candidate_from_browser_clients() {
        let text = r#"{"type":"ice-candidate","meetingId":"m1","fromUserId":"b","toUserId":"a",
            "candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0"}}"#;
        let env = SignalingEnvelope::decode(text).unwrap();
        assert_eq!(env.kind(), "ice-candidate");
        assert_eq!(env.recipient(), Some(&ParticipantId::from("a")));
    }

    #[test]
    fn media_update_hand_raised_defaults_to_false() {
        let text = r#"{"type":"media-update","meetingId":"m1","fromUserId":"b","hasAudio":true,"hasVideo":false}"#;
        match SignalingEnvelope::decode(text).unwrap() {
            SignalingEnvelope::MediaUpdate { has_audio, has_video, hand_raised, .. } => {
                assert!(has_audio);
                assert!(!has_video);
                assert!(!hand_raised);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(SignalingEnvelope::decode(r#"{"type":"chat","meetingId":"m1"}"#).is_err());
    }
}
