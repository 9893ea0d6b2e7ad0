use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::PresenceError;
use crate::models::{AttendanceRecord, MediaFlags, MeetingId, ParticipantId};
use crate::presence::PresenceStore;
use crate::relay::RelayState;

fn into_response(e: PresenceError) -> (StatusCode, String) {
    match e {
        PresenceError::ParticipantNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn list_attendance(
    State(state): State<RelayState>,
    Path(meeting_id): Path<MeetingId>,
) -> Result<Json<Vec<AttendanceRecord>>, (StatusCode, String)> {
    state
        .presence()
        .list(&meeting_id)
        .await
        .map(Json)
        .map_err(into_response)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: ParticipantId,
    pub display_name: Option<String>,
    #[serde(default)]
    pub media: MediaFlags,
}

pub async fn join(
    State(state): State<RelayState>,
    Path(meeting_id): Path<MeetingId>,
    Json(body): Json<JoinRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    if body.user_id.is_blank() {
        return Err((StatusCode::BAD_REQUEST, "userId is required".to_string()));
    }
    let display_name = body.display_name.unwrap_or_else(|| body.user_id.to_string());
    state
        .presence()
        .join(&meeting_id, &body.user_id, &display_name, body.media)
        .await
        .map(|_| (StatusCode::CREATED, Json(serde_json::json!({"ok": true}))))
        .map_err(into_response)
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    pub media: MediaFlags,
}

pub async fn update_status(
    State(state): State<RelayState>,
    Path((meeting_id, user_id)): Path<(MeetingId, ParticipantId)>,
    Json(body): Json<UpdateRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state
        .presence()
        .update_status(&meeting_id, &user_id, body.media)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(into_response)
}

pub async fn leave(
    State(state): State<RelayState>,
    Path((meeting_id, user_id)): Path<(MeetingId, ParticipantId)>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state
        .presence()
        .leave(&meeting_id, &user_id)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(into_response)
}
