use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;
use tracing::debug;

use crate::error::PresenceError;
use crate::models::{AttendanceRecord, MediaFlags, MeetingId, ParticipantId};
use crate::presence::PresenceStore;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody<'a> {
    user_id: &'a ParticipantId,
    display_name: &'a str,
    media: MediaFlags,
}

#[derive(Serialize)]
struct UpdateBody {
    media: MediaFlags,
}

/// Presence store reached over the attendance REST API.
#[derive(Debug, Clone)]
pub struct HttpPresenceStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPresenceStore {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:9847`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Ids are pushed as encoded path segments, so `/`, `?` or `#` in an id
    /// cannot change the route.
    fn endpoint(&self, meeting_id: &MeetingId, user_id: Option<&ParticipantId>) -> Result<Url, PresenceError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PresenceError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| PresenceError::InvalidUrl(self.base_url.clone()))?;
            segments
                .pop_if_empty()
                .extend(["api", "v1", "meetings", meeting_id.as_str(), "attendance"]);
            if let Some(user_id) = user_id {
                segments.push(user_id.as_str());
            }
        }
        Ok(url)
    }

    fn attendance_url(&self, meeting_id: &MeetingId) -> Result<Url, PresenceError> {
        self.endpoint(meeting_id, None)
    }

    fn participant_url(&self, meeting_id: &MeetingId, user_id: &ParticipantId) -> Result<Url, PresenceError> {
        self.endpoint(meeting_id, Some(user_id))
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, PresenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PresenceError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl PresenceStore for HttpPresenceStore {
    async fn join(
        &self,
        meeting_id: &MeetingId,
        user_id: &ParticipantId,
        display_name: &str,
        media: MediaFlags,
    ) -> Result<(), PresenceError> {
        let response = self
            .client
            .post(self.attendance_url(meeting_id)?)
            .json(&JoinBody {
                user_id,
                display_name,
                media,
            })
            .send()
            .await?;
        check(response).await?;
        debug!(meeting = %meeting_id, participant = %user_id, "Attendance registered");
        Ok(())
    }

    async fn leave(&self, meeting_id: &MeetingId, user_id: &ParticipantId) -> Result<(), PresenceError> {
        let response = self
            .client
            .delete(self.participant_url(meeting_id, user_id)?)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn update_status(
        &self,
        meeting_id: &MeetingId,
        user_id: &ParticipantId,
        media: MediaFlags,
    ) -> Result<(), PresenceError> {
        let response = self
            .client
            .put(self.participant_url(meeting_id, user_id)?)
            .json(&UpdateBody { media })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn list(&self, meeting_id: &MeetingId) -> Result<Vec<AttendanceRecord>, PresenceError> {
        let response = self.client.get(self.attendance_url(meeting_id)?).send().await?;
        Ok(check(response).await?.json().await?)
    }
}
