use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::PresenceError;
use crate::models::{AttendanceRecord, MediaFlags, MeetingId, ParticipantId, PresenceStatus};

/// Attendance state shared by every client of a meeting.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Register the participant as joined.
    async fn join(
        &self,
        meeting_id: &MeetingId,
        user_id: &ParticipantId,
        display_name: &str,
        media: MediaFlags,
    ) -> Result<(), PresenceError>;

    /// Mark the participant as left.
    async fn leave(&self, meeting_id: &MeetingId, user_id: &ParticipantId) -> Result<(), PresenceError>;

    async fn update_status(
        &self,
        meeting_id: &MeetingId,
        user_id: &ParticipantId,
        media: MediaFlags,
    ) -> Result<(), PresenceError>;

    /// Current attendance records. May contain several records per
    /// participant; callers merge them.
    async fn list(&self, meeting_id: &MeetingId) -> Result<Vec<AttendanceRecord>, PresenceError>;
}

/// In-process attendance, one record per participant. Backs the dev relay
/// and tests.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    meetings: RwLock<HashMap<MeetingId, Vec<AttendanceRecord>>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw record without merging, the way an append-only store
    /// would.
    pub async fn push_record(&self, meeting_id: &MeetingId, record: AttendanceRecord) {
        self.meetings
            .write()
            .await
            .entry(meeting_id.clone())
            .or_default()
            .push(record);
    }

    /// Set a participant's status, creating the record if needed.
    pub async fn set_status(&self, meeting_id: &MeetingId, user_id: &ParticipantId, status: PresenceStatus) {
        let mut meetings = self.meetings.write().await;
        let records = meetings.entry(meeting_id.clone()).or_default();
        match records.iter_mut().find(|r| r.user_id == *user_id) {
            Some(record) => {
                record.status = status;
                record.updated_at = Utc::now();
            }
            None => records.push(AttendanceRecord {
                user_id: user_id.clone(),
                display_name: user_id.to_string(),
                status,
                media: MediaFlags::default(),
                updated_at: Utc::now(),
            }),
        }
    }

    /// Mark a vanished participant `disconnected`, unless they already left
    /// cleanly.
    pub async fn mark_disconnected(&self, meeting_id: &MeetingId, user_id: &ParticipantId) {
        let mut meetings = self.meetings.write().await;
        let Some(records) = meetings.get_mut(meeting_id) else {
            return;
        };
        if let Some(record) = records.iter_mut().find(|r| r.user_id == *user_id) {
            if !record.status.is_terminal() {
                record.status = PresenceStatus::Disconnected;
                record.updated_at = Utc::now();
            }
        }
    }

    pub async fn status_of(&self, meeting_id: &MeetingId, user_id: &ParticipantId) -> Option<PresenceStatus> {
        let meetings = self.meetings.read().await;
        meetings
            .get(meeting_id)?
            .iter()
            .filter(|r| r.user_id == *user_id)
            .max_by_key(|r| r.updated_at)
            .map(|r| r.status)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn join(
        &self,
        meeting_id: &MeetingId,
        user_id: &ParticipantId,
        display_name: &str,
        media: MediaFlags,
    ) -> Result<(), PresenceError> {
        let record = AttendanceRecord {
            user_id: user_id.clone(),
            display_name: display_name.to_string(),
            status: PresenceStatus::Joined,
            media,
            updated_at: Utc::now(),
        };
        let mut meetings = self.meetings.write().await;
        let records = meetings.entry(meeting_id.clone()).or_default();
        records.retain(|r| r.user_id != *user_id);
        records.push(record);
        Ok(())
    }

    async fn leave(&self, meeting_id: &MeetingId, user_id: &ParticipantId) -> Result<(), PresenceError> {
        let mut meetings = self.meetings.write().await;
        let record = meetings
            .get_mut(meeting_id)
            .and_then(|records| records.iter_mut().find(|r| r.user_id == *user_id))
            .ok_or_else(|| PresenceError::ParticipantNotFound(user_id.clone()))?;
        record.status = PresenceStatus::Left;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status(
        &self,
        meeting_id: &MeetingId,
        user_id: &ParticipantId,
        media: MediaFlags,
    ) -> Result<(), PresenceError> {
        let mut meetings = self.meetings.write().await;
        let record = meetings
            .get_mut(meeting_id)
            .and_then(|records| records.iter_mut().find(|r| r.user_id == *user_id))
            .ok_or_else(|| PresenceError::ParticipantNotFound(user_id.clone()))?;
        record.media = media;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self, meeting_id: &MeetingId) -> Result<Vec<AttendanceRecord>, PresenceError> {
        Ok(self
            .meetings
            .read()
            .await
            .get(meeting_id)
            .cloned()
            .unwrap_or_default())
    }
}
