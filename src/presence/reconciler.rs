use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PresenceError;
use crate::models::{AttendanceRecord, MeetingId, Participant, ParticipantId};
use crate::presence::PresenceStore;
use crate::roster::Roster;

/// Attendance as fetched at one point in time.
#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    pub records: Vec<AttendanceRecord>,
    /// When the fetch was issued. Roster entries observed after this are
    /// newer than anything the snapshot can say about them.
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterDiff {
    pub joined: Vec<Participant>,
    pub left: Vec<ParticipantId>,
    pub updated: Vec<Participant>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.updated.is_empty()
    }
}

/// Keep only the newest record per participant, whatever the input order.
/// On equal timestamps the later record wins.
pub fn merge_snapshot(records: impl IntoIterator<Item = AttendanceRecord>) -> HashMap<ParticipantId, AttendanceRecord> {
    let mut merged: HashMap<ParticipantId, AttendanceRecord> = HashMap::new();
    for record in records {
        match merged.entry(record.user_id.clone()) {
            Entry::Occupied(mut entry) => {
                if record.updated_at >= entry.get().updated_at {
                    entry.insert(record);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
    }
    merged
}

/// Diff a snapshot against the live roster.
///
/// The local participant and terminal statuses are excluded from the
/// present set. Updates compare record timestamps with the newest record
/// already applied, both on the server's clock. A roster entry seen locally
/// after the fetch was issued is never reported as left.
pub fn reconcile(snapshot: PresenceSnapshot, local_id: &ParticipantId, roster: &Roster) -> RosterDiff {
    let fetched_at = snapshot.fetched_at;
    let present: BTreeMap<ParticipantId, AttendanceRecord> = merge_snapshot(snapshot.records)
        .into_iter()
        .filter(|(id, record)| id != local_id && !record.status.is_terminal())
        .collect();

    let mut diff = RosterDiff::default();
    for (id, record) in &present {
        let candidate = Participant::from_record(record, fetched_at);
        match roster.get(id) {
            None => diff.joined.push(candidate),
            Some(known) if record.updated_at > known.updated_at && !known.same_state(&candidate) => {
                diff.updated.push(candidate)
            }
            Some(_) => {}
        }
    }

    let mut left: Vec<ParticipantId> = roster
        .iter()
        .filter(|p| !present.contains_key(&p.id) && p.seen_at <= fetched_at)
        .map(|p| p.id.clone())
        .collect();
    left.sort();
    diff.left = left;
    diff
}

/// Periodically pulls attendance and reconciles it against the roster.
pub struct PresenceReconciler {
    store: Arc<dyn PresenceStore>,
    meeting_id: MeetingId,
    local_id: ParticipantId,
}

impl PresenceReconciler {
    pub fn new(store: Arc<dyn PresenceStore>, meeting_id: MeetingId, local_id: ParticipantId) -> Self {
        Self {
            store,
            meeting_id,
            local_id,
        }
    }

    pub async fn fetch(&self) -> Result<PresenceSnapshot, PresenceError> {
        let fetched_at = Utc::now();
        let records = self.store.list(&self.meeting_id).await?;
        Ok(PresenceSnapshot { records, fetched_at })
    }

    pub fn reconcile(&self, snapshot: PresenceSnapshot, roster: &Roster) -> RosterDiff {
        reconcile(snapshot, &self.local_id, roster)
    }

    /// Fetch and diff in one step.
    pub async fn poll(&self, roster: &Roster) -> Result<RosterDiff, PresenceError> {
        let snapshot = self.fetch().await?;
        Ok(self.reconcile(snapshot, roster))
    }

    /// Fetch every `interval` and hand snapshots to the session loop, which
    /// diffs them against the live roster. Fetch errors are logged and
    /// retried on the next tick.
    pub fn spawn_ticker(
        self: Arc<Self>,
        interval: Duration,
        snapshots: mpsc::Sender<PresenceSnapshot>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the seed poll already ran.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Presence ticker cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        let snapshot = tokio::select! {
                            _ = cancel.cancelled() => return,
                            result = self.fetch() => result,
                        };
                        match snapshot {
                            Ok(snapshot) => {
                                if snapshots.send(snapshot).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(meeting = %self.meeting_id, "Presence fetch failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
