use std::collections::HashMap;

use crate::models::{Participant, ParticipantId};

/// Result of a last-write-wins upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Newer timestamp but nothing observable changed.
    Unchanged,
    /// Older than what the roster already holds; ignored.
    Stale,
}

/// The remote participants currently counted as present, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    participants: HashMap<ParticipantId, Participant>,
}

impl Roster {
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Participant ids in a stable (sorted) order.
    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.participants.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn upsert(&mut self, participant: Participant) -> Upsert {
        match self.participants.get_mut(&participant.id) {
            None => {
                self.participants.insert(participant.id.clone(), participant);
                Upsert::Inserted
            }
            Some(existing) if participant.updated_at < existing.updated_at => Upsert::Stale,
            Some(existing) => {
                let changed = !existing.same_state(&participant);
                *existing = participant;
                if changed {
                    Upsert::Updated
                } else {
                    Upsert::Unchanged
                }
            }
        }
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn stamped(at: chrono::DateTime<Utc>) -> Participant {
        Participant {
            updated_at: at,
            ..Participant::observed("bob".into(), None, Utc::now())
        }
    }

    #[test]
    fn older_updates_are_ignored() {
        let now = Utc::now();
        let mut roster = Roster::default();
        let mut fresh = stamped(now);
        fresh.media.has_video = true;
        assert_eq!(roster.upsert(fresh), Upsert::Inserted);

        assert_eq!(roster.upsert(stamped(now - Duration::seconds(5))), Upsert::Stale);
        assert!(roster.get(&"bob".into()).unwrap().media.has_video);
    }

    #[test]
    fn newer_identical_update_is_unchanged() {
        let now = Utc::now();
        let mut roster = Roster::default();
        roster.upsert(stamped(now));
        assert_eq!(roster.upsert(stamped(now + Duration::seconds(1))), Upsert::Unchanged);
        assert_eq!(roster.get(&"bob".into()).unwrap().updated_at, now + Duration::seconds(1));
    }
}
