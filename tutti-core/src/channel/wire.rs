//! Wire Protocol and Room View Materialization
//!
//! Rooms replicate through tagged operations rather than state diffs:
//! the session document is overwritten wholesale, participants and queue
//! entries are added/removed by key. `RoomView` folds a stream of these
//! operations (in any order, with duplicates and stale echoes) into the
//! latest-known `RoomState`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::{EntryKey, JoinRecord, QueueEntry, RoomState, SessionDocument, UserId};

/// Messages exchanged on a room's channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoomMessage {
    // === Session document (host only) ===
    /// Overwrite of the session document
    Session { document: SessionDocument },

    /// The host ended the session; clears document, participants, queue
    SessionCleared { host_id: UserId },

    // === Participants (join/leave machine) ===
    /// A follower joined
    Joined { user_id: UserId, record: JoinRecord },

    /// A follower left
    Left { user_id: UserId },

    // === Suggestion queue (any participant) ===
    /// A song was suggested
    QueueAdded { key: EntryKey, entry: QueueEntry },

    /// A suggestion was discarded or consumed by the host
    QueueRemoved { key: EntryKey },

    // === Late-joiner catch-up ===
    /// Ask the current host for the full room state
    SnapshotRequest,

    /// Full room state, sent by the current host
    Snapshot { state: RoomState },
}

/// Latest-known state of one room, fed by `RoomMessage` operations.
///
/// Application is convergent under last-write-wins: stale documents
/// (older `updated_at`), clears from superseded hosts and malformed
/// documents are discarded, so replaying any interleaving of the same
/// operations ends in the same state.
#[derive(Debug, Default)]
pub struct RoomView {
    state: RoomState,
}

impl RoomView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current materialized state
    pub fn state(&self) -> &RoomState {
        &self.state
    }

    /// Apply one operation; returns whether the state changed
    pub fn apply(&mut self, message: &RoomMessage) -> bool {
        match message {
            RoomMessage::Session { document } => self.apply_session(document),
            RoomMessage::SessionCleared { host_id } => self.apply_clear(*host_id),
            RoomMessage::Joined { user_id, record } => self.apply_joined(*user_id, record),
            RoomMessage::Left { user_id } => self.state.participants.remove(user_id).is_some(),
            RoomMessage::QueueAdded { key, entry } => {
                let prev = self.state.queue.insert(key.clone(), entry.clone());
                prev.as_ref() != Some(entry)
            }
            RoomMessage::QueueRemoved { key } => self.state.queue.remove(key).is_some(),
            RoomMessage::SnapshotRequest => false,
            RoomMessage::Snapshot { state } => self.apply_snapshot(state),
        }
    }

    fn apply_session(&mut self, document: &SessionDocument) -> bool {
        if let Err(e) = document.validate() {
            debug!("discarding malformed session document: {}", e);
            return false;
        }
        if let Some(current) = &self.state.session {
            if !document.supersedes(current) {
                debug!(
                    "discarding stale session document, updated_at={} < {}",
                    document.updated_at, current.updated_at
                );
                return false;
            }
            if current == document {
                return false;
            }
        }
        self.state.session = Some(document.clone());
        true
    }

    fn apply_clear(&mut self, host_id: UserId) -> bool {
        match &self.state.session {
            Some(current) if current.host_id == host_id => {
                self.state = RoomState::default();
                true
            }
            Some(current) => {
                debug!(
                    "ignoring session clear from superseded host {}, current host is {}",
                    host_id, current.host_id
                );
                false
            }
            None => false,
        }
    }

    fn apply_joined(&mut self, user_id: UserId, record: &JoinRecord) -> bool {
        // A join that outlives its session must not haunt the next one
        if self.state.session.is_none() {
            debug!("ignoring join from {} with no active session", user_id);
            return false;
        }
        let prev = self.state.participants.insert(user_id, record.clone());
        prev.as_ref() != Some(record)
    }

    /// Adopt a full snapshot if its session is at least as fresh as ours.
    ///
    /// Wholesale replacement (not a union) so removals the local view
    /// missed are repaired too; a follower whose own join is missing
    /// from the snapshot simply re-joins through the normal path.
    fn apply_snapshot(&mut self, incoming: &RoomState) -> bool {
        let adopt = match (&incoming.session, &self.state.session) {
            (Some(theirs), Some(ours)) => theirs.supersedes(ours),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !adopt {
            return false;
        }
        if let Some(doc) = &incoming.session {
            if doc.validate().is_err() {
                return false;
            }
        }
        if self.state == *incoming {
            return false;
        }
        self.state = incoming.clone();
        true
    }
}
