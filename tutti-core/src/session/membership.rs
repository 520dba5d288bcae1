//! Join and Leave Tracking
//!
//! Decides when a client should auto-join an observed session and
//! keeps a manual leave sticky until the session identity changes.
//! The machine is pure state; the owner performs the channel calls and
//! debounce timer it asks for.

use tracing::{debug, info};

use crate::session::document::{RoomState, SessionFingerprint, UserId};

/// Debounce before an auto-join fires, absorbing rapid host churn
pub const AUTO_JOIN_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    NotJoined,
    AutoJoinPending,
    Joined,
    ManuallyLeft,
}

/// What the owner must do after feeding the machine an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAction {
    None,
    /// Start the auto-join debounce timer
    ScheduleJoin,
    /// Abort a previously scheduled auto-join
    CancelPendingJoin,
}

/// What the owner must do after a manual leave request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveEffect {
    /// Remove this user from the participants map
    CallLeave,
    /// Only abort the pending auto-join; nothing was ever joined
    CancelPendingJoin,
    /// Not joined, nothing to leave
    Ignored,
}

pub struct JoinLeaveStateMachine {
    user: UserId,
    phase: JoinPhase,
    /// Identity of the session a manual leave was issued against
    left_fingerprint: Option<SessionFingerprint>,
}

impl JoinLeaveStateMachine {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            phase: JoinPhase::NotJoined,
            left_fingerprint: None,
        }
    }

    pub fn phase(&self) -> JoinPhase {
        self.phase
    }

    /// Followers may mutate their player only while joined
    pub fn reconciliation_allowed(&self) -> bool {
        self.phase == JoinPhase::Joined
    }

    /// Forget everything, as if freshly attached
    pub fn reset(&mut self) {
        self.phase = JoinPhase::NotJoined;
        self.left_fingerprint = None;
    }

    /// Feed the machine a room snapshot and get the required action
    pub fn observe(&mut self, state: &RoomState) -> JoinAction {
        let document = match &state.session {
            Some(document) => document,
            None => {
                // Session cleared; everything resets, including a manual leave
                let was_pending = self.phase == JoinPhase::AutoJoinPending;
                if self.phase != JoinPhase::NotJoined {
                    debug!("session gone, membership reset");
                }
                self.reset();
                return if was_pending {
                    JoinAction::CancelPendingJoin
                } else {
                    JoinAction::None
                };
            }
        };

        // A manual leave binds to one session identity
        if self.phase == JoinPhase::ManuallyLeft {
            if self.left_fingerprint == Some(document.fingerprint()) {
                return JoinAction::None;
            }
            info!("session changed since manual leave, eligible to join again");
            self.reset();
        }

        match self.phase {
            JoinPhase::NotJoined => {
                if document.host_id == self.user {
                    return JoinAction::None;
                }
                if state.is_participant(self.user) {
                    // Our record is already present (join echo or reconnect)
                    self.phase = JoinPhase::Joined;
                    return JoinAction::None;
                }
                info!(
                    "session hosted by {}, scheduling auto-join in {}ms",
                    document.host_id, AUTO_JOIN_DEBOUNCE_MS
                );
                self.phase = JoinPhase::AutoJoinPending;
                JoinAction::ScheduleJoin
            }
            JoinPhase::AutoJoinPending => {
                if document.host_id == self.user {
                    // Became the host while waiting to join
                    self.phase = JoinPhase::NotJoined;
                    return JoinAction::CancelPendingJoin;
                }
                if state.is_participant(self.user) {
                    self.phase = JoinPhase::Joined;
                    return JoinAction::CancelPendingJoin;
                }
                JoinAction::None
            }
            JoinPhase::Joined => {
                if document.host_id == self.user {
                    self.reset();
                    return JoinAction::None;
                }
                if !state.is_participant(self.user) {
                    // Removed externally; the next observation may re-join
                    info!("no longer listed as a participant");
                    self.phase = JoinPhase::NotJoined;
                }
                JoinAction::None
            }
            JoinPhase::ManuallyLeft => JoinAction::None,
        }
    }

    /// The debounced join call succeeded
    pub fn confirm_join(&mut self) {
        if self.phase == JoinPhase::AutoJoinPending {
            info!("joined session");
            self.phase = JoinPhase::Joined;
        }
    }

    /// The debounced join call failed; eligible to schedule again
    pub fn join_failed(&mut self) {
        if self.phase == JoinPhase::AutoJoinPending {
            self.phase = JoinPhase::NotJoined;
        }
    }

    /// User explicitly left the session identified by `fingerprint`
    pub fn leave_manually(&mut self, fingerprint: Option<SessionFingerprint>) -> LeaveEffect {
        match self.phase {
            JoinPhase::Joined => {
                info!("left session manually");
                self.phase = JoinPhase::ManuallyLeft;
                self.left_fingerprint = fingerprint;
                LeaveEffect::CallLeave
            }
            JoinPhase::AutoJoinPending => {
                // Declining a pending auto-join counts as a manual leave
                self.phase = JoinPhase::ManuallyLeft;
                self.left_fingerprint = fingerprint;
                LeaveEffect::CancelPendingJoin
            }
            JoinPhase::NotJoined | JoinPhase::ManuallyLeft => LeaveEffect::Ignored,
        }
    }
}
