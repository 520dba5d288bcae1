//! Session Engine
//!
//! The host-authoritative session document, the components that publish
//! and follow it, and the shared suggestion queue.

pub mod document;
mod follower;
mod host;
mod membership;
mod queue;

pub use document::{
    current_time_ms, DocumentError, EntryKey, JoinRecord, QueueEntry, RoomState, SessionDocument,
    SessionFingerprint, SongId, UserId,
};
pub use follower::{
    drift_estimate_ms, target_position_ms, ParticipantReconciler, ReconcileOutcome, SkipReason,
    CORRECTION_THRESHOLD_MS,
};
pub use host::{HostController, POSITION_PUBLISH_THRESHOLD_MS};
pub use membership::{
    JoinAction, JoinLeaveStateMachine, JoinPhase, LeaveEffect, AUTO_JOIN_DEBOUNCE_MS,
};
pub use queue::{QueueError, SuggestionQueueManager};
