//! Room Channels
//!
//! A channel is the shared medium a room replicates through: one mutable
//! session document plus the participant and queue sub-maps, with
//! push-style change notification. Two implementations ship: an
//! in-process store and a libp2p gossipsub mesh.

mod gossip;
mod memory;
mod room_id;
mod wire;

pub use gossip::{GossipChannel, GossipConfig};
pub use memory::InMemoryChannel;
pub use room_id::RoomId;
pub use wire::{RoomMessage, RoomView};

#[cfg(test)]
pub(crate) use memory::StallingChannel;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::session::{DocumentError, EntryKey, JoinRecord, QueueEntry, RoomState, SessionDocument, UserId};

/// Channel-related errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel task closed")]
    Closed,

    #[error("Invalid session document: {0}")]
    InvalidDocument(#[from] DocumentError),

    #[error("Channel backend error: {0}")]
    Backend(String),
}

/// The pub/sub medium a room lives on.
///
/// Overwrite semantics per region: the session document is replaced
/// wholesale on publish, participants and queue entries are added and
/// removed by key. Subscribers always observe the latest state; stale
/// writes (older `updated_at`, clears from a superseded host) are
/// discarded by the channel, not surfaced as errors.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    /// Overwrite the room's session document (host transport fields)
    async fn publish_session(
        &self,
        room: &RoomId,
        document: SessionDocument,
    ) -> Result<(), ChannelError>;

    /// Destroy the session document, participants and queue.
    ///
    /// Honored only if `host_id` matches the currently known host, so a
    /// stale clear from a superseded host cannot tear down a live room.
    async fn clear_session(&self, room: &RoomId, host_id: UserId) -> Result<(), ChannelError>;

    /// Add `user_id` to the room's participants
    async fn join(
        &self,
        room: &RoomId,
        user_id: UserId,
        record: JoinRecord,
    ) -> Result<(), ChannelError>;

    /// Remove `user_id` from the room's participants
    async fn leave(&self, room: &RoomId, user_id: UserId) -> Result<(), ChannelError>;

    /// Add a queue entry under a fresh opaque key
    async fn suggest(
        &self,
        room: &RoomId,
        key: EntryKey,
        entry: QueueEntry,
    ) -> Result<(), ChannelError>;

    /// Remove a queue entry
    async fn discard(&self, room: &RoomId, key: &EntryKey) -> Result<(), ChannelError>;

    /// Subscribe to the room's replicated state.
    ///
    /// The receiver holds the latest state immediately; intermediate
    /// states may be skipped under load, which is exactly the
    /// latest-value contract reconciliation needs. Once the last
    /// receiver for a room is dropped the channel may release its
    /// subscription to that room.
    async fn subscribe(&self, room: &RoomId) -> Result<watch::Receiver<RoomState>, ChannelError>;
}
