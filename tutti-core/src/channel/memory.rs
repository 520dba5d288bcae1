//! In-Process Room Channel
//!
//! Authoritative store for rooms living inside one process: every write
//! folds through the same `RoomView` rules as the wire protocol, then
//! fans out to subscribers through a `watch` channel per room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::wire::{RoomMessage, RoomView};
use super::{ChannelError, RoomId, SessionChannel};
use crate::session::{EntryKey, JoinRecord, QueueEntry, RoomState, SessionDocument, UserId};

struct RoomCell {
    view: RoomView,
    tx: watch::Sender<RoomState>,
}

impl RoomCell {
    fn new() -> Self {
        let view = RoomView::new();
        let (tx, _rx) = watch::channel(view.state().clone());
        Self { view, tx }
    }
}

/// Process-local `SessionChannel` for tests and same-process rooms
#[derive(Default)]
pub struct InMemoryChannel {
    rooms: Mutex<HashMap<RoomId, RoomCell>>,
    fail_writes: AtomicBool,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn apply(&self, room: &RoomId, message: RoomMessage) -> Result<(), ChannelError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChannelError::Backend("write refused".to_string()));
        }

        let mut rooms = self.rooms.lock();
        let cell = rooms.entry(room.clone()).or_insert_with(RoomCell::new);
        if cell.view.apply(&message) {
            cell.tx.send_replace(cell.view.state().clone());
        }
        Ok(())
    }
}

#[async_trait]
impl SessionChannel for InMemoryChannel {
    async fn publish_session(
        &self,
        room: &RoomId,
        document: SessionDocument,
    ) -> Result<(), ChannelError> {
        document.validate()?;
        self.apply(room, RoomMessage::Session { document })
    }

    async fn clear_session(&self, room: &RoomId, host_id: UserId) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::SessionCleared { host_id })
    }

    async fn join(
        &self,
        room: &RoomId,
        user_id: UserId,
        record: JoinRecord,
    ) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::Joined { user_id, record })
    }

    async fn leave(&self, room: &RoomId, user_id: UserId) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::Left { user_id })
    }

    async fn suggest(
        &self,
        room: &RoomId,
        key: EntryKey,
        entry: QueueEntry,
    ) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::QueueAdded { key, entry })
    }

    async fn discard(&self, room: &RoomId, key: &EntryKey) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::QueueRemoved { key: key.clone() })
    }

    async fn subscribe(&self, room: &RoomId) -> Result<watch::Receiver<RoomState>, ChannelError> {
        let mut rooms = self.rooms.lock();
        let cell = rooms.entry(room.clone()).or_insert_with(RoomCell::new);
        Ok(cell.tx.subscribe())
    }
}

/// [`InMemoryChannel`] wrapper for tests that need a write caught
/// mid-flight: while held, a publish applies to the room and then waits
/// for an acknowledgement, like a backend whose write is already out
/// while the caller still awaits the result.
#[cfg(test)]
pub(crate) struct StallingChannel {
    inner: InMemoryChannel,
    hold_publishes: AtomicBool,
    acks: tokio::sync::Semaphore,
}

#[cfg(test)]
impl StallingChannel {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryChannel::new(),
            hold_publishes: AtomicBool::new(false),
            acks: tokio::sync::Semaphore::new(0),
        }
    }

    pub(crate) fn hold_publishes(&self, hold: bool) {
        self.hold_publishes.store(hold, Ordering::SeqCst);
    }

    /// Let one held publish complete
    pub(crate) fn release_one(&self) {
        self.acks.add_permits(1);
    }
}

#[cfg(test)]
#[async_trait]
impl SessionChannel for StallingChannel {
    async fn publish_session(
        &self,
        room: &RoomId,
        document: SessionDocument,
    ) -> Result<(), ChannelError> {
        self.inner.publish_session(room, document).await?;
        if self.hold_publishes.load(Ordering::SeqCst) {
            let permit = self.acks.acquire().await.map_err(|_| ChannelError::Closed)?;
            permit.forget();
        }
        Ok(())
    }

    async fn clear_session(&self, room: &RoomId, host_id: UserId) -> Result<(), ChannelError> {
        self.inner.clear_session(room, host_id).await
    }

    async fn join(
        &self,
        room: &RoomId,
        user_id: UserId,
        record: JoinRecord,
    ) -> Result<(), ChannelError> {
        self.inner.join(room, user_id, record).await
    }

    async fn leave(&self, room: &RoomId, user_id: UserId) -> Result<(), ChannelError> {
        self.inner.leave(room, user_id).await
    }

    async fn suggest(
        &self,
        room: &RoomId,
        key: EntryKey,
        entry: QueueEntry,
    ) -> Result<(), ChannelError> {
        self.inner.suggest(room, key, entry).await
    }

    async fn discard(&self, room: &RoomId, key: &EntryKey) -> Result<(), ChannelError> {
        self.inner.discard(room, key).await
    }

    async fn subscribe(&self, room: &RoomId) -> Result<watch::Receiver<RoomState>, ChannelError> {
        self.inner.subscribe(room).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SongId;

    fn doc(host: u64, song: u64, updated_at: u64) -> SessionDocument {
        SessionDocument {
            host_id: UserId(host),
            song_id: Some(SongId(song)),
            position_ms: 0,
            is_playing: true,
            updated_at,
        }
    }

    fn record(name: &str, at: u64) -> JoinRecord {
        JoinRecord { display_name: name.to_string(), joined_at: at }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_latest_state() {
        let channel = InMemoryChannel::new();
        let room = RoomId::playlist(1);

        channel.publish_session(&room, doc(1, 7, 1000)).await.unwrap();

        // A late subscriber sees the current document without waiting
        let rx = channel.subscribe(&room).await.unwrap();
        assert_eq!(rx.borrow().host_id(), Some(UserId(1)));
    }

    #[tokio::test]
    async fn test_changes_notify_subscribers() {
        let channel = InMemoryChannel::new();
        let room = RoomId::playlist(1);

        let mut rx = channel.subscribe(&room).await.unwrap();
        channel.publish_session(&room, doc(1, 7, 1000)).await.unwrap();

        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().has_session());

        channel.join(&room, UserId(5), record("ana", 1100)).await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_participant(UserId(5)));
    }

    #[tokio::test]
    async fn test_stale_publish_discarded_without_notification() {
        let channel = InMemoryChannel::new();
        let room = RoomId::playlist(1);

        channel.publish_session(&room, doc(1, 7, 2000)).await.unwrap();
        let rx = channel.subscribe(&room).await.unwrap();

        channel.publish_session(&room, doc(1, 7, 1000)).await.unwrap();
        assert!(!rx.has_changed().unwrap());
        assert_eq!(rx.borrow().session.as_ref().map(|d| d.updated_at), Some(2000));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let channel = InMemoryChannel::new();
        let room = RoomId::playlist(1);

        channel.publish_session(&room, doc(1, 7, 1000)).await.unwrap();
        channel.join(&room, UserId(5), record("ana", 1100)).await.unwrap();

        channel.clear_session(&room, UserId(1)).await.unwrap();
        channel.clear_session(&room, UserId(1)).await.unwrap();

        let rx = channel.subscribe(&room).await.unwrap();
        let state = rx.borrow().clone();
        assert!(state.session.is_none());
        assert!(state.participants.is_empty());
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_document_rejected_at_publish() {
        let channel = InMemoryChannel::new();
        let room = RoomId::playlist(1);

        let mut playing_nothing = doc(1, 7, 1000);
        playing_nothing.song_id = None;
        let err = channel.publish_session(&room, playing_nothing).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let channel = InMemoryChannel::new();
        let room = RoomId::playlist(1);

        channel.set_fail_writes(true);
        let err = channel.publish_session(&room, doc(1, 7, 1000)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Backend(_)));

        channel.set_fail_writes(false);
        channel.publish_session(&room, doc(1, 7, 1000)).await.unwrap();
    }
}
