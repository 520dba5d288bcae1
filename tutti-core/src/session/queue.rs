//! Suggestion Queue
//!
//! Append-only song suggestions keyed by opaque entry keys. Anyone in
//! the room may append; only the host removes, either by discarding or
//! by consuming an entry to play it.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::channel::{ChannelError, RoomId, SessionChannel};
use crate::session::document::{current_time_ms, EntryKey, QueueEntry, RoomState, SongId, UserId};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Only the host may modify the queue")]
    NotHost,

    #[error("No such queue entry")]
    UnknownEntry,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub struct SuggestionQueueManager {
    channel: Arc<dyn SessionChannel>,
    room: RoomId,
    user: UserId,
}

impl SuggestionQueueManager {
    pub fn new(channel: Arc<dyn SessionChannel>, room: RoomId, user: UserId) -> Self {
        Self { channel, room, user }
    }

    /// Append a suggestion. Duplicate songs are allowed; every call
    /// creates a distinct entry.
    pub async fn suggest(&self, song: SongId) -> Result<EntryKey, QueueError> {
        let now = current_time_ms();
        let key = EntryKey::generate(now);
        let entry = QueueEntry {
            song_id: song,
            suggested_by: self.user,
            suggested_at: now,
        };
        self.channel.suggest(&self.room, key.clone(), entry).await?;
        info!("suggested song {} as entry {}", song, key);
        Ok(key)
    }

    /// Entries in playback order: suggestion time, then key
    pub fn list_ordered<'a>(&self, state: &'a RoomState) -> Vec<(&'a EntryKey, &'a QueueEntry)> {
        state.queue_ordered()
    }

    /// Drop an entry without playing it. Host only.
    pub async fn discard(&self, state: &RoomState, key: &EntryKey) -> Result<(), QueueError> {
        self.authorize(state)?;
        if !state.queue.contains_key(key) {
            return Err(QueueError::UnknownEntry);
        }
        self.channel.discard(&self.room, key).await?;
        debug!("discarded queue entry {}", key);
        Ok(())
    }

    /// Take an entry in order to play it; removed for everyone. Host only.
    pub async fn consume(&self, state: &RoomState, key: &EntryKey) -> Result<QueueEntry, QueueError> {
        self.authorize(state)?;
        let entry = state
            .queue
            .get(key)
            .cloned()
            .ok_or(QueueError::UnknownEntry)?;
        self.channel.discard(&self.room, key).await?;
        info!("consumed queue entry {}: song {}", key, entry.song_id);
        Ok(entry)
    }

    fn authorize(&self, state: &RoomState) -> Result<(), QueueError> {
        if state.is_host(self.user) {
            Ok(())
        } else {
            Err(QueueError::NotHost)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use crate::session::document::SessionDocument;

    async fn setup() -> (
        Arc<InMemoryChannel>,
        RoomId,
        SuggestionQueueManager,
        SuggestionQueueManager,
    ) {
        let channel = Arc::new(InMemoryChannel::new());
        let room = RoomId::playlist(1);
        channel
            .publish_session(
                &room,
                SessionDocument {
                    host_id: UserId(1),
                    song_id: Some(SongId(7)),
                    position_ms: 0,
                    is_playing: true,
                    updated_at: current_time_ms(),
                },
            )
            .await
            .unwrap();

        let host = SuggestionQueueManager::new(channel.clone(), room.clone(), UserId(1));
        let guest = SuggestionQueueManager::new(channel.clone(), room.clone(), UserId(2));
        (channel, room, host, guest)
    }

    async fn snapshot(channel: &Arc<InMemoryChannel>, room: &RoomId) -> RoomState {
        channel.subscribe(room).await.unwrap().borrow().clone()
    }

    #[tokio::test]
    async fn test_suggest_appends_entry() {
        let (channel, room, _host, guest) = setup().await;

        let key = guest.suggest(SongId(42)).await.unwrap();

        let state = snapshot(&channel, &room).await;
        let entry = state.queue.get(&key).unwrap();
        assert_eq!(entry.song_id, SongId(42));
        assert_eq!(entry.suggested_by, UserId(2));
    }

    #[tokio::test]
    async fn test_duplicate_suggestions_coexist() {
        let (channel, room, host, guest) = setup().await;

        let first = guest.suggest(SongId(42)).await.unwrap();
        let second = host.suggest(SongId(42)).await.unwrap();
        assert_ne!(first, second);

        let state = snapshot(&channel, &room).await;
        assert_eq!(state.queue.len(), 2);
        assert!(state.queue.values().all(|e| e.song_id == SongId(42)));
    }

    #[tokio::test]
    async fn test_list_ordered_by_suggestion_time() {
        let (channel, room, host, guest) = setup().await;

        guest.suggest(SongId(10)).await.unwrap();
        guest.suggest(SongId(11)).await.unwrap();
        host.suggest(SongId(12)).await.unwrap();

        let state = snapshot(&channel, &room).await;
        let listed = host.list_ordered(&state);
        assert_eq!(listed.len(), 3);
        for pair in listed.windows(2) {
            let (key_a, entry_a) = pair[0];
            let (key_b, entry_b) = pair[1];
            assert!(
                (entry_a.suggested_at, key_a) <= (entry_b.suggested_at, key_b),
                "queue not in playback order"
            );
        }
    }

    #[tokio::test]
    async fn test_discard_requires_host() {
        let (channel, room, host, guest) = setup().await;
        let key = guest.suggest(SongId(42)).await.unwrap();

        // Rejected locally, before any channel write
        channel.set_fail_writes(true);
        let err = guest.discard(&snapshot(&channel, &room).await, &key).await.unwrap_err();
        assert!(matches!(err, QueueError::NotHost));
        channel.set_fail_writes(false);

        host.discard(&snapshot(&channel, &room).await, &key).await.unwrap();
        assert!(snapshot(&channel, &room).await.queue.is_empty());
    }

    #[tokio::test]
    async fn test_consume_returns_entry_and_removes_it() {
        let (channel, room, host, guest) = setup().await;
        let key = guest.suggest(SongId(42)).await.unwrap();

        let entry = host.consume(&snapshot(&channel, &room).await, &key).await.unwrap();
        assert_eq!(entry.song_id, SongId(42));
        assert_eq!(entry.suggested_by, UserId(2));
        assert!(snapshot(&channel, &room).await.queue.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_entry_rejected() {
        let (channel, room, host, _guest) = setup().await;

        let bogus = EntryKey::generate(current_time_ms());
        let err = host.discard(&snapshot(&channel, &room).await, &bogus).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownEntry));
    }
}
