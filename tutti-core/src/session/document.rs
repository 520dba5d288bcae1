//! Session Document Model
//!
//! The replicated state of a listening room: one host-owned session
//! document, a presence map of joined followers, and the suggestion queue.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a user of the music service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a song in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SongId(pub u64);

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Presence record for a follower who explicitly joined the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRecord {
    /// Display name chosen by the user
    pub display_name: String,
    /// When the user joined (wall-clock ms since epoch)
    pub joined_at: u64,
}

/// Host-authoritative transport state, overwritten in place on every publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDocument {
    /// Current authoritative host
    pub host_id: UserId,
    /// Song currently selected by the host, if any
    pub song_id: Option<SongId>,
    /// Host-reported playback offset at `updated_at`
    pub position_ms: u64,
    /// Whether the host transport is playing
    pub is_playing: bool,
    /// Wall-clock ms since epoch, set by the host on every publish.
    /// Drift-correction anchor, not a causal clock.
    pub updated_at: u64,
}

impl SessionDocument {
    /// Identity fingerprint of the session: host and song only.
    ///
    /// `updated_at` advances on every heartbeat, so it must not
    /// participate in "is this still the same session" comparisons.
    pub fn fingerprint(&self) -> SessionFingerprint {
        SessionFingerprint {
            host_id: self.host_id,
            song_id: self.song_id,
        }
    }

    /// Last-write-wins comparison against a previously applied document
    pub fn supersedes(&self, other: &SessionDocument) -> bool {
        self.updated_at >= other.updated_at
    }

    /// Reject documents that cannot describe a real host transport
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.updated_at == 0 {
            return Err(DocumentError::MissingTimestamp);
        }
        if self.is_playing && self.song_id.is_none() {
            return Err(DocumentError::PlayingWithoutSong);
        }
        Ok(())
    }
}

/// Malformed session document received from the channel
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("document has no publish timestamp")]
    MissingTimestamp,

    #[error("document claims playback with no song selected")]
    PlayingWithoutSong,
}

/// Session identity used for manual-leave suppression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFingerprint {
    pub host_id: UserId,
    pub song_id: Option<SongId>,
}

/// A song proposed for the host to play next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Proposed song
    pub song_id: SongId,
    /// Who suggested it
    pub suggested_by: UserId,
    /// When it was suggested (wall-clock ms since epoch)
    pub suggested_at: u64,
}

/// Characters used in entry keys, ASCII-ordered so that key order
/// follows generation order within the timestamp prefix
const KEY_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Width of the encoded timestamp prefix (36^9 ms reaches past year 5000)
const KEY_TIME_WIDTH: usize = 9;

/// Random suffix length guarding against same-millisecond collisions
const KEY_RANDOM_WIDTH: usize = 6;

/// Opaque key for a queue entry.
///
/// Generated client-side at suggest time: a fixed-width timestamp prefix
/// followed by a random suffix, so keys from different clients never
/// collide and lexicographic key order roughly tracks suggestion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryKey(String);

impl EntryKey {
    /// Generate a fresh key for an entry suggested at `now_ms`
    pub fn generate(now_ms: u64) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut key = String::with_capacity(KEY_TIME_WIDTH + KEY_RANDOM_WIDTH);

        // Timestamp prefix, most significant digit first
        let mut remaining = now_ms;
        let mut prefix = [0u8; KEY_TIME_WIDTH];
        for slot in prefix.iter_mut().rev() {
            *slot = KEY_ALPHABET[(remaining % KEY_ALPHABET.len() as u64) as usize];
            remaining /= KEY_ALPHABET.len() as u64;
        }
        for b in prefix {
            key.push(b as char);
        }

        for _ in 0..KEY_RANDOM_WIDTH {
            let idx = rng.gen_range(0..KEY_ALPHABET.len());
            key.push(KEY_ALPHABET[idx] as char);
        }

        EntryKey(key)
    }

    /// Get the key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a room replicates: the session document, the follower
/// presence map and the suggestion queue.
///
/// Each region has exactly one kind of writer (host, join/leave machine,
/// suggesting participants) so concurrent writes never clobber another
/// writer's region.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    /// Active session document, absent when no one is hosting
    pub session: Option<SessionDocument>,
    /// Followers who have explicitly joined
    pub participants: BTreeMap<UserId, JoinRecord>,
    /// Suggested songs keyed by opaque entry key
    pub queue: BTreeMap<EntryKey, QueueEntry>,
}

impl RoomState {
    /// Check whether a session is active
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Current host, if a session is active
    pub fn host_id(&self) -> Option<UserId> {
        self.session.as_ref().map(|doc| doc.host_id)
    }

    /// Check whether `user` is the current host
    pub fn is_host(&self, user: UserId) -> bool {
        self.host_id() == Some(user)
    }

    /// Check whether `user` has joined as a follower
    pub fn is_participant(&self, user: UserId) -> bool {
        self.participants.contains_key(&user)
    }

    /// Identity fingerprint of the active session
    pub fn fingerprint(&self) -> Option<SessionFingerprint> {
        self.session.as_ref().map(SessionDocument::fingerprint)
    }

    /// Followers ordered by join time, then display name
    pub fn participant_list(&self) -> Vec<(UserId, &JoinRecord)> {
        let mut list: Vec<(UserId, &JoinRecord)> =
            self.participants.iter().map(|(id, rec)| (*id, rec)).collect();
        list.sort_by(|(_, a), (_, b)| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()))
        });
        list
    }

    /// Queue entries ordered ascending by suggestion time.
    ///
    /// Ties break on the entry key, so the order is deterministic and
    /// stable: `suggested_at` is assigned once at creation.
    pub fn queue_ordered(&self) -> Vec<(&EntryKey, &QueueEntry)> {
        let mut list: Vec<(&EntryKey, &QueueEntry)> = self.queue.iter().collect();
        list.sort_by(|(ka, a), (kb, b)| a.suggested_at.cmp(&b.suggested_at).then_with(|| ka.cmp(kb)));
        list
    }
}

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(host: u64, song: Option<u64>, updated_at: u64) -> SessionDocument {
        SessionDocument {
            host_id: UserId(host),
            song_id: song.map(SongId),
            position_ms: 0,
            is_playing: song.is_some(),
            updated_at,
        }
    }

    #[test]
    fn test_fingerprint_ignores_heartbeat_fields() {
        let a = doc(1, Some(7), 1000);
        let mut b = doc(1, Some(7), 9000);
        b.position_ms = 55_000;
        assert_eq!(a.fingerprint(), b.fingerprint());

        let other_song = doc(1, Some(8), 1000);
        assert_ne!(a.fingerprint(), other_song.fingerprint());

        let other_host = doc(2, Some(7), 1000);
        assert_ne!(a.fingerprint(), other_host.fingerprint());
    }

    #[test]
    fn test_validate_rejects_malformed_documents() {
        assert!(doc(1, Some(7), 1000).validate().is_ok());

        let mut playing_nothing = doc(1, None, 1000);
        playing_nothing.is_playing = true;
        assert_eq!(
            playing_nothing.validate(),
            Err(DocumentError::PlayingWithoutSong)
        );

        assert_eq!(doc(1, Some(7), 0).validate(), Err(DocumentError::MissingTimestamp));
    }

    #[test]
    fn test_supersedes_is_last_write_wins() {
        let older = doc(1, Some(7), 1000);
        let newer = doc(2, Some(9), 2000);
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        // Equal timestamps: the incoming write wins, matching overwrite semantics
        assert!(older.supersedes(&older.clone()));
    }

    #[test]
    fn test_entry_keys_sort_by_generation_time() {
        let early = EntryKey::generate(1_000);
        let late = EntryKey::generate(2_000_000_000_000);
        assert!(early < late);
        assert_eq!(early.as_str().len(), KEY_TIME_WIDTH + KEY_RANDOM_WIDTH);
    }

    #[test]
    fn test_entry_keys_differ_within_one_millisecond() {
        let a = EntryKey::generate(42);
        let b = EntryKey::generate(42);
        assert_ne!(a, b);
    }

    #[test]
    fn test_queue_ordered_by_suggestion_time() {
        let mut state = RoomState::default();
        for (at, song) in [(100u64, 1u64), (50, 2), (75, 3)] {
            state.queue.insert(
                EntryKey::generate(at),
                QueueEntry {
                    song_id: SongId(song),
                    suggested_by: UserId(9),
                    suggested_at: at,
                },
            );
        }

        let times: Vec<u64> = state.queue_ordered().iter().map(|(_, e)| e.suggested_at).collect();
        assert_eq!(times, vec![50, 75, 100]);
    }

    #[test]
    fn test_participant_list_ordered_by_join_time() {
        let mut state = RoomState::default();
        state.participants.insert(
            UserId(3),
            JoinRecord { display_name: "Cleo".into(), joined_at: 300 },
        );
        state.participants.insert(
            UserId(1),
            JoinRecord { display_name: "Ana".into(), joined_at: 100 },
        );
        state.participants.insert(
            UserId(2),
            JoinRecord { display_name: "Bo".into(), joined_at: 100 },
        );

        let order: Vec<UserId> = state.participant_list().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![UserId(1), UserId(2), UserId(3)]);
    }
}
