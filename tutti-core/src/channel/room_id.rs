//! Room Identifiers
//!
//! Rooms are tied to shared playlists; the id doubles as the channel
//! address (topic name, store key) for the room.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum accepted id length
const MAX_LENGTH: usize = 64;

/// A validated room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Room id for a shared playlist
    pub fn playlist(playlist_id: u64) -> Self {
        RoomId(format!("playlist-{playlist_id}"))
    }

    /// Get the room id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a room id from user input.
    ///
    /// Normalizes to lowercase; accepts ASCII letters, digits and
    /// hyphens, with no leading/trailing hyphen.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized: String = input.trim().to_ascii_lowercase();

        if normalized.is_empty() || normalized.len() > MAX_LENGTH {
            return None;
        }
        if normalized.starts_with('-') || normalized.ends_with('-') {
            return None;
        }
        if normalized
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            Some(RoomId(normalized))
        } else {
            None
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_parse() {
        let id = RoomId::parse("Playlist-42").unwrap();
        assert_eq!(id.as_str(), "playlist-42");

        let id = RoomId::parse("  jam-night  ").unwrap();
        assert_eq!(id.as_str(), "jam-night");

        assert!(RoomId::parse("").is_none());
        assert!(RoomId::parse("-leading").is_none());
        assert!(RoomId::parse("trailing-").is_none());
        assert!(RoomId::parse("no spaces").is_none());
        assert!(RoomId::parse(&"x".repeat(65)).is_none());
    }

    #[test]
    fn test_playlist_room_id() {
        let id = RoomId::playlist(42);
        assert_eq!(id.as_str(), "playlist-42");
        assert_eq!(format!("{}", id), "playlist-42");
        assert_eq!(RoomId::parse("playlist-42"), Some(id));
    }
}
