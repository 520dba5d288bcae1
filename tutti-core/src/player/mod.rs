//! Audio Transport
//!
//! The local player a client drives: the host reads its state to publish,
//! followers mutate it through reconciliation. Loading a song includes
//! resolving a playable stream, so it can fail independently of the
//! transport controls.

mod http;
mod sim;

pub use http::{HttpPlayer, DEFAULT_PORT};
pub use sim::{PlayerAction, SimulatedPlayer};

use async_trait::async_trait;
use thiserror::Error;

use crate::session::SongId;

/// Errors from the local audio transport
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Player is not running or not reachable")]
    NotReachable,

    #[error("Invalid API token")]
    Unauthorized,

    #[error("Could not resolve a stream for song {0}")]
    Resolve(SongId),

    #[error("Player API error: {0}")]
    Api(String),
}

/// Local playback transport
#[async_trait]
pub trait Player: Send + Sync {
    /// Resolve a playable stream for `song` and make it current.
    ///
    /// The freshly loaded song starts paused at position zero. On
    /// failure the previously loaded song and transport state are left
    /// untouched.
    async fn load(&self, song: SongId) -> Result<(), PlayerError>;

    /// Seek to an absolute position
    async fn seek(&self, position_ms: u64) -> Result<(), PlayerError>;

    /// Resume playback
    async fn play(&self) -> Result<(), PlayerError>;

    /// Pause playback
    async fn pause(&self) -> Result<(), PlayerError>;

    /// Current playback offset; zero when nothing is loaded
    async fn position_ms(&self) -> Result<u64, PlayerError>;

    /// Whether the transport is currently playing
    async fn is_playing(&self) -> Result<bool, PlayerError>;

    /// Currently loaded song, if any
    async fn current_song(&self) -> Result<Option<SongId>, PlayerError>;
}
