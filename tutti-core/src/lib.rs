//! Tutti - Listening Session Core
//!
//! This library keeps a group of listeners in step with one host's
//! playback. The host publishes a small session document to a shared
//! room; followers estimate where the host is now and nudge their own
//! player toward it. A shared queue carries song suggestions for the
//! host to pick from.

pub mod channel;
pub mod player;
pub mod room;
pub mod session;

// Re-exports for convenience
pub use channel::{GossipChannel, InMemoryChannel, RoomId, SessionChannel};
pub use player::{HttpPlayer, Player, SimulatedPlayer};
pub use room::{RoomClient, RoomError, RoomEvent};
pub use session::{RoomState, SessionDocument, SongId, UserId};
