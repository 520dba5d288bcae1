//! Simulated Audio Transport
//!
//! In-process stand-in for a real player. Position advances with the
//! tokio clock while playing, so tests driving `tokio::time` control
//! playback progress exactly. Also doubles as the demo transport for
//! the CLI when no real player is reachable.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{Player, PlayerError};
use crate::session::SongId;

/// A transport mutation the simulated player has performed or attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerAction {
    Load(SongId),
    Seek(u64),
    Play,
    Pause,
}

struct SimState {
    song: Option<SongId>,
    playing: bool,
    /// Position at the moment `anchored` was taken
    position_ms: u64,
    anchored: Instant,
    #[cfg(test)]
    actions: Vec<PlayerAction>,
    failing_loads: HashSet<SongId>,
}

impl SimState {
    fn current_position(&self) -> u64 {
        if self.playing {
            self.position_ms
                .saturating_add(self.anchored.elapsed().as_millis() as u64)
        } else {
            self.position_ms
        }
    }

    #[cfg(test)]
    fn record(&mut self, action: PlayerAction) {
        self.actions.push(action);
    }

    #[cfg(not(test))]
    fn record(&mut self, _action: PlayerAction) {}
}

/// Simulated local player
pub struct SimulatedPlayer {
    state: Mutex<SimState>,
}

impl SimulatedPlayer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                song: None,
                playing: false,
                position_ms: 0,
                anchored: Instant::now(),
                #[cfg(test)]
                actions: Vec::new(),
                failing_loads: HashSet::new(),
            }),
        }
    }

    /// Make `load` fail (or succeed again) for a specific song
    #[cfg(test)]
    pub(crate) fn set_load_failure(&self, song: SongId, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_loads.insert(song);
        } else {
            state.failing_loads.remove(&song);
        }
    }

    /// Transport mutations recorded since the last call to `clear_actions`
    #[cfg(test)]
    pub(crate) fn actions(&self) -> Vec<PlayerAction> {
        self.state.lock().actions.clone()
    }

    #[cfg(test)]
    pub(crate) fn clear_actions(&self) {
        self.state.lock().actions.clear();
    }
}

impl Default for SimulatedPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Player for SimulatedPlayer {
    async fn load(&self, song: SongId) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        state.record(PlayerAction::Load(song));
        if state.failing_loads.contains(&song) {
            return Err(PlayerError::Resolve(song));
        }
        debug!("sim: loaded song {}", song);
        state.song = Some(song);
        state.playing = false;
        state.position_ms = 0;
        state.anchored = Instant::now();
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        state.record(PlayerAction::Seek(position_ms));
        state.position_ms = position_ms;
        state.anchored = Instant::now();
        Ok(())
    }

    async fn play(&self) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        state.record(PlayerAction::Play);
        if !state.playing {
            state.playing = true;
            state.anchored = Instant::now();
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        state.record(PlayerAction::Pause);
        if state.playing {
            state.position_ms = state.current_position();
            state.playing = false;
        }
        Ok(())
    }

    async fn position_ms(&self) -> Result<u64, PlayerError> {
        Ok(self.state.lock().current_position())
    }

    async fn is_playing(&self) -> Result<bool, PlayerError> {
        Ok(self.state.lock().playing)
    }

    async fn current_song(&self) -> Result<Option<SongId>, PlayerError> {
        Ok(self.state.lock().song)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_position_advances_while_playing() {
        let player = SimulatedPlayer::new();
        player.load(SongId(1)).await.unwrap();
        player.play().await.unwrap();

        time::advance(Duration::from_millis(2500)).await;
        assert_eq!(player.position_ms().await.unwrap(), 2500);

        player.pause().await.unwrap();
        time::advance(Duration::from_millis(1000)).await;
        assert_eq!(player.position_ms().await.unwrap(), 2500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_rebases_position() {
        let player = SimulatedPlayer::new();
        player.load(SongId(1)).await.unwrap();
        player.play().await.unwrap();

        time::advance(Duration::from_millis(500)).await;
        player.seek(10_000).await.unwrap();
        time::advance(Duration::from_millis(300)).await;
        assert_eq!(player.position_ms().await.unwrap(), 10_300);
    }

    #[tokio::test]
    async fn test_load_resets_transport() {
        let player = SimulatedPlayer::new();
        player.load(SongId(1)).await.unwrap();
        player.seek(5000).await.unwrap();
        player.play().await.unwrap();

        player.load(SongId(2)).await.unwrap();
        assert_eq!(player.current_song().await.unwrap(), Some(SongId(2)));
        assert_eq!(player.position_ms().await.unwrap(), 0);
        assert!(!player.is_playing().await.unwrap());
    }

    #[tokio::test]
    async fn test_load_failure_keeps_previous_song() {
        let player = SimulatedPlayer::new();
        player.load(SongId(1)).await.unwrap();
        player.play().await.unwrap();
        player.set_load_failure(SongId(9), true);

        let err = player.load(SongId(9)).await.unwrap_err();
        assert!(matches!(err, PlayerError::Resolve(SongId(9))));
        assert_eq!(player.current_song().await.unwrap(), Some(SongId(1)));
        assert!(player.is_playing().await.unwrap());
    }

    #[tokio::test]
    async fn test_action_log_records_attempts() {
        let player = SimulatedPlayer::new();
        player.set_load_failure(SongId(9), true);
        let _ = player.load(SongId(9)).await;
        player.load(SongId(1)).await.unwrap();
        player.seek(42).await.unwrap();
        player.play().await.unwrap();

        assert_eq!(
            player.actions(),
            vec![
                PlayerAction::Load(SongId(9)),
                PlayerAction::Load(SongId(1)),
                PlayerAction::Seek(42),
                PlayerAction::Play,
            ]
        );

        player.clear_actions();
        assert!(player.actions().is_empty());
    }
}
