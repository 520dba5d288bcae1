//! Host Publishing
//!
//! The host is the only writer of a room's session document. It polls
//! its local player and republishes, suppressing writes that would not
//! change what followers do.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, RoomId, SessionChannel};
use crate::session::document::{current_time_ms, SessionDocument, SongId, UserId};

/// Position delta below which a tick republish is suppressed
pub const POSITION_PUBLISH_THRESHOLD_MS: u64 = 1000;

struct HostInner {
    /// Document most recently accepted by the channel; `None` when not hosting
    last_published: Option<SessionDocument>,
    /// Bumped when hosting ends so a publish still in flight at that
    /// moment cannot re-arm `last_published` when it completes
    generation: u64,
}

/// Publishes the session document for a room this user hosts
pub struct HostController {
    channel: Arc<dyn SessionChannel>,
    room: RoomId,
    user: UserId,
    inner: Mutex<HostInner>,
}

impl HostController {
    pub fn new(channel: Arc<dyn SessionChannel>, room: RoomId, user: UserId) -> Self {
        Self {
            channel,
            room,
            user,
            inner: Mutex::new(HostInner {
                last_published: None,
                generation: 0,
            }),
        }
    }

    pub fn is_hosting(&self) -> bool {
        self.inner.lock().last_published.is_some()
    }

    fn build_document(&self, song: Option<SongId>, position_ms: u64, playing: bool) -> SessionDocument {
        SessionDocument {
            host_id: self.user,
            song_id: song,
            position_ms,
            is_playing: playing,
            updated_at: current_time_ms(),
        }
    }

    /// Record a publish the channel accepted. Dropped when `stop` or
    /// `abdicate` ran while the write was in flight.
    fn commit_publish(&self, document: SessionDocument, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.last_published = Some(document);
        }
    }

    /// Begin hosting, or republish with a new song or transport state.
    ///
    /// Used when the user starts a session and when the host switches
    /// songs deliberately (e.g. playing a queue suggestion).
    pub async fn start_or_retarget(
        &self,
        song: Option<SongId>,
        position_ms: u64,
        playing: bool,
    ) -> Result<(), ChannelError> {
        let generation = self.inner.lock().generation;
        let document = self.build_document(song, position_ms, playing);
        self.channel.publish_session(&self.room, document.clone()).await?;
        info!(
            "hosting room {}: song={:?} position={}ms playing={}",
            self.room, song, position_ms, playing
        );
        self.commit_publish(document, generation);
        Ok(())
    }

    /// Periodic host tick with fresh local player readings.
    ///
    /// Publishes only when the song changed, the play state flipped, or
    /// the position moved further than [`POSITION_PUBLISH_THRESHOLD_MS`]
    /// since the last accepted publish. A failed publish keeps the
    /// previous document, so the same condition fires again next tick.
    pub async fn on_local_tick(&self, song: Option<SongId>, position_ms: u64, playing: bool) {
        let (document, generation) = {
            let inner = self.inner.lock();
            let last = match &inner.last_published {
                Some(last) => last,
                None => return,
            };

            let changed = last.song_id != song
                || last.is_playing != playing
                || last.position_ms.abs_diff(position_ms) > POSITION_PUBLISH_THRESHOLD_MS;
            if !changed {
                return;
            }

            (self.build_document(song, position_ms, playing), inner.generation)
        };

        match self.channel.publish_session(&self.room, document.clone()).await {
            Ok(()) => {
                debug!(
                    "published update for {}: song={:?} position={}ms playing={}",
                    self.room, song, position_ms, playing
                );
                self.commit_publish(document, generation);
            }
            Err(e) => warn!("publish for {} failed, retrying next tick: {}", self.room, e),
        }
    }

    /// Forced periodic publish while the host's player is playing.
    ///
    /// Keeps `updated_at` fresh so follower drift estimates stay
    /// accurate even when the position advances too little to trip the
    /// tick threshold.
    pub async fn heartbeat(&self, song: Option<SongId>, position_ms: u64, playing: bool) {
        let generation = {
            let inner = self.inner.lock();
            if inner.last_published.is_none() {
                return;
            }
            inner.generation
        };

        let document = self.build_document(song, position_ms, playing);
        match self.channel.publish_session(&self.room, document.clone()).await {
            Ok(()) => {
                debug!("heartbeat for {}: position={}ms", self.room, position_ms);
                self.commit_publish(document, generation);
            }
            Err(e) => warn!("heartbeat for {} failed: {}", self.room, e),
        }
    }

    /// End the session for everyone. Idempotent.
    ///
    /// Taking the host state happens before the clear goes out, so a
    /// publish acknowledged after the stop cannot re-arm it.
    pub async fn stop(&self) -> Result<(), ChannelError> {
        let taken = {
            let mut inner = self.inner.lock();
            match inner.last_published.take() {
                Some(document) => {
                    inner.generation += 1;
                    document
                }
                None => return Ok(()),
            }
        };

        if let Err(e) = self.channel.clear_session(&self.room, self.user).await {
            // Still hosting; the next stop retries the clear
            self.inner.lock().last_published = Some(taken);
            return Err(e);
        }

        info!("stopped hosting room {}", self.room);
        Ok(())
    }

    /// Drop hosting state without clearing the room.
    ///
    /// Used when a concurrent host published a fresher document and won
    /// the race; the room now belongs to them.
    pub(crate) fn abdicate(&self) {
        let mut inner = self.inner.lock();
        if inner.last_published.take().is_some() {
            inner.generation += 1;
            warn!("superseded by another host in {}", self.room);
        }
    }
}
