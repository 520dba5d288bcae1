//! Follower Reconciliation
//!
//! Pulls a joined follower's local player toward the host's published
//! document. All corrections derive from the document alone; followers
//! never write the session region.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::player::{Player, PlayerError};
use crate::session::document::{current_time_ms, RoomState, SessionDocument, UserId};

/// Deviation beyond which a follower issues a corrective seek.
///
/// Kept strictly below the host's position publish threshold so a
/// fresh heartbeat never makes a well-synced follower seek.
pub const CORRECTION_THRESHOLD_MS: u64 = 800;

/// Estimated playback advance since the document was published.
///
/// Zero while paused. Clock skew that puts `updated_at` in the future
/// also yields zero rather than rewinding the target.
pub fn drift_estimate_ms(document: &SessionDocument, now_ms: u64) -> u64 {
    if document.is_playing {
        now_ms.saturating_sub(document.updated_at)
    } else {
        0
    }
}

/// Position the host is estimated to be at right now
pub fn target_position_ms(document: &SessionDocument, now_ms: u64) -> u64 {
    document
        .position_ms
        .saturating_add(drift_estimate_ms(document, now_ms))
}

/// Why a reconciliation pass did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSession,
    SelfIsHost,
    NotJoined,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    Synced {
        /// A different song was loaded
        loaded: bool,
        /// A corrective seek was issued
        corrected: bool,
        /// Play state was flipped to match the host
        toggled: bool,
        /// Signed deviation measured before correction (local minus target)
        drift_ms: i64,
    },
    /// A player call failed; the pass was aborted and already logged
    Failed,
}

/// Converges the local player onto the session document
pub struct ParticipantReconciler {
    player: Arc<dyn Player>,
    user: UserId,
}

impl ParticipantReconciler {
    pub fn new(player: Arc<dyn Player>, user: UserId) -> Self {
        Self { player, user }
    }

    /// Run one reconciliation pass against a room snapshot.
    ///
    /// Skips unless a session exists, this user is not its host, and
    /// this user appears in the participants map.
    pub async fn reconcile(&self, state: &RoomState) -> ReconcileOutcome {
        let document = match &state.session {
            Some(document) => document,
            None => return ReconcileOutcome::Skipped(SkipReason::NoSession),
        };
        if document.host_id == self.user {
            return ReconcileOutcome::Skipped(SkipReason::SelfIsHost);
        }
        if !state.is_participant(self.user) {
            return ReconcileOutcome::Skipped(SkipReason::NotJoined);
        }

        match self.converge(document).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("reconciliation against host {} failed: {}", document.host_id, e);
                ReconcileOutcome::Failed
            }
        }
    }

    async fn converge(&self, document: &SessionDocument) -> Result<ReconcileOutcome, PlayerError> {
        let song = match document.song_id {
            Some(song) => song,
            None => {
                // Session exists but no song picked yet; match the idle transport
                let toggled = if self.player.is_playing().await? {
                    self.player.pause().await?;
                    true
                } else {
                    false
                };
                return Ok(ReconcileOutcome::Synced {
                    loaded: false,
                    corrected: false,
                    toggled,
                    drift_ms: 0,
                });
            }
        };

        let mut loaded = false;
        if self.player.current_song().await? != Some(song) {
            info!("loading song {} to follow the session", song);
            self.player.load(song).await?;
            // Target computed after the load so the first audible frame lands on it
            let target = target_position_ms(document, current_time_ms());
            self.player.seek(target).await?;
            if document.is_playing {
                self.player.play().await?;
            }
            loaded = true;
        }

        // Measure against a target computed now, after any awaits above
        let target = target_position_ms(document, current_time_ms());
        let local = self.player.position_ms().await?;
        let drift_ms = local as i64 - target as i64;

        let corrected = if local.abs_diff(target) > CORRECTION_THRESHOLD_MS {
            info!(
                "drift {:+}ms exceeds threshold, re-syncing to {}ms",
                drift_ms, target
            );
            self.player.seek(target).await?;
            true
        } else {
            debug!("sync: drift {:+}ms (target: {}ms, local: {}ms)", drift_ms, target, local);
            false
        };

        let local_playing = self.player.is_playing().await?;
        let toggled = if document.is_playing != local_playing {
            if document.is_playing {
                debug!("host is playing, resuming");
                self.player.play().await?;
            } else {
                debug!("host paused, pausing");
                self.player.pause().await?;
            }
            true
        } else {
            false
        };

        Ok(ReconcileOutcome::Synced {
            loaded,
            corrected,
            toggled,
            drift_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::{PlayerAction, SimulatedPlayer};
    use crate::session::document::{JoinRecord, SongId};

    fn document(song: Option<SongId>, position_ms: u64, playing: bool, updated_at: u64) -> SessionDocument {
        SessionDocument {
            host_id: UserId(1),
            song_id: song,
            position_ms,
            is_playing: playing,
            updated_at,
        }
    }

    fn joined_state(doc: SessionDocument, user: UserId) -> RoomState {
        let mut state = RoomState::default();
        state.session = Some(doc);
        state.participants.insert(
            user,
            JoinRecord {
                display_name: "listener".to_string(),
                joined_at: 0,
            },
        );
        state
    }

    #[test]
    fn test_drift_estimate() {
        let playing = document(Some(SongId(7)), 5000, true, 1_000);
        assert_eq!(drift_estimate_ms(&playing, 4_000), 3_000);
        assert_eq!(target_position_ms(&playing, 4_000), 8_000);

        let paused = document(Some(SongId(7)), 5000, false, 1_000);
        assert_eq!(drift_estimate_ms(&paused, 4_000), 0);
        assert_eq!(target_position_ms(&paused, 4_000), 5_000);

        // Publisher clock ahead of ours: never rewind
        assert_eq!(drift_estimate_ms(&playing, 500), 0);
    }

    #[tokio::test]
    async fn test_late_joiner_loads_seeks_and_plays() {
        let player = Arc::new(SimulatedPlayer::new());
        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));

        // Published 3 seconds ago at 5000ms, still playing
        let doc = document(Some(SongId(7)), 5000, true, current_time_ms() - 3000);
        let outcome = reconciler.reconcile(&joined_state(doc, UserId(2))).await;

        match outcome {
            ReconcileOutcome::Synced { loaded, .. } => assert!(loaded),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(player.current_song().await.unwrap(), Some(SongId(7)));
        assert!(player.is_playing().await.unwrap());

        let position = player.position_ms().await.unwrap();
        assert!(
            (7_900..8_200).contains(&position),
            "expected ~8000ms, got {}",
            position
        );

        let actions = player.actions();
        assert!(matches!(actions[0], PlayerAction::Load(SongId(7))));
        assert!(matches!(actions[1], PlayerAction::Seek(_)));
        assert!(matches!(actions[2], PlayerAction::Play));
    }

    #[tokio::test]
    async fn test_skips_when_not_a_participant() {
        let player = Arc::new(SimulatedPlayer::new());
        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));

        let mut state = RoomState::default();
        state.session = Some(document(Some(SongId(7)), 5000, true, current_time_ms()));

        let outcome = reconciler.reconcile(&state).await;
        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::NotJoined));
        assert!(player.actions().is_empty());
    }

    #[tokio::test]
    async fn test_host_never_reconciles_against_itself() {
        let player = Arc::new(SimulatedPlayer::new());
        let reconciler = ParticipantReconciler::new(player.clone(), UserId(1));

        let doc = document(Some(SongId(7)), 5000, true, current_time_ms());
        let outcome = reconciler.reconcile(&joined_state(doc, UserId(1))).await;

        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::SelfIsHost));
        assert!(player.actions().is_empty());
    }

    #[tokio::test]
    async fn test_skips_without_session() {
        let player = Arc::new(SimulatedPlayer::new());
        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));

        let outcome = reconciler.reconcile(&RoomState::default()).await;
        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::NoSession));
        assert!(player.actions().is_empty());
    }

    #[tokio::test]
    async fn test_within_threshold_keeps_transport_alone() {
        let player = Arc::new(SimulatedPlayer::new());
        player.load(SongId(7)).await.unwrap();
        player.seek(10_040).await.unwrap();
        player.play().await.unwrap();
        player.clear_actions();

        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));
        let doc = document(Some(SongId(7)), 10_050, true, current_time_ms());
        let outcome = reconciler.reconcile(&joined_state(doc, UserId(2))).await;

        match outcome {
            ReconcileOutcome::Synced { corrected, toggled, drift_ms, .. } => {
                assert!(!corrected);
                assert!(!toggled);
                assert!(drift_ms.unsigned_abs() <= 800);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!player.actions().iter().any(|a| matches!(a, PlayerAction::Seek(_))));
    }

    #[tokio::test]
    async fn test_corrective_seek_beyond_threshold() {
        let player = Arc::new(SimulatedPlayer::new());
        player.load(SongId(7)).await.unwrap();
        player.seek(5_000).await.unwrap();
        player.play().await.unwrap();
        player.clear_actions();

        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));
        let doc = document(Some(SongId(7)), 10_000, true, current_time_ms());
        let outcome = reconciler.reconcile(&joined_state(doc, UserId(2))).await;

        match outcome {
            ReconcileOutcome::Synced { corrected, drift_ms, .. } => {
                assert!(corrected);
                assert!(drift_ms < -4_000);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let position = player.position_ms().await.unwrap();
        assert!((9_900..10_200).contains(&position), "got {}", position);
    }

    #[tokio::test]
    async fn test_resolution_failure_leaves_transport_untouched() {
        let player = Arc::new(SimulatedPlayer::new());
        player.load(SongId(3)).await.unwrap();
        player.seek(1_000).await.unwrap();
        player.play().await.unwrap();
        player.set_load_failure(SongId(9), true);
        player.clear_actions();

        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));
        let doc = document(Some(SongId(9)), 0, true, current_time_ms());
        let outcome = reconciler.reconcile(&joined_state(doc, UserId(2))).await;

        assert_eq!(outcome, ReconcileOutcome::Failed);
        assert_eq!(player.actions(), vec![PlayerAction::Load(SongId(9))]);
        assert_eq!(player.current_song().await.unwrap(), Some(SongId(3)));
        assert!(player.is_playing().await.unwrap());
    }

    #[tokio::test]
    async fn test_pauses_to_match_host() {
        let player = Arc::new(SimulatedPlayer::new());
        player.load(SongId(7)).await.unwrap();
        player.seek(3_100).await.unwrap();
        player.play().await.unwrap();
        player.clear_actions();

        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));
        let doc = document(Some(SongId(7)), 3_000, false, current_time_ms());
        let outcome = reconciler.reconcile(&joined_state(doc, UserId(2))).await;

        match outcome {
            ReconcileOutcome::Synced { corrected, toggled, .. } => {
                assert!(!corrected);
                assert!(toggled);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!player.is_playing().await.unwrap());
        assert_eq!(player.actions(), vec![PlayerAction::Pause]);
    }

    #[tokio::test]
    async fn test_resumes_to_match_host() {
        let player = Arc::new(SimulatedPlayer::new());
        player.load(SongId(7)).await.unwrap();
        player.seek(3_000).await.unwrap();
        player.clear_actions();

        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));
        let doc = document(Some(SongId(7)), 3_000, true, current_time_ms());
        let outcome = reconciler.reconcile(&joined_state(doc, UserId(2))).await;

        match outcome {
            ReconcileOutcome::Synced { toggled, .. } => assert!(toggled),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(player.is_playing().await.unwrap());
    }

    #[tokio::test]
    async fn test_session_without_song_pauses_transport() {
        let player = Arc::new(SimulatedPlayer::new());
        player.load(SongId(5)).await.unwrap();
        player.play().await.unwrap();
        player.clear_actions();

        let reconciler = ParticipantReconciler::new(player.clone(), UserId(2));
        let doc = document(None, 0, false, current_time_ms());
        let outcome = reconciler.reconcile(&joined_state(doc, UserId(2))).await;

        match outcome {
            ReconcileOutcome::Synced { toggled, .. } => assert!(toggled),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!player.is_playing().await.unwrap());
        assert_eq!(player.actions(), vec![PlayerAction::Pause]);
    }
}
