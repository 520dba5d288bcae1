//! Room Client
//!
//! One attached client per room: a single driver task reacts to room
//! snapshots and a once-per-second tick, and owns every timer as a
//! scoped task that dies with its reason for existing. All player and
//! channel writes flow through the components in [`crate::session`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, RoomId, SessionChannel};
use crate::player::{Player, PlayerError};
use crate::session::{
    current_time_ms, EntryKey, HostController, JoinAction, JoinLeaveStateMachine, JoinPhase,
    JoinRecord, LeaveEffect, ParticipantReconciler, QueueEntry, QueueError, ReconcileOutcome,
    RoomState, SongId, SuggestionQueueManager, UserId, AUTO_JOIN_DEBOUNCE_MS,
};

/// Driver tick period
const TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Host heartbeat period while playing
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Errors surfaced by [`RoomClient`] operations
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Not joined to a session")]
    NotJoined,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Player error: {0}")]
    Player(#[from] PlayerError),
}

/// Events delivered to the owner of an attached client
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A session appeared, or its host changed
    SessionStarted { host_id: UserId },
    SessionEnded,
    /// The room state changed in any way; carries the fresh snapshot
    StateChanged(RoomState),
    /// This client joined the session
    Joined,
    /// This client left the session
    Left,
    ParticipantJoined { user_id: UserId },
    ParticipantLeft { user_id: UserId },
    /// Result of a reconciliation pass while following
    SyncStatus { drift_ms: i64, corrected: bool },
    Error(String),
}

/// Aborts the wrapped task when dropped
struct ScopedTask(JoinHandle<()>);

impl ScopedTask {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    /// Abort the task and wait until it has fully terminated
    async fn shutdown(mut self) {
        self.0.abort();
        let _ = (&mut self.0).await;
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Default)]
struct TaskSet {
    driver: Option<ScopedTask>,
    heartbeat: Option<ScopedTask>,
    debounce: Option<ScopedTask>,
    reconcile: Option<ScopedTask>,
}

struct ClientInner {
    room: RoomId,
    user: UserId,
    display_name: String,
    channel: Arc<dyn SessionChannel>,
    player: Arc<dyn Player>,
    host: HostController,
    reconciler: ParticipantReconciler,
    queue: SuggestionQueueManager,
    membership: Mutex<JoinLeaveStateMachine>,
    /// Snapshot the last event diff was computed against
    last_seen: Mutex<RoomState>,
    latest: watch::Receiver<RoomState>,
    events: mpsc::UnboundedSender<RoomEvent>,
    tasks: Mutex<TaskSet>,
}

impl ClientInner {
    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }
}

/// A user's presence in one room
pub struct RoomClient {
    inner: Arc<ClientInner>,
}

impl RoomClient {
    /// Subscribe to a room and start the driver task.
    ///
    /// Returns the client and the stream of [`RoomEvent`]s for it. The
    /// client does nothing visible until a session appears or
    /// [`start_hosting`](Self::start_hosting) is called.
    pub async fn attach(
        channel: Arc<dyn SessionChannel>,
        player: Arc<dyn Player>,
        room: RoomId,
        user: UserId,
        display_name: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RoomEvent>), RoomError> {
        let rx = channel.subscribe(&room).await?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            room: room.clone(),
            user,
            display_name: display_name.into(),
            channel: channel.clone(),
            player: player.clone(),
            host: HostController::new(channel.clone(), room.clone(), user),
            reconciler: ParticipantReconciler::new(player, user),
            queue: SuggestionQueueManager::new(channel, room, user),
            membership: Mutex::new(JoinLeaveStateMachine::new(user)),
            last_seen: Mutex::new(RoomState::default()),
            latest: rx.clone(),
            events: event_tx,
            tasks: Mutex::new(TaskSet::default()),
        });

        let driver = ScopedTask::spawn(run_driver(inner.clone(), rx));
        inner.tasks.lock().driver = Some(driver);

        info!("attached to {} as user {}", inner.room, user);
        Ok((Self { inner }, event_rx))
    }

    /// Become the room's host, publishing the local player's state.
    ///
    /// If this client was following a session it leaves it first.
    pub async fn start_hosting(&self) -> Result<(), RoomError> {
        let inner = &self.inner;
        let (song, position_ms, playing) = read_player(inner).await?;

        let was_joined = inner.membership.lock().phase() == JoinPhase::Joined;
        if was_joined {
            if let Err(e) = inner.channel.leave(&inner.room, inner.user).await {
                warn!("could not remove own participant record: {}", e);
            }
        }
        {
            let mut tasks = inner.tasks.lock();
            tasks.debounce = None;
            tasks.reconcile = None;
        }
        inner.membership.lock().reset();

        inner.host.start_or_retarget(song, position_ms, playing).await?;
        Ok(())
    }

    /// End the hosted session for everyone. Idempotent.
    pub async fn stop_hosting(&self) -> Result<(), RoomError> {
        // The heartbeat must be fully gone first; a publish it has
        // already started may not land after the clear
        let heartbeat = self.inner.tasks.lock().heartbeat.take();
        if let Some(task) = heartbeat {
            task.shutdown().await;
        }

        self.inner.host.stop().await?;
        Ok(())
    }

    /// Leave the current session. The leave is remembered until the
    /// session's host or song changes.
    ///
    /// On a channel error the local leave still holds; the stale
    /// participant record disappears when the session ends.
    pub async fn leave(&self) -> Result<(), RoomError> {
        let fingerprint = self.inner.latest.borrow().fingerprint();
        let effect = self.inner.membership.lock().leave_manually(fingerprint);
        match effect {
            LeaveEffect::CallLeave => {
                {
                    let mut tasks = self.inner.tasks.lock();
                    tasks.debounce = None;
                    tasks.reconcile = None;
                }
                self.inner.channel.leave(&self.inner.room, self.inner.user).await?;
                self.inner.emit(RoomEvent::Left);
                Ok(())
            }
            LeaveEffect::CancelPendingJoin => {
                self.inner.tasks.lock().debounce = None;
                self.inner.emit(RoomEvent::Left);
                Ok(())
            }
            LeaveEffect::Ignored => Err(RoomError::NotJoined),
        }
    }

    /// Suggest a song for the room's queue
    pub async fn suggest(&self, song: SongId) -> Result<EntryKey, RoomError> {
        Ok(self.inner.queue.suggest(song).await?)
    }

    /// Drop a queue entry without playing it. Host only.
    pub async fn discard_suggestion(&self, key: &EntryKey) -> Result<(), RoomError> {
        let state = self.inner.latest.borrow().clone();
        Ok(self.inner.queue.discard(&state, key).await?)
    }

    /// Play a queue entry now: load it locally and retarget the
    /// session to it from position zero. Host only.
    pub async fn play_suggestion(&self, key: &EntryKey) -> Result<(), RoomError> {
        let state = self.inner.latest.borrow().clone();
        let entry = self.inner.queue.consume(&state, key).await?;

        // The host drives its own transport; nothing reconciles it
        self.inner.player.load(entry.song_id).await?;
        self.inner.player.play().await?;
        self.inner.host.start_or_retarget(Some(entry.song_id), 0, true).await?;
        Ok(())
    }

    /// Latest room snapshot
    pub fn state(&self) -> RoomState {
        self.inner.latest.borrow().clone()
    }

    /// Queue entries in playback order
    pub fn queue(&self) -> Vec<(EntryKey, QueueEntry)> {
        let state = self.inner.latest.borrow().clone();
        self.inner
            .queue
            .list_ordered(&state)
            .into_iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    pub fn is_hosting(&self) -> bool {
        self.inner.host.is_hosting()
    }

    pub fn join_phase(&self) -> JoinPhase {
        self.inner.membership.lock().phase()
    }

    pub fn room(&self) -> &RoomId {
        &self.inner.room
    }

    pub fn user(&self) -> UserId {
        self.inner.user
    }

    /// Stop all activity for this client. Any participant record left
    /// behind disappears when the session ends.
    pub fn detach(&self) {
        let mut tasks = self.inner.tasks.lock();
        *tasks = TaskSet::default();
        debug!("detached from {}", self.inner.room);
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn run_driver(inner: Arc<ClientInner>, mut rx: watch::Receiver<RoomState>) {
    let mut tick = time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Handle whatever the room already contains
    let initial = rx.borrow_and_update().clone();
    on_snapshot(&inner, initial);

    loop {
        tokio::select! {
            changed = rx.changed() => match changed {
                Ok(()) => {
                    let state = rx.borrow_and_update().clone();
                    on_snapshot(&inner, state);
                }
                Err(_) => {
                    warn!("room channel for {} closed", inner.room);
                    inner.emit(RoomEvent::Error("Room channel closed".to_string()));
                    break;
                }
            },
            _ = tick.tick() => on_tick(&inner).await,
        }
    }
}

/// React to a fresh room snapshot. Synchronous: all follow-up work
/// runs in scoped tasks.
fn on_snapshot(inner: &Arc<ClientInner>, state: RoomState) {
    emit_diffs(inner, &state);

    // A fresher document from another host wins; let the room go
    if inner.host.is_hosting() && state.has_session() && !state.is_host(inner.user) {
        inner.host.abdicate();
        inner.tasks.lock().heartbeat = None;
        inner.emit(RoomEvent::Error("Another host took over the room".to_string()));
    }

    let action = inner.membership.lock().observe(&state);
    apply_join_action(inner, action);

    spawn_reconcile(inner, state, true);
}

/// Once-per-second upkeep
async fn on_tick(inner: &Arc<ClientInner>) {
    if inner.host.is_hosting() {
        host_tick(inner).await;
        return;
    }

    // Follower upkeep: retry membership decisions, opportunistic sync
    let state = inner.latest.borrow().clone();
    let action = inner.membership.lock().observe(&state);
    apply_join_action(inner, action);
    spawn_reconcile(inner, state, false);
}

async fn host_tick(inner: &Arc<ClientInner>) {
    let (song, position_ms, playing) = match read_player(inner).await {
        Ok(readings) => readings,
        Err(e) => {
            warn!("player poll failed: {}", e);
            return;
        }
    };

    inner.host.on_local_tick(song, position_ms, playing).await;

    // Heartbeat task exists exactly while hosting and playing
    let mut tasks = inner.tasks.lock();
    let alive = tasks
        .heartbeat
        .as_ref()
        .map(|task| !task.is_finished())
        .unwrap_or(false);
    if playing && !alive {
        debug!("starting heartbeat for {}", inner.room);
        tasks.heartbeat = Some(ScopedTask::spawn(run_heartbeat(inner.clone())));
    } else if !playing && tasks.heartbeat.is_some() {
        debug!("stopping heartbeat for {}", inner.room);
        tasks.heartbeat = None;
    }
}

fn emit_diffs(inner: &ClientInner, next: &RoomState) {
    let prev = {
        let mut last_seen = inner.last_seen.lock();
        std::mem::replace(&mut *last_seen, next.clone())
    };

    let prev_host = prev.session.as_ref().map(|d| d.host_id);
    let next_host = next.session.as_ref().map(|d| d.host_id);
    match (prev_host, next_host) {
        (None, Some(host_id)) => inner.emit(RoomEvent::SessionStarted { host_id }),
        (Some(_), None) => inner.emit(RoomEvent::SessionEnded),
        (Some(a), Some(b)) if a != b => inner.emit(RoomEvent::SessionStarted { host_id: b }),
        _ => {}
    }

    for user_id in next.participants.keys() {
        if !prev.participants.contains_key(user_id) {
            inner.emit(RoomEvent::ParticipantJoined { user_id: *user_id });
        }
    }
    for user_id in prev.participants.keys() {
        if !next.participants.contains_key(user_id) {
            inner.emit(RoomEvent::ParticipantLeft { user_id: *user_id });
        }
    }

    if prev != *next {
        inner.emit(RoomEvent::StateChanged(next.clone()));
    }
}

fn apply_join_action(inner: &Arc<ClientInner>, action: JoinAction) {
    match action {
        JoinAction::ScheduleJoin => {
            let task = ScopedTask::spawn(run_debounced_join(inner.clone()));
            inner.tasks.lock().debounce = Some(task);
        }
        JoinAction::CancelPendingJoin => {
            inner.tasks.lock().debounce = None;
        }
        JoinAction::None => {}
    }
}

/// Spawn a reconciliation pass against `state` if following.
///
/// A snapshot replaces any in-flight pass, so corrections always chase
/// the newest document. Ticks only fill in when no pass is running.
fn spawn_reconcile(inner: &Arc<ClientInner>, state: RoomState, replace: bool) {
    let allowed = inner.membership.lock().reconciliation_allowed();
    let mut tasks = inner.tasks.lock();
    if !allowed {
        tasks.reconcile = None;
        return;
    }

    let running = tasks
        .reconcile
        .as_ref()
        .map(|task| !task.is_finished())
        .unwrap_or(false);
    if replace || !running {
        tasks.reconcile = Some(ScopedTask::spawn(run_reconcile(inner.clone(), state)));
    }
}

async fn run_debounced_join(inner: Arc<ClientInner>) {
    time::sleep(Duration::from_millis(AUTO_JOIN_DEBOUNCE_MS)).await;

    if inner.membership.lock().phase() != JoinPhase::AutoJoinPending {
        return;
    }

    let record = JoinRecord {
        display_name: inner.display_name.clone(),
        joined_at: current_time_ms(),
    };
    match inner.channel.join(&inner.room, inner.user, record).await {
        Ok(()) => {
            inner.membership.lock().confirm_join();
            inner.emit(RoomEvent::Joined);
        }
        Err(e) => {
            warn!("auto-join for {} failed: {}", inner.room, e);
            inner.membership.lock().join_failed();
            inner.emit(RoomEvent::Error(format!("Join failed: {}", e)));
        }
    }
}

async fn run_reconcile(inner: Arc<ClientInner>, state: RoomState) {
    match inner.reconciler.reconcile(&state).await {
        ReconcileOutcome::Synced { corrected, drift_ms, .. } => {
            inner.emit(RoomEvent::SyncStatus { drift_ms, corrected });
        }
        ReconcileOutcome::Failed => {
            inner.emit(RoomEvent::Error("Could not sync with the session".to_string()));
        }
        ReconcileOutcome::Skipped(_) => {}
    }
}

async fn run_heartbeat(inner: Arc<ClientInner>) {
    let mut interval = time::interval_at(time::Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if !inner.host.is_hosting() {
            break;
        }
        match read_player(&inner).await {
            Ok((song, position_ms, true)) => inner.host.heartbeat(song, position_ms, true).await,
            // Host tick notices the pause and drops this task
            Ok((_, _, false)) => break,
            Err(e) => warn!("heartbeat player poll failed: {}", e),
        }
    }
}

async fn read_player(inner: &ClientInner) -> Result<(Option<SongId>, u64, bool), PlayerError> {
    let (song, position_ms, playing) = tokio::join!(
        inner.player.current_song(),
        inner.player.position_ms(),
        inner.player.is_playing()
    );
    Ok((song?, position_ms?, playing?))
}
