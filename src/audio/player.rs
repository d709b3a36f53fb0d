use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{watch, Mutex, MutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    effects::VolumeControl,
    queue::{QueueSnapshot, TrackQueue},
    track::Track,
};
use crate::{
    error::{PlaybackError, Result},
    sources::{Encoder, FrameSource},
    storage::PlayedTrack,
    transport::{Transport, VoiceConnection},
};

/// Tracks kept in the in-memory play history.
const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
}

/// Told about every track the playback loop takes from the head of the queue.
///
/// Called with the engine's journal lock held, so nothing else can reorder
/// the queue until it returns.
#[async_trait]
pub trait QueueJournal: Send + Sync {
    async fn head_consumed(&self, guild_id: GuildId, track: &Track);
}

/// Per-guild playback engine.
///
/// Cloning is cheap and every clone drives the same engine. All mutable
/// state sits behind one `RwLock` that is never held across an `.await`;
/// the playback loop runs outside it and re-locks only at track boundaries.
#[derive(Clone)]
pub struct PlaybackEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    guild_id: GuildId,
    state: RwLock<EngineState>,
    volume: VolumeControl,
    encoder: Arc<dyn Encoder>,
    journal: Option<Arc<dyn QueueJournal>>,
    journal_lock: Mutex<()>,
    loop_starts: AtomicUsize,
    paused: watch::Sender<bool>,
}

struct EngineState {
    queue: TrackQueue,
    now_playing: Option<Track>,
    status: PlaybackStatus,
    connection: Option<Arc<dyn VoiceConnection>>,
    loop_token: Option<CancellationToken>,
    track_token: Option<CancellationToken>,
    loop_task: Option<JoinHandle<()>>,
    history: VecDeque<PlayedTrack>,
    idle_since: Option<Instant>,
}

impl EngineState {
    /// Makes `track` the current one and returns the token that skips it.
    fn start_track(&mut self, track: &Track, loop_token: &CancellationToken) -> CancellationToken {
        let track_token = loop_token.child_token();
        self.now_playing = Some(track.clone());
        self.status = PlaybackStatus::Playing;
        self.track_token = Some(track_token.clone());
        self.idle_since = None;

        self.history.push_back(PlayedTrack {
            title: track.title().to_string(),
            locator: track.locator().clone(),
            requested_by: track.requested_by(),
            played_at: Utc::now(),
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }

        track_token
    }

    fn go_idle(&mut self) {
        self.now_playing = None;
        self.status = PlaybackStatus::Idle;
        self.loop_token = None;
        self.track_token = None;
        self.idle_since = Some(Instant::now());
    }
}

impl PlaybackEngine {
    pub fn new(
        guild_id: GuildId,
        encoder: Arc<dyn Encoder>,
        max_queue_size: usize,
        volume: u8,
        journal: Option<Arc<dyn QueueJournal>>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(EngineShared {
                guild_id,
                state: RwLock::new(EngineState {
                    queue: TrackQueue::new(max_queue_size),
                    now_playing: None,
                    status: PlaybackStatus::Idle,
                    connection: None,
                    loop_token: None,
                    track_token: None,
                    loop_task: None,
                    history: VecDeque::new(),
                    idle_since: Some(Instant::now()),
                }),
                volume: VolumeControl::new(volume),
                encoder,
                journal,
                journal_lock: Mutex::new(()),
                loop_starts: AtomicUsize::new(0),
                paused,
            }),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.shared.guild_id
    }

    /// Whether both handles drive the same engine.
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ========== Connection ==========

    /// Joins `channel_id` through `transport`.
    ///
    /// Moving to a different channel stops the current playback first.
    pub async fn connect(&self, transport: &dyn Transport, channel_id: ChannelId) -> Result<()> {
        if self.connected_channel() == Some(channel_id) {
            return Ok(());
        }

        let connection = transport.connect(self.guild_id(), channel_id).await?;
        let previous = self.shared.state.write().connection.replace(connection);

        if let Some(previous) = previous {
            self.stop();
            if let Err(e) = previous.disconnect().await {
                warn!("⚠️ Failed to leave previous channel in guild {}: {}", self.guild_id(), e);
            }
        }

        info!("🔊 Guild {} connected to channel {}", self.guild_id(), channel_id);
        Ok(())
    }

    /// Stops playback, waits for the loop to release its stream and drops the
    /// connection. Calling it while disconnected is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let (task, connection) = {
            let _journal = self.shared.journal_lock.lock().await;
            self.stop();
            let mut state = self.shared.state.write();
            (state.loop_task.take(), state.connection.take())
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("⚠️ Playback loop for guild {} ended abnormally: {}", self.guild_id(), e);
            }
        }

        if let Some(connection) = connection {
            connection.disconnect().await?;
            info!("👋 Guild {} disconnected", self.guild_id());
        }
        Ok(())
    }

    pub fn connected_channel(&self) -> Option<ChannelId> {
        self.shared
            .state
            .read()
            .connection
            .as_ref()
            .map(|connection| connection.channel_id())
    }

    // ========== Queue ==========
    //
    // Edits are crate-private; the persisted queue only changes through the
    // registry.

    pub(crate) fn enqueue(&self, track: Track) -> Result<()> {
        self.shared.state.write().queue.push(track)
    }

    pub(crate) fn remove_at(&self, position: usize) -> Result<Track> {
        self.shared.state.write().queue.remove(position)
    }

    pub(crate) fn move_to_front(&self, position: usize) -> Result<()> {
        self.shared.state.write().queue.move_to_front(position)
    }

    /// Empties the queue; the current track keeps playing.
    pub(crate) fn clear(&self) -> usize {
        self.shared.state.write().queue.clear()
    }

    /// Replaces the queue wholesale. `now_playing` is untouched.
    pub(crate) fn replace_queue(&self, tracks: Vec<Track>) {
        let count = tracks.len();
        self.shared.state.write().queue.replace(tracks);
        debug!("📋 Guild {} queue replaced with {} tracks", self.guild_id(), count);
    }

    pub(crate) fn check_capacity(&self) -> Result<()> {
        self.shared.state.read().queue.ensure_capacity()
    }

    pub(crate) fn check_position(&self, position: usize) -> Result<()> {
        self.shared.state.read().queue.check_position(position)
    }

    pub fn queue(&self) -> Vec<Track> {
        self.shared.state.read().queue.tracks()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.read().queue.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.shared.state.read();
        QueueSnapshot {
            now_playing: state.now_playing.clone(),
            items: state.queue.tracks(),
            status: state.status,
            volume: self.shared.volume.get(),
            total_duration: state.queue.total_duration(),
        }
    }

    // ========== Playback ==========

    /// Starts the playback loop with the head of the queue.
    ///
    /// A no-op while already playing or paused. Fails with `EmptyQueue`
    /// before checking the connection.
    pub async fn play(&self) -> Result<()> {
        let _journal = self.shared.journal_lock.lock().await;

        let (track, connection, loop_token, track_token) = {
            let mut state = self.shared.state.write();
            if state.status != PlaybackStatus::Idle {
                debug!("▶️ Guild {} is already playing", self.guild_id());
                return Ok(());
            }
            if state.queue.is_empty() {
                return Err(PlaybackError::EmptyQueue);
            }
            let connection = state.connection.clone().ok_or(PlaybackError::NotConnected)?;
            let track = state.queue.pop_front().ok_or(PlaybackError::EmptyQueue)?;

            let loop_token = CancellationToken::new();
            let track_token = state.start_track(&track, &loop_token);
            state.loop_token = Some(loop_token.clone());
            self.shared.paused.send_replace(false);
            (track, connection, loop_token, track_token)
        };

        self.shared.loop_starts.fetch_add(1, Ordering::SeqCst);
        info!("▶️ Guild {} now playing: {}", self.guild_id(), track.title());

        let engine = self.clone();
        let first = track.clone();
        let task = tokio::spawn(async move {
            engine.run_loop(connection, loop_token, first, track_token).await;
        });
        self.shared.state.write().loop_task = Some(task);

        self.journal_consumed(&track).await;
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        if state.status != PlaybackStatus::Playing {
            return Err(PlaybackError::NotPlaying);
        }
        state.status = PlaybackStatus::Paused;
        self.shared.paused.send_replace(true);
        info!("⏸️ Guild {} paused", self.guild_id());
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        if state.status != PlaybackStatus::Paused {
            return Err(PlaybackError::NotPaused);
        }
        state.status = PlaybackStatus::Playing;
        self.shared.paused.send_replace(false);
        info!("▶️ Guild {} resumed", self.guild_id());
        Ok(())
    }

    /// Ends the current track early; the loop moves on to the next one.
    /// Skipping while paused starts the next track unpaused.
    ///
    /// A skip that lands after the current track already ended, while the
    /// loop is picking the next one, is satisfied by that ending and never
    /// carries over to the next track.
    pub fn skip(&self) -> Result<()> {
        let state = self.shared.state.read();
        if state.status == PlaybackStatus::Idle {
            return Err(PlaybackError::NotPlaying);
        }
        match &state.track_token {
            Some(token) => {
                token.cancel();
                info!("⏭️ Guild {} skipped track", self.guild_id());
            }
            None => debug!("⏭️ Guild {} track already ending", self.guild_id()),
        }
        Ok(())
    }

    /// Ends the current track and the loop. The queue is left as is.
    pub fn stop(&self) {
        let mut state = self.shared.state.write();
        if let Some(token) = state.loop_token.take() {
            token.cancel();
        }
        if state.status == PlaybackStatus::Idle {
            return;
        }
        state.go_idle();
        self.shared.paused.send_replace(false);
        info!("⏹️ Guild {} stopped", self.guild_id());
    }

    /// Validates and applies a new level; a running stream picks it up on
    /// its next frame.
    pub fn set_volume(&self, level: i32) -> Result<u8> {
        let level = VolumeControl::validate(level)?;
        self.shared.volume.set(level);
        Ok(level)
    }

    pub fn volume(&self) -> u8 {
        self.shared.volume.get()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.state.read().status
    }

    pub fn now_playing(&self) -> Option<Track> {
        self.shared.state.read().now_playing.clone()
    }

    /// Most recently started tracks, oldest first.
    pub fn history(&self) -> Vec<PlayedTrack> {
        self.shared.state.read().history.iter().cloned().collect()
    }

    /// How many times a playback loop has been started.
    pub fn loop_start_count(&self) -> usize {
        self.shared.loop_starts.load(Ordering::SeqCst)
    }

    /// Time spent idle, `None` while playing or paused.
    pub fn idle_for(&self) -> Option<Duration> {
        let state = self.shared.state.read();
        match state.status {
            PlaybackStatus::Idle => state.idle_since.map(|since| since.elapsed()),
            _ => None,
        }
    }

    /// Serializes queue edits with the loop's consumption of the head.
    pub(crate) async fn lock_journal(&self) -> MutexGuard<'_, ()> {
        self.shared.journal_lock.lock().await
    }

    async fn journal_consumed(&self, track: &Track) {
        if let Some(journal) = &self.shared.journal {
            journal.head_consumed(self.guild_id(), track).await;
        }
    }

    // ========== Playback loop ==========

    async fn run_loop(
        self,
        connection: Arc<dyn VoiceConnection>,
        loop_token: CancellationToken,
        mut track: Track,
        mut track_token: CancellationToken,
    ) {
        debug!("🔁 Playback loop started for guild {}", self.guild_id());

        loop {
            if let Err(e) = self.play_track(&track, &connection, &track_token).await {
                warn!(
                    "⚠️ Guild {} abandoned '{}': {}",
                    self.guild_id(),
                    track.title(),
                    e
                );
            }
            self.finish_track();

            if loop_token.is_cancelled() {
                break;
            }

            match self.advance(&loop_token).await {
                Some((next, next_token)) => {
                    track = next;
                    track_token = next_token;
                }
                None => break,
            }
        }

        debug!("🔁 Playback loop finished for guild {}", self.guild_id());
    }

    /// Drops the skip token of a track that has stopped streaming.
    fn finish_track(&self) {
        self.shared.state.write().track_token = None;
    }

    /// Takes the next track from the queue, or goes idle when it is empty.
    async fn advance(&self, loop_token: &CancellationToken) -> Option<(Track, CancellationToken)> {
        let _journal = self.shared.journal_lock.lock().await;

        let (next, track_token) = {
            let mut state = self.shared.state.write();
            if loop_token.is_cancelled() {
                return None;
            }
            match state.queue.pop_front() {
                Some(next) => {
                    let track_token = state.start_track(&next, loop_token);
                    self.shared.paused.send_replace(false);
                    (next, track_token)
                }
                None => {
                    state.go_idle();
                    info!("✅ Guild {} finished the queue", self.guild_id());
                    return None;
                }
            }
        };

        info!("▶️ Guild {} now playing: {}", self.guild_id(), next.title());
        self.journal_consumed(&next).await;
        Some((next, track_token))
    }

    /// Streams one track. The source is always cleaned up once opened.
    async fn play_track(
        &self,
        track: &Track,
        connection: &Arc<dyn VoiceConnection>,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut source = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            opened = self.shared.encoder.open_stream(track.locator()) => opened?,
        };

        let result = self.forward_frames(source.as_mut(), connection, token).await;
        source.cleanup().await;
        debug!("🧹 Released stream for '{}'", track.title());
        result
    }

    async fn forward_frames(
        &self,
        source: &mut dyn FrameSource,
        connection: &Arc<dyn VoiceConnection>,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut paused = self.shared.paused.subscribe();

        loop {
            let is_paused = *paused.borrow_and_update();
            if is_paused {
                source.set_paused(true);
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Ok(()),
                        changed = paused.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    let still_paused = *paused.borrow_and_update();
                    if !still_paused {
                        break;
                    }
                }
                source.set_paused(false);
            }

            let frame = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                frame = source.next_frame() => frame?,
            };
            let Some(frame) = frame else {
                return Ok(());
            };

            let frame = self.shared.volume.apply(frame);
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                sent = connection.send_frame(frame) => sent?,
            }
        }
    }
}
