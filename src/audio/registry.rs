use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    effects::VolumeControl,
    player::{PlaybackEngine, QueueJournal},
    track::Track,
};
use crate::{
    config::Config,
    error::{Result, StorageError},
    sources::Encoder,
    storage::QueueStore,
    transport::Transport,
};

/// Defaults applied to every engine the registry creates.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub max_queue_size: usize,
    pub default_volume: u8,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            default_volume: config.default_volume,
        }
    }
}

/// Keeps the store in step with tracks the playback loop takes off the queue.
///
/// A consumed head whose delete failed is still at the front of the stored
/// queue. It is counted and deleted again before the next edit or load for
/// that guild, and that edit fails while the store keeps refusing.
struct StoreJournal {
    store: Arc<dyn QueueStore>,
    pending: DashMap<GuildId, usize>,
}

impl StoreJournal {
    fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
        }
    }

    async fn delete_head(&self, guild_id: GuildId) -> Result<(), StorageError> {
        match self.store.delete_at(guild_id, 0).await {
            Err(StorageError::MissingPosition { .. }) => Ok(()),
            other => other,
        }
    }

    /// Deletes the heads left behind by earlier failures.
    /// Callers hold the engine's journal lock.
    async fn flush(&self, guild_id: GuildId) -> Result<(), StorageError> {
        let Some(mut pending) = self.pending.get(&guild_id).map(|count| *count) else {
            return Ok(());
        };
        while pending > 0 {
            if let Err(e) = self.delete_head(guild_id).await {
                self.pending.insert(guild_id, pending);
                return Err(e);
            }
            pending -= 1;
        }
        self.pending.remove(&guild_id);
        info!("💾 Stored queue for guild {} is back in step", guild_id);
        Ok(())
    }

    /// The stored queue was emptied, so nothing is owed anymore.
    fn forget(&self, guild_id: GuildId) {
        self.pending.remove(&guild_id);
    }
}

#[async_trait]
impl QueueJournal for StoreJournal {
    async fn head_consumed(&self, guild_id: GuildId, track: &Track) {
        let deleted = match self.flush(guild_id).await {
            Ok(()) => self.delete_head(guild_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = deleted {
            *self.pending.entry(guild_id).or_insert(0) += 1;
            error!("💾 Could not persist dequeue for guild {}: {}", guild_id, e);
        }
        if let Err(e) = self.store.record_played(guild_id, track).await {
            warn!("⚠️ Could not record history for guild {}: {}", guild_id, e);
        }
    }
}

/// Owns one [`PlaybackEngine`] per guild.
///
/// Queue mutations made through the registry are written to the
/// [`QueueStore`] first and applied in memory only if that write succeeded,
/// so a restart can always rebuild the queue with [`Self::load_queue`].
pub struct EngineRegistry {
    engines: DashMap<GuildId, PlaybackEngine>,
    store: Arc<dyn QueueStore>,
    encoder: Arc<dyn Encoder>,
    transport: Arc<dyn Transport>,
    journal: Arc<StoreJournal>,
    settings: EngineSettings,
}

impl EngineRegistry {
    pub fn new(
        store: Arc<dyn QueueStore>,
        encoder: Arc<dyn Encoder>,
        transport: Arc<dyn Transport>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            journal: Arc::new(StoreJournal::new(store.clone())),
            store,
            encoder,
            transport,
            settings,
        }
    }

    /// Returns the guild's engine. A new engine starts from the stored
    /// queue and volume, and is dropped again if those cannot be read.
    pub async fn get_or_create(&self, guild_id: GuildId) -> Result<PlaybackEngine> {
        if let Some(engine) = self.get(guild_id) {
            return Ok(engine);
        }

        let engine = PlaybackEngine::new(
            guild_id,
            self.encoder.clone(),
            self.settings.max_queue_size,
            self.settings.default_volume,
            Some(self.journal.clone() as Arc<dyn QueueJournal>),
        );
        let journal = engine.lock_journal().await;
        match self.engines.entry(guild_id) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(engine.clone());
            }
        }

        let hydrated = self.hydrate(guild_id, &engine).await;
        drop(journal);
        match hydrated {
            Ok(count) => {
                debug!("🆕 Created engine for guild {} with {} stored tracks", guild_id, count);
                Ok(engine)
            }
            Err(e) => {
                self.engines.remove_if(&guild_id, |_, current| current.ptr_eq(&engine));
                warn!("⚠️ Could not create engine for guild {}: {}", guild_id, e);
                Err(e)
            }
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<PlaybackEngine> {
        self.engines.get(&guild_id).map(|engine| engine.value().clone())
    }

    /// Stops the guild's engine, leaves its channel and forgets it.
    /// Unknown guilds are ignored.
    pub async fn remove(&self, guild_id: GuildId) -> Result<()> {
        let Some((_, engine)) = self.engines.remove(&guild_id) else {
            return Ok(());
        };
        engine.disconnect().await?;
        info!("🗑️ Engine for guild {} removed", guild_id);
        Ok(())
    }

    pub async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<PlaybackEngine> {
        let engine = self.get_or_create(guild_id).await?;
        engine.connect(self.transport.as_ref(), channel_id).await?;
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    // ========== Persisted queue edits ==========

    pub async fn add_track(&self, guild_id: GuildId, track: Track) -> Result<()> {
        let engine = self.get_or_create(guild_id).await?;
        let _journal = engine.lock_journal().await;

        engine.check_capacity()?;
        self.journal.flush(guild_id).await?;
        self.store.append(guild_id, &track).await?;
        engine.enqueue(track)
    }

    pub async fn remove_track(&self, guild_id: GuildId, position: usize) -> Result<Track> {
        let engine = self.get_or_create(guild_id).await?;
        let _journal = engine.lock_journal().await;

        engine.check_position(position)?;
        self.journal.flush(guild_id).await?;
        self.store.delete_at(guild_id, position).await?;
        engine.remove_at(position)
    }

    /// Moves the track at `position` to the head of the queue.
    pub async fn reorder(&self, guild_id: GuildId, position: usize) -> Result<()> {
        let engine = self.get_or_create(guild_id).await?;
        let _journal = engine.lock_journal().await;

        engine.check_position(position)?;
        self.journal.flush(guild_id).await?;
        self.store.move_to_front(guild_id, position).await?;
        engine.move_to_front(position)
    }

    pub async fn clear_queue(&self, guild_id: GuildId) -> Result<usize> {
        let engine = self.get_or_create(guild_id).await?;
        let _journal = engine.lock_journal().await;

        self.clear_locked(guild_id, &engine).await
    }

    /// Stops playback and empties the queue in one step, so the loop cannot
    /// start another track in between.
    pub async fn stop_and_clear(&self, guild_id: GuildId) -> Result<usize> {
        let engine = self.get_or_create(guild_id).await?;
        let _journal = engine.lock_journal().await;

        engine.stop();
        self.clear_locked(guild_id, &engine).await
    }

    async fn clear_locked(&self, guild_id: GuildId, engine: &PlaybackEngine) -> Result<usize> {
        self.store.clear(guild_id).await?;
        self.journal.forget(guild_id);
        Ok(engine.clear())
    }

    pub async fn set_volume(&self, guild_id: GuildId, level: i32) -> Result<u8> {
        let level = VolumeControl::validate(level)?;
        let engine = self.get_or_create(guild_id).await?;
        let _journal = engine.lock_journal().await;

        self.store.save_volume(guild_id, level).await?;
        engine.set_volume(i32::from(level))
    }

    /// Replaces the in-memory queue with the stored one and restores the
    /// stored volume. The current track is not touched.
    pub async fn load_queue(&self, guild_id: GuildId) -> Result<usize> {
        let engine = self.get_or_create(guild_id).await?;
        let _journal = engine.lock_journal().await;

        let count = self.hydrate(guild_id, &engine).await?;
        debug!("📂 Loaded {} tracks for guild {}", count, guild_id);
        Ok(count)
    }

    /// Callers hold the engine's journal lock.
    async fn hydrate(&self, guild_id: GuildId, engine: &PlaybackEngine) -> Result<usize> {
        self.journal.flush(guild_id).await?;
        let tracks = self.store.read_all(guild_id).await?;
        let volume = self.store.load_volume(guild_id).await?;

        let count = tracks.len();
        engine.replace_queue(tracks);
        if let Some(volume) = volume {
            engine.set_volume(i32::from(volume))?;
        }
        Ok(count)
    }

    /// Loads the stored queue of every guild the store knows about.
    pub async fn rehydrate_all(&self) -> Result<usize> {
        let guilds = self.store.guilds().await?;
        let mut restored = 0;

        for guild_id in guilds {
            match self.load_queue(guild_id).await {
                Ok(count) => restored += count,
                Err(e) => warn!("⚠️ Could not restore queue for guild {}: {}", guild_id, e),
            }
        }

        info!("📂 Restored {} queued tracks across {} guilds", restored, self.len());
        Ok(restored)
    }

    // ========== Lifecycle ==========

    /// Removes every engine that has been idle for at least `max_idle`.
    pub async fn remove_idle(&self, max_idle: Duration) -> Vec<GuildId> {
        let is_stale = |engine: &PlaybackEngine| {
            engine
                .idle_for()
                .is_some_and(|idle| idle >= max_idle)
        };

        let candidates: Vec<GuildId> = self
            .engines
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = Vec::new();
        for guild_id in candidates {
            let Some((_, engine)) = self.engines.remove_if(&guild_id, |_, engine| is_stale(engine))
            else {
                continue;
            };
            if let Err(e) = engine.disconnect().await {
                warn!("⚠️ Error leaving idle guild {}: {}", guild_id, e);
            }
            info!("💤 Guild {} idle for too long, engine removed", guild_id);
            removed.push(guild_id);
        }
        removed
    }

    /// Runs [`Self::remove_idle`] every `every` until the handle is aborted.
    pub fn spawn_idle_reaper(self: Arc<Self>, every: Duration, max_idle: Duration) -> JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = registry.remove_idle(max_idle).await;
                if !removed.is_empty() {
                    debug!("💤 Idle reaper removed {} engines", removed.len());
                }
            }
        })
    }

    /// Disconnects and drops every engine.
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.engines.iter().map(|entry| *entry.key()).collect();
        for guild_id in guilds {
            if let Err(e) = self.remove(guild_id).await {
                warn!("⚠️ Error shutting down guild {}: {}", guild_id, e);
            }
        }
        info!("👋 All engines shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::player::{
            tests::{track, wait_until, FakeEncoder, FakeTransport, RecordingConnection},
            PlaybackStatus,
        },
        error::PlaybackError,
        storage::{JsonQueueStore, MockQueueStore},
    };
    use mockall::Sequence;
    use pretty_assertions::assert_eq;

    const GUILD_ID: u64 = 42;

    fn guild() -> GuildId {
        GuildId::new(GUILD_ID)
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            max_queue_size: 10,
            default_volume: 50,
        }
    }

    fn registry_with(store: Arc<dyn QueueStore>) -> EngineRegistry {
        EngineRegistry::new(
            store,
            Arc::new(FakeEncoder::default()),
            Arc::new(FakeTransport {
                connection: Arc::new(RecordingConnection::default()),
            }),
            settings(),
        )
    }

    /// A mock store holding nothing yet; only reads are expected.
    fn empty_store() -> MockQueueStore {
        let mut store = MockQueueStore::new();
        store.expect_read_all().returning(|_| Ok(Vec::new()));
        store.expect_load_volume().returning(|_| Ok(None));
        store
    }

    async fn json_store() -> (tempfile::TempDir, Arc<JsonQueueStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap());
        (dir, store)
    }

    fn titles(tracks: &[Track]) -> Vec<String> {
        tracks.iter().map(|t| t.title().to_string()).collect()
    }

    async fn queue_of(registry: &EngineRegistry) -> Vec<String> {
        titles(&registry.get_or_create(guild()).await.unwrap().queue())
    }

    #[tokio::test]
    async fn test_failed_append_leaves_queue_untouched() {
        let mut store = empty_store();
        store
            .expect_append()
            .times(1)
            .returning(|_, _| Err(StorageError::Backend("disk full".into())));
        let registry = registry_with(Arc::new(store));

        let result = registry.add_track(guild(), track("a")).await;
        assert!(matches!(
            result,
            Err(PlaybackError::Storage(StorageError::Backend(_)))
        ));
        assert!(queue_of(&registry).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_track() {
        let mut store = empty_store();
        store.expect_append().times(2).returning(|_, _| Ok(()));
        store
            .expect_delete_at()
            .times(1)
            .returning(|_, _| Err(StorageError::Backend("read-only".into())));
        store
            .expect_move_to_front()
            .times(1)
            .returning(|_, _| Err(StorageError::Backend("read-only".into())));
        let registry = registry_with(Arc::new(store));

        registry.add_track(guild(), track("a")).await.unwrap();
        registry.add_track(guild(), track("b")).await.unwrap();

        assert!(registry.remove_track(guild(), 0).await.is_err());
        assert!(registry.reorder(guild(), 1).await.is_err());
        assert_eq!(queue_of(&registry).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_the_store() {
        let registry = registry_with(Arc::new(empty_store()));

        assert!(matches!(
            registry.remove_track(guild(), 3).await,
            Err(PlaybackError::InvalidPosition { position: 3, len: 0 })
        ));
        assert!(matches!(
            registry.reorder(guild(), 0).await,
            Err(PlaybackError::InvalidPosition { .. })
        ));
        assert!(matches!(
            registry.set_volume(guild(), 101).await,
            Err(PlaybackError::InvalidVolume(101))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_is_rejected_before_persisting() {
        let mut store = empty_store();
        store.expect_append().times(10).returning(|_, _| Ok(()));
        let registry = registry_with(Arc::new(store));

        for i in 0..10 {
            registry.add_track(guild(), track(&format!("t{i}"))).await.unwrap();
        }
        assert!(matches!(
            registry.add_track(guild(), track("extra")).await,
            Err(PlaybackError::QueueFull { max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_failed_read_leaves_no_engine_behind() {
        let mut store = MockQueueStore::new();
        store
            .expect_read_all()
            .times(1)
            .returning(|_| Err(StorageError::Backend("unreachable".into())));
        let registry = registry_with(Arc::new(store));

        assert!(matches!(
            registry.add_track(guild(), track("a")).await,
            Err(PlaybackError::Storage(StorageError::Backend(_)))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_load_queue_reproduces_stored_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
            let registry = registry_with(Arc::new(store));
            for name in ["a", "b", "c", "d"] {
                registry.add_track(guild(), track(name)).await.unwrap();
            }
            registry.reorder(guild(), 2).await.unwrap();
            registry.remove_track(guild(), 1).await.unwrap();
            registry.set_volume(guild(), 30).await.unwrap();
            assert_eq!(queue_of(&registry).await, vec!["c", "b", "d"]);
        }

        let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
        let registry = registry_with(Arc::new(store));
        assert_eq!(registry.rehydrate_all().await.unwrap(), 3);

        let engine = registry.get(guild()).unwrap();
        assert_eq!(titles(&engine.queue()), vec!["c", "b", "d"]);
        assert_eq!(engine.volume(), 30);
        assert!(engine.now_playing().is_none());
    }

    #[tokio::test]
    async fn test_reaped_engine_comes_back_with_stored_queue() {
        let (_dir, store) = json_store().await;
        let registry = registry_with(store.clone());

        registry.add_track(guild(), track("a")).await.unwrap();
        registry.set_volume(guild(), 20).await.unwrap();
        assert_eq!(registry.remove_idle(Duration::ZERO).await, vec![guild()]);

        registry.add_track(guild(), track("b")).await.unwrap();
        let engine = registry.get(guild()).unwrap();
        assert_eq!(titles(&engine.queue()), vec!["a", "b"]);
        assert_eq!(titles(&store.read_all(guild()).await.unwrap()), vec!["a", "b"]);
        assert_eq!(engine.volume(), 20);

        assert_eq!(registry.remove_track(guild(), 0).await.unwrap().title(), "a");
        assert_eq!(titles(&engine.queue()), vec!["b"]);
        assert_eq!(titles(&store.read_all(guild()).await.unwrap()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_playback_consumes_stored_head() {
        let (_dir, store) = json_store().await;
        let registry = registry_with(store.clone());

        registry.add_track(guild(), track("a")).await.unwrap();
        registry.add_track(guild(), track("b")).await.unwrap();
        let engine = registry.connect(guild(), ChannelId::new(5)).await.unwrap();

        engine.play().await.unwrap();
        wait_until(|| engine.status() == PlaybackStatus::Idle).await;

        assert!(store.read_all(guild()).await.unwrap().is_empty());
        let played: Vec<String> = store.history(guild()).await.into_iter().map(|p| p.title).collect();
        assert_eq!(played, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failed_head_delete_is_retried_before_next_edit() {
        let mut store = empty_store();
        let mut seq = Sequence::new();
        store
            .expect_delete_at()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(StorageError::Backend("locked".into())));
        store
            .expect_delete_at()
            .withf(|_, position| *position == 0)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store.expect_record_played().returning(|_, _| Ok(()));
        store.expect_append().times(1).returning(|_, _| Ok(()));
        let registry = registry_with(Arc::new(store));

        registry.journal.head_consumed(guild(), &track("a")).await;
        assert_eq!(registry.journal.pending.get(&guild()).map(|count| *count), Some(1));

        // The store still refuses, so the edit must not go through.
        assert!(registry.add_track(guild(), track("b")).await.is_err());
        assert!(registry.get(guild()).is_none());

        registry.add_track(guild(), track("c")).await.unwrap();
        assert!(registry.journal.pending.get(&guild()).is_none());
        assert_eq!(queue_of(&registry).await, vec!["c"]);
    }

    #[tokio::test]
    async fn test_stop_and_clear_ends_playback_and_empties_store() {
        let (_dir, store) = json_store().await;
        let registry = registry_with(store.clone());

        registry.add_track(guild(), track("long-a")).await.unwrap();
        registry.add_track(guild(), track("b")).await.unwrap();
        registry.add_track(guild(), track("c")).await.unwrap();
        let engine = registry.connect(guild(), ChannelId::new(5)).await.unwrap();
        engine.play().await.unwrap();
        assert_eq!(engine.now_playing().unwrap().title(), "long-a");

        assert_eq!(registry.stop_and_clear(guild()).await.unwrap(), 2);
        assert_eq!(engine.status(), PlaybackStatus::Idle);
        assert!(engine.now_playing().is_none());
        assert!(engine.queue().is_empty());
        assert!(store.read_all(guild()).await.unwrap().is_empty());
        assert!(matches!(engine.play().await, Err(PlaybackError::EmptyQueue)));
    }

    #[tokio::test]
    async fn test_volume_change_waits_for_queue_edits() {
        let (_dir, store) = json_store().await;
        let registry = Arc::new(registry_with(store.clone()));
        let engine = registry.get_or_create(guild()).await.unwrap();

        let edit = engine.lock_journal().await;
        let change = tokio::spawn({
            let registry = registry.clone();
            async move { registry.set_volume(guild(), 20).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.volume(), 50);
        assert_eq!(store.load_volume(guild()).await.unwrap(), None);

        drop(edit);
        assert_eq!(change.await.unwrap().unwrap(), 20);
        assert_eq!(engine.volume(), 20);
        assert_eq!(store.load_volume(guild()).await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_remove_and_idle_reaping() {
        let registry = registry_with(Arc::new(empty_store()));
        registry.remove(guild()).await.unwrap();

        let engine = registry.connect(guild(), ChannelId::new(5)).await.unwrap();
        assert_eq!(engine.connected_channel(), Some(ChannelId::new(5)));
        assert!(registry.remove_idle(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.remove_idle(Duration::ZERO).await, vec![guild()]);
        assert!(registry.is_empty());
        assert!(engine.connected_channel().is_none());

        registry.get_or_create(GuildId::new(7)).await.unwrap();
        registry.shutdown().await;
        assert!(registry.is_empty());
    }
}
