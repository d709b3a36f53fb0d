use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{GuildId, UserId};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    audio::track::{Locator, Track},
    error::StorageError,
};

/// Entries kept in each guild's play history file.
const MAX_STORED_HISTORY: usize = 100;

/// Durable per-guild queue.
///
/// Positions are dense and zero-based; `delete_at` and `move_to_front`
/// renumber the other entries the same way the in-memory queue does, so the
/// in-memory ordering can always be rebuilt from `read_all`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn append(&self, guild_id: GuildId, track: &Track) -> Result<(), StorageError>;

    async fn delete_at(&self, guild_id: GuildId, position: usize) -> Result<(), StorageError>;

    async fn move_to_front(&self, guild_id: GuildId, position: usize) -> Result<(), StorageError>;

    async fn clear(&self, guild_id: GuildId) -> Result<(), StorageError>;

    async fn read_all(&self, guild_id: GuildId) -> Result<Vec<Track>, StorageError>;

    /// Appends to the guild's play history.
    async fn record_played(&self, guild_id: GuildId, track: &Track) -> Result<(), StorageError>;

    async fn save_volume(&self, guild_id: GuildId, volume: u8) -> Result<(), StorageError>;

    async fn load_volume(&self, guild_id: GuildId) -> Result<Option<u8>, StorageError>;

    /// Every guild with stored state.
    async fn guilds(&self) -> Result<Vec<GuildId>, StorageError>;
}

/// A track that started playing, as kept in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayedTrack {
    pub title: String,
    pub locator: Locator,
    pub requested_by: UserId,
    pub played_at: DateTime<Utc>,
}

/// Everything stored for one guild, one JSON file each.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GuildRecord {
    guild_id: GuildId,
    #[serde(default)]
    volume: Option<u8>,
    #[serde(default)]
    queue: Vec<Track>,
    #[serde(default)]
    history: Vec<PlayedTrack>,
}

impl GuildRecord {
    fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            volume: None,
            queue: Vec::new(),
            history: Vec::new(),
        }
    }

    fn check_position(&self, position: usize) -> Result<(), StorageError> {
        if position >= self.queue.len() {
            return Err(StorageError::MissingPosition {
                guild_id: self.guild_id.get(),
                position,
            });
        }
        Ok(())
    }
}

/// Queue store backed by JSON files under `<data_dir>/guilds`.
///
/// Records are cached in memory; a mutation is only committed to the cache
/// once the file write succeeded.
pub struct JsonQueueStore {
    data_dir: PathBuf,
    guilds: Mutex<HashMap<GuildId, GuildRecord>>,
}

impl JsonQueueStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self, StorageError> {
        let guilds_dir = data_dir.join("guilds");
        fs::create_dir_all(&guilds_dir).await?;

        info!("📁 Storage initialized at: {}", data_dir.display());

        let store = Self {
            data_dir,
            guilds: Mutex::new(HashMap::new()),
        };
        store.load_all_guilds().await?;

        Ok(store)
    }

    /// Play history of a guild, oldest first.
    pub async fn history(&self, guild_id: GuildId) -> Vec<PlayedTrack> {
        self.guilds
            .lock()
            .await
            .get(&guild_id)
            .map(|record| record.history.clone())
            .unwrap_or_default()
    }

    async fn mutate<T, F>(&self, guild_id: GuildId, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut GuildRecord) -> Result<T, StorageError>,
    {
        let mut guilds = self.guilds.lock().await;
        let mut record = guilds
            .get(&guild_id)
            .cloned()
            .unwrap_or_else(|| GuildRecord::new(guild_id));

        let out = f(&mut record)?;
        self.save_record(&record).await?;
        guilds.insert(guild_id, record);
        Ok(out)
    }

    async fn save_record(&self, record: &GuildRecord) -> Result<(), StorageError> {
        let file_path = self.guild_file_path(record.guild_id);
        let tmp_path = file_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &file_path).await?;
        debug!("💾 Saved guild {}", record.guild_id);
        Ok(())
    }

    async fn load_record(&self, path: &Path) -> Result<GuildRecord, StorageError> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn load_all_guilds(&self) -> Result<(), StorageError> {
        let guilds_dir = self.data_dir.join("guilds");
        let mut files = fs::read_dir(&guilds_dir).await?;
        let mut guilds = self.guilds.lock().await;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
                .filter(|id| *id != 0)
            else {
                continue;
            };

            match self.load_record(&path).await {
                Ok(record) => {
                    guilds.insert(GuildId::new(guild_id), record);
                }
                Err(e) => {
                    warn!("⚠️ Error loading queue for guild {}: {}", guild_id, e);
                }
            }
        }

        if !guilds.is_empty() {
            info!("📂 Loaded {} guild queues", guilds.len());
        }

        Ok(())
    }

    fn guild_file_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir
            .join("guilds")
            .join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl QueueStore for JsonQueueStore {
    async fn append(&self, guild_id: GuildId, track: &Track) -> Result<(), StorageError> {
        self.mutate(guild_id, |record| {
            record.queue.push(track.clone());
            Ok(())
        })
        .await
    }

    async fn delete_at(&self, guild_id: GuildId, position: usize) -> Result<(), StorageError> {
        self.mutate(guild_id, |record| {
            record.check_position(position)?;
            record.queue.remove(position);
            Ok(())
        })
        .await
    }

    async fn move_to_front(&self, guild_id: GuildId, position: usize) -> Result<(), StorageError> {
        self.mutate(guild_id, |record| {
            record.check_position(position)?;
            let track = record.queue.remove(position);
            record.queue.insert(0, track);
            Ok(())
        })
        .await
    }

    async fn clear(&self, guild_id: GuildId) -> Result<(), StorageError> {
        self.mutate(guild_id, |record| {
            record.queue.clear();
            Ok(())
        })
        .await
    }

    async fn read_all(&self, guild_id: GuildId) -> Result<Vec<Track>, StorageError> {
        Ok(self
            .guilds
            .lock()
            .await
            .get(&guild_id)
            .map(|record| record.queue.clone())
            .unwrap_or_default())
    }

    async fn record_played(&self, guild_id: GuildId, track: &Track) -> Result<(), StorageError> {
        self.mutate(guild_id, |record| {
            record.history.push(PlayedTrack {
                title: track.title().to_string(),
                locator: track.locator().clone(),
                requested_by: track.requested_by(),
                played_at: Utc::now(),
            });
            if record.history.len() > MAX_STORED_HISTORY {
                let excess = record.history.len() - MAX_STORED_HISTORY;
                record.history.drain(..excess);
            }
            Ok(())
        })
        .await
    }

    async fn save_volume(&self, guild_id: GuildId, volume: u8) -> Result<(), StorageError> {
        self.mutate(guild_id, |record| {
            record.volume = Some(volume);
            Ok(())
        })
        .await
    }

    async fn load_volume(&self, guild_id: GuildId) -> Result<Option<u8>, StorageError> {
        Ok(self
            .guilds
            .lock()
            .await
            .get(&guild_id)
            .and_then(|record| record.volume))
    }

    async fn guilds(&self) -> Result<Vec<GuildId>, StorageError> {
        Ok(self.guilds.lock().await.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn track(title: &str) -> Track {
        Track::new(
            title,
            Locator::classify(&format!("https://example.com/{title}.mp3")).unwrap(),
            UserId::new(9),
        )
    }

    fn titles(tracks: &[Track]) -> Vec<&str> {
        tracks.iter().map(|t| t.title()).collect()
    }

    #[tokio::test]
    async fn test_positions_renumber_like_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
        let guild = GuildId::new(1);

        for title in ["a", "b", "c", "d"] {
            store.append(guild, &track(title)).await.unwrap();
        }
        store.delete_at(guild, 1).await.unwrap();
        store.move_to_front(guild, 2).await.unwrap();

        let queue = store.read_all(guild).await.unwrap();
        assert_eq!(titles(&queue), vec!["d", "a", "c"]);

        assert!(matches!(
            store.delete_at(guild, 3).await,
            Err(StorageError::MissingPosition { position: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let guild = GuildId::new(77);
        {
            let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
            store.append(guild, &track("first")).await.unwrap();
            store.append(guild, &track("second")).await.unwrap();
            store.save_volume(guild, 35).await.unwrap();
            store.record_played(guild, &track("old")).await.unwrap();
        }

        let reopened = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.guilds().await.unwrap(), vec![guild]);
        assert_eq!(titles(&reopened.read_all(guild).await.unwrap()), vec!["first", "second"]);
        assert_eq!(reopened.load_volume(guild).await.unwrap(), Some(35));
        let history = reopened.history(guild).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].title, "old");
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
        let guild = GuildId::new(3);

        for i in 0..MAX_STORED_HISTORY + 5 {
            store.record_played(guild, &track(&format!("t{i}"))).await.unwrap();
        }
        let history = store.history(guild).await;
        assert_eq!(history.len(), MAX_STORED_HISTORY);
        assert_eq!(history[0].title, "t5");
    }

    #[tokio::test]
    async fn test_unknown_guild_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
        let guild = GuildId::new(5);
        assert!(store.read_all(guild).await.unwrap().is_empty());
        assert_eq!(store.load_volume(guild).await.unwrap(), None);
        assert!(store.guilds().await.unwrap().is_empty());
    }
}
