use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::{path::PathBuf, sync::Arc};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::info;

use super::{Transport, VoiceConnection};
use crate::{error::PlaybackError, sources::AudioFrame};

/// Transport that records every guild's output to a raw PCM file.
///
/// Files land in `<dir>/guild_<id>.pcm` (48kHz, stereo, s16le) and can be
/// played back with `ffplay -f s16le -ar 48000 -ac 2`.
pub struct PcmFileTransport {
    dir: PathBuf,
}

impl PcmFileTransport {
    pub async fn new(dir: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("📼 PCM capture directory: {}", dir.display());
        Ok(Self { dir })
    }

    fn file_path(&self, guild_id: GuildId) -> PathBuf {
        self.dir.join(format!("guild_{}.pcm", guild_id))
    }
}

#[async_trait]
impl Transport for PcmFileTransport {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>, PlaybackError> {
        let path = self.file_path(guild_id);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PlaybackError::TransportFailed(format!("{}: {}", path.display(), e)))?;

        info!("🔗 Capturing guild {} (channel {}) to {}", guild_id, channel_id, path.display());
        Ok(Arc::new(PcmFileConnection {
            channel_id,
            file: Mutex::new(Some(file)),
        }))
    }
}

struct PcmFileConnection {
    channel_id: ChannelId,
    file: Mutex<Option<File>>,
}

#[async_trait]
impl VoiceConnection for PcmFileConnection {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    async fn send_frame(&self, frame: AudioFrame) -> Result<(), PlaybackError> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(PlaybackError::NotConnected)?;
        file.write_all(frame.as_bytes())
            .await
            .map_err(|e| PlaybackError::TransportFailed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), PlaybackError> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush()
                .await
                .map_err(|e| PlaybackError::TransportFailed(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_are_appended_until_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let transport = PcmFileTransport::new(dir.path().to_path_buf()).await.unwrap();
        let guild = GuildId::new(7);

        let conn = transport.connect(guild, ChannelId::new(8)).await.unwrap();
        conn.send_frame(AudioFrame::from_samples(&[1, 2])).await.unwrap();
        conn.send_frame(AudioFrame::from_samples(&[3, 4])).await.unwrap();
        conn.disconnect().await.unwrap();

        assert!(matches!(
            conn.send_frame(AudioFrame::silence()).await,
            Err(PlaybackError::NotConnected)
        ));

        let written = std::fs::read(dir.path().join("guild_7.pcm")).unwrap();
        assert_eq!(written, vec![1, 0, 2, 0, 3, 0, 4, 0]);
    }
}
