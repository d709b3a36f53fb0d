//! Voice transport seam.
//!
//! The engine never speaks the voice protocol itself: it asks a [`Transport`]
//! for a [`VoiceConnection`] and pushes decoded frames into it.

pub mod pcm_file;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;

use crate::{error::PlaybackError, sources::AudioFrame};

pub use pcm_file::PcmFileTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Joins `channel_id` in `guild_id`. Failures are reported as
    /// `TransportFailed` and are not retried here.
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>, PlaybackError>;
}

/// A live sink for one guild's audio.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn channel_id(&self) -> ChannelId;

    async fn send_frame(&self, frame: AudioFrame) -> Result<(), PlaybackError>;

    async fn disconnect(&self) -> Result<(), PlaybackError>;
}
