//! # Audio Module
//!
//! Per-guild playback for Open Music: queues, the playback engine and the
//! registry that owns one engine per guild.
//!
//! ## Architecture
//!
//! ### [`player`] - Playback Engine
//! - `Idle` / `Playing` / `Paused` state machine
//! - One playback loop per guild, cancelled through `CancellationToken`s
//! - Forwards decoded frames to the voice connection, applying volume as gain
//!
//! ### [`registry`] - Engine Registry
//! - Maps `GuildId` to engine, creating engines lazily
//! - Writes queue edits to the [`QueueStore`](crate::storage::QueueStore)
//!   before applying them in memory
//! - Rehydrates queues after a restart and reaps idle engines
//!
//! ### [`queue`] - Queue Management
//! - FIFO queue with bounded capacity and move-to-front
//! - Snapshots and pagination for display
//!
//! ### [`effects`] - Audio Processing
//! - Shared volume level applied to every PCM frame
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Bit Depth**: 16-bit signed integers
//! - **Channels**: Stereo (2 channels)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_engine::audio::{registry::{EngineRegistry, EngineSettings}, track::{Locator, Track}};
//! use open_music_engine::{config::Config, sources::FfmpegEncoder, storage::JsonQueueStore, transport::PcmFileTransport};
//! use serenity::model::id::{ChannelId, GuildId, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let registry = EngineRegistry::new(
//!     Arc::new(JsonQueueStore::new(config.data_dir.clone()).await?),
//!     Arc::new(FfmpegEncoder::new(config.encoder.clone())),
//!     Arc::new(PcmFileTransport::new(config.data_dir.join("capture")).await?),
//!     EngineSettings::from(&config),
//! );
//!
//! let guild_id = GuildId::new(123456789);
//! let locator = Locator::classify("https://example.com/song.mp3").unwrap();
//! registry.add_track(guild_id, Track::new("Song", locator, UserId::new(1))).await?;
//!
//! let engine = registry.connect(guild_id, ChannelId::new(987654321)).await?;
//! engine.play().await?;
//! engine.pause()?;
//! engine.resume()?;
//! engine.skip()?;
//! # Ok(())
//! # }
//! ```

pub mod effects;
pub mod player;
pub mod queue;
pub mod registry;
pub mod track;

pub use player::{PlaybackEngine, PlaybackStatus};
pub use registry::EngineRegistry;
