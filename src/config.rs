use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

/// Paths and credentials for the ffmpeg/yt-dlp encoder.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ytdlp_path: PathBuf,
    /// Sent to yt-dlp as an `Authorization: OAuth` header
    pub soundcloud_auth_token: Option<String>,
    /// Use the yt-dlp oauth2 login for YouTube
    pub youtube_oauth: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Audio
    pub default_volume: u8,
    pub max_queue_size: usize,

    // Engines
    pub idle_timeout: u64, // seconds
    pub reaper_interval: u64, // seconds

    // Paths
    pub data_dir: PathBuf,

    pub encoder: EncoderConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source; `load` uses the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            // Audio
            default_volume: parse_or(&lookup, "DEFAULT_VOLUME", defaults.default_volume)?,
            max_queue_size: parse_or(&lookup, "MAX_QUEUE_SIZE", defaults.max_queue_size)?,

            // Engines
            idle_timeout: parse_or(&lookup, "IDLE_TIMEOUT", defaults.idle_timeout)?,
            reaper_interval: parse_or(&lookup, "REAPER_INTERVAL", defaults.reaper_interval)?,

            // Paths
            data_dir: lookup("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),

            encoder: EncoderConfig {
                ffmpeg_path: lookup("FFMPEG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.encoder.ffmpeg_path),
                ytdlp_path: lookup("YTDLP_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.encoder.ytdlp_path),
                soundcloud_auth_token: lookup("SOUNDCLOUD_AUTH_TOKEN").filter(|s| !s.trim().is_empty()),
                youtube_oauth: parse_or(&lookup, "YOUTUBE_OAUTH", defaults.encoder.youtube_oauth)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 100
    /// - Queue size must be greater than 0
    /// - Idle timeout and reaper interval must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 100 {
            anyhow::bail!("Default volume must be between 0 and 100, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.idle_timeout == 0 {
            anyhow::bail!("Idle timeout must be greater than 0");
        }

        if self.reaper_interval == 0 {
            anyhow::bail!("Reaper interval must be greater than 0");
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval)
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Credentials are reported only as present/absent.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Audio: {}% default vol, {} tracks max queue\n  \
            Engines: idle after {}, reaper every {}\n  \
            Data: {}\n  \
            Encoder: ffmpeg={} yt-dlp={} (SoundCloud auth: {}, YouTube oauth: {})",
            self.default_volume,
            self.max_queue_size,
            humantime::format_duration(self.idle_timeout()),
            humantime::format_duration(self.reaper_interval()),
            self.data_dir.display(),
            self.encoder.ffmpeg_path.display(),
            self.encoder.ytdlp_path.display(),
            self.encoder.soundcloud_auth_token.is_some(),
            self.encoder.youtube_oauth,
        )
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, value)),
        _ => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            default_volume: 50,
            max_queue_size: 100,

            idle_timeout: 300,   // 5 minutes
            reaper_interval: 60, // 1 minute

            data_dir: "/app/data".into(),

            encoder: EncoderConfig {
                ffmpeg_path: "ffmpeg".into(),
                ytdlp_path: "yt-dlp".into(),
                soundcloud_auth_token: None,
                youtube_oauth: false,
            },
        }
    }
}
