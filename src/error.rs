use thiserror::Error;

/// Errors returned by playback engines and the engine registry.
///
/// Validation errors (`InvalidPosition`, `InvalidVolume`, `QueueFull`) and
/// state errors (`EmptyQueue`, `NotConnected`, `NotPlaying`, `NotPaused`) are
/// returned synchronously and never retried. `EncodingFailed` and
/// `TransportFailed` come from the collaborators; inside the playback loop
/// they only end the current track.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("position {position} is out of range (queue has {len} tracks)")]
    InvalidPosition { position: usize, len: usize },

    #[error("volume {0} is out of range, expected 0-100")]
    InvalidVolume(i32),

    #[error("the queue is empty")]
    EmptyQueue,

    #[error("the queue is full (max {max} tracks)")]
    QueueFull { max: usize },

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("nothing is playing")]
    NotPlaying,

    #[error("the player is not paused")]
    NotPaused,

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised by a [`QueueStore`](crate::storage::QueueStore).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored queue for guild {guild_id} has no position {position}")]
    MissingPosition { guild_id: u64, position: usize },

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type Result<T, E = PlaybackError> = std::result::Result<T, E>;
