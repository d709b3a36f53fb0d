pub mod audio;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;
pub mod transport;

pub use error::{PlaybackError, StorageError};
