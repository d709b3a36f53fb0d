//! # Sources Module
//!
//! Turns a [`Locator`] into a stream of decoded audio frames.
//!
//! The engine only sees the [`Encoder`] and [`FrameSource`] traits; the
//! concrete [`ffmpeg::FfmpegEncoder`] spawns `ffmpeg` (and `yt-dlp` for
//! remote URLs) and slices their PCM output into 20 ms frames.
//!
//! ## Frame format
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Bit Depth**: 16-bit signed little-endian
//! - **Channels**: Stereo, interleaved
//! - **Frame Size**: 960 samples per channel (20ms)

pub mod ffmpeg;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::{audio::track::Locator, error::PlaybackError};

pub use ffmpeg::FfmpegEncoder;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
pub const FRAME_SAMPLES: usize = 960;
pub const FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS * 2;

/// One 20 ms block of interleaved s16le PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Bytes);

impl AudioFrame {
    pub fn new(data: Bytes) -> Self {
        Self(data)
    }

    pub fn silence() -> Self {
        Self(BytesMut::zeroed(FRAME_BYTES).freeze())
    }

    /// Builds a frame from samples, mostly useful in tests.
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for sample in samples {
            buf.extend_from_slice(&sample.to_le_bytes());
        }
        Self(buf.freeze())
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.0
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Opens decoded frame streams for tracks.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn open_stream(&self, locator: &Locator) -> Result<Box<dyn FrameSource>, PlaybackError>;
}

/// A lazy, finite sequence of frames for one track.
///
/// `cleanup` must release every subprocess or decoder the source holds; the
/// engine calls it exactly once, whether the track ended, failed or was
/// cancelled.
#[async_trait]
pub trait FrameSource: Send {
    /// `Ok(None)` marks the natural end of the track.
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>, PlaybackError>;

    fn set_paused(&mut self, paused: bool);

    async fn cleanup(&mut self);
}
