use bytes::BytesMut;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tracing::debug;

use crate::{
    error::{PlaybackError, Result},
    sources::AudioFrame,
};

pub const MAX_VOLUME: u8 = 100;

/// Shared volume level read by the forwarding stage on every frame.
///
/// Changing it never touches the stream itself, so there is no pause/unpause
/// glitch when the level moves.
#[derive(Debug, Clone)]
pub struct VolumeControl {
    level: Arc<AtomicU8>,
}

impl VolumeControl {
    pub fn new(level: u8) -> Self {
        Self {
            level: Arc::new(AtomicU8::new(level.min(MAX_VOLUME))),
        }
    }

    /// Validates a user-supplied level.
    pub fn validate(level: i32) -> Result<u8> {
        u8::try_from(level)
            .ok()
            .filter(|v| *v <= MAX_VOLUME)
            .ok_or(PlaybackError::InvalidVolume(level))
    }

    pub fn set(&self, level: u8) {
        self.level.store(level.min(MAX_VOLUME), Ordering::Release);
        debug!("🔊 Volume set to {}%", level);
    }

    pub fn get(&self) -> u8 {
        self.level.load(Ordering::Acquire)
    }

    /// Scales every sample of `frame` by the current gain.
    pub fn apply(&self, frame: AudioFrame) -> AudioFrame {
        let level = self.get();
        if level == MAX_VOLUME {
            return frame;
        }

        let gain = f32::from(level) / f32::from(MAX_VOLUME);
        let mut out = BytesMut::with_capacity(frame.len());
        for sample in frame.samples() {
            let scaled = (f32::from(sample) * gain)
                .round()
                .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
            out.extend_from_slice(&scaled.to_le_bytes());
        }
        AudioFrame::new(out.freeze())
    }
}
