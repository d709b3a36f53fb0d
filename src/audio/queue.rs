use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use super::{player::PlaybackStatus, track::Track};
use crate::error::{PlaybackError, Result};

/// Ordered track queue owned by one engine.
///
/// Insertion order is the contract; only `move_to_front` reorders.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<Track>,
    max_size: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Fails with `QueueFull` if another track would exceed the capacity.
    pub fn ensure_capacity(&self) -> Result<()> {
        if self.items.len() >= self.max_size {
            return Err(PlaybackError::QueueFull { max: self.max_size });
        }
        Ok(())
    }

    /// Fails with `InvalidPosition` unless `position` is in `[0, len)`.
    pub fn check_position(&self, position: usize) -> Result<()> {
        if position >= self.items.len() {
            return Err(PlaybackError::InvalidPosition {
                position,
                len: self.items.len(),
            });
        }
        Ok(())
    }

    pub fn push(&mut self, track: Track) -> Result<()> {
        self.ensure_capacity()?;
        info!("➕ Added to queue: {}", track.title());
        self.items.push_back(track);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Track> {
        self.items.pop_front()
    }

    pub fn remove(&mut self, position: usize) -> Result<Track> {
        self.check_position(position)?;
        let removed = self
            .items
            .remove(position)
            .ok_or(PlaybackError::InvalidPosition {
                position,
                len: self.items.len(),
            })?;
        debug!("❌ Removed track at position {}", position);
        Ok(removed)
    }

    pub fn move_to_front(&mut self, position: usize) -> Result<()> {
        self.check_position(position)?;
        if position != 0 {
            if let Some(track) = self.items.remove(position) {
                self.items.push_front(track);
            }
            debug!("📍 Track moved from position {} to the front", position);
        }
        Ok(())
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        info!("🗑️ Queue cleared ({} tracks)", cleared);
        cleared
    }

    /// Replaces the whole queue, used when rehydrating from storage.
    pub fn replace(&mut self, tracks: Vec<Track>) {
        self.items = tracks.into();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().filter_map(|track| track.duration()).sum()
    }
}

/// Point-in-time view of an engine: what is playing and what is queued.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub now_playing: Option<Track>,
    pub items: Vec<Track>,
    pub status: PlaybackStatus,
    pub volume: u8,
    pub total_duration: Duration,
}

impl QueueSnapshot {
    /// Returns one page of the queued items. Pages start at 1.
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let safe_page = page.max(1);
        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(self.items.len());
        let total_pages = if self.items.is_empty() {
            1
        } else {
            self.items.len().div_ceil(items_per_page)
        };

        QueuePage {
            items: if start < self.items.len() {
                self.items[start..end].to_vec()
            } else {
                Vec::new()
            },
            current_page: safe_page,
            total_pages,
            total_items: self.items.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<Track>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
