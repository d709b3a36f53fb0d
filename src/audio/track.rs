use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

/// Where a track's audio comes from.
///
/// Resolved once when the track is created; the engine never looks at the
/// raw string again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Locator {
    Local { path: PathBuf },
    Remote { url: Url },
}

impl Locator {
    /// Classifies user input: an absolute path to an existing file is local,
    /// anything that parses as a URL is remote.
    pub fn classify(input: &str) -> Option<Self> {
        let input = input.trim();
        let path = Path::new(input);

        if path.is_absolute() && path.is_file() {
            return Some(Self::Local {
                path: path.to_path_buf(),
            });
        }

        Url::parse(input).ok().map(|url| Self::Remote { url })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(f, "{}", path.display()),
            Self::Remote { url } => write!(f, "{}", url),
        }
    }
}

/// A queued track. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    title: String,
    locator: Locator,
    duration: Option<Duration>,
    artwork: Option<String>,
    requested_by: UserId,
    added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(title: impl Into<String>, locator: Locator, requested_by: UserId) -> Self {
        Self {
            title: title.into(),
            locator,
            duration: None,
            artwork: None,
            requested_by,
            added_at: Utc::now(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_artwork(mut self, artwork: impl Into<String>) -> Self {
        self.artwork = Some(artwork.into());
        self
    }

    // Getters
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn locator(&self) -> &Locator {
        &self.locator
    }
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
    pub fn artwork(&self) -> Option<&str> {
        self.artwork.as_deref()
    }
    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }
    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }
    pub fn is_local(&self) -> bool {
        self.locator.is_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_classification() {
        let remote = Locator::classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        assert!(!remote.is_local());

        let file = tempfile::NamedTempFile::new().unwrap();
        let local = Locator::classify(file.path().to_str().unwrap()).unwrap();
        assert_eq!(
            local,
            Locator::Local {
                path: file.path().to_path_buf()
            }
        );

        // Absolute path that does not exist and is not a URL
        assert!(Locator::classify("/definitely/not/here.mp3").is_none());
        assert!(Locator::classify("just some words").is_none());
    }

    #[test]
    fn test_track_survives_json() {
        let track = Track::new(
            "Song",
            Locator::classify("https://example.com/song.mp3").unwrap(),
            UserId::new(42),
        )
        .with_duration(Duration::from_secs(180))
        .with_artwork("https://example.com/cover.jpg");

        let json = serde_json::to_string(&track).unwrap();
        assert!(json.contains("\"kind\":\"remote\""));
        let back: Track = serde_json::from_str(&json).unwrap();
        assert_eq!(back, track);
    }
}
