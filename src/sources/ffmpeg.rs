use async_trait::async_trait;
use bytes::BytesMut;
use std::{collections::VecDeque, path::Path, process::Stdio};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{AudioFrame, Encoder, FrameSource, CHANNELS, FRAME_BYTES, SAMPLE_RATE};
use crate::{audio::track::Locator, config::EncoderConfig, error::PlaybackError};

/// Lines of ffmpeg's stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Decodes tracks by spawning `ffmpeg`, fed by `yt-dlp` for remote URLs.
///
/// Output is raw PCM at unity gain; volume is applied later by the engine.
pub struct FfmpegEncoder {
    config: EncoderConfig,
}

impl FfmpegEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    fn ffmpeg_args(input: &str) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            input.into(),
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            SAMPLE_RATE.to_string(),
            "-ac".into(),
            CHANNELS.to_string(),
            "pipe:1".into(),
        ]
    }

    fn ytdlp_args(&self, url: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--format".into(),
            "bestaudio".into(),
            "--output".into(),
            "-".into(),
            "--no-playlist".into(),
            "--quiet".into(),
        ];

        if self.config.youtube_oauth {
            args.extend(["--username".into(), "oauth2".into(), "--password".into(), String::new()]);
        }

        if let Some(token) = &self.config.soundcloud_auth_token {
            args.extend(["--add-header".into(), format!("Authorization:OAuth {}", token)]);
        }

        args.push(url.into());
        args
    }

    fn spawn_ffmpeg(&self, input: &str, stdin: Stdio) -> Result<Child, PlaybackError> {
        Command::new(&self.config.ffmpeg_path)
            .args(Self::ffmpeg_args(input))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlaybackError::EncodingFailed(format!("failed to start ffmpeg: {}", e)))
    }

    fn open_local(&self, path: &Path) -> Result<FfmpegStream, PlaybackError> {
        let input = path.to_str().ok_or_else(|| {
            PlaybackError::EncodingFailed(format!("path is not valid UTF-8: {}", path.display()))
        })?;
        let ffmpeg = self.spawn_ffmpeg(input, Stdio::null())?;
        FfmpegStream::new(ffmpeg, None)
    }

    fn open_remote(&self, url: &str) -> Result<FfmpegStream, PlaybackError> {
        let mut ytdlp = Command::new(&self.config.ytdlp_path)
            .args(self.ytdlp_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlaybackError::EncodingFailed(format!("failed to start yt-dlp: {}", e)))?;

        let stdout = ytdlp
            .stdout
            .take()
            .ok_or_else(|| PlaybackError::EncodingFailed("yt-dlp has no stdout".into()))?;
        let pipe = TryInto::<Stdio>::try_into(stdout)
            .map_err(|e| PlaybackError::EncodingFailed(e.to_string()))?;

        // ytdlp is dropped (and killed) if ffmpeg fails to start
        let ffmpeg = self.spawn_ffmpeg("pipe:0", pipe)?;
        FfmpegStream::new(ffmpeg, Some(ytdlp))
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn open_stream(&self, locator: &Locator) -> Result<Box<dyn FrameSource>, PlaybackError> {
        info!("🎵 Opening stream for: {}", locator);
        let stream = match locator {
            Locator::Local { path } => self.open_local(path)?,
            Locator::Remote { url } => self.open_remote(url.as_str())?,
        };
        Ok(Box::new(stream))
    }
}

/// Reads fixed-size PCM frames from a running ffmpeg process.
struct FfmpegStream {
    ffmpeg: Child,
    ytdlp: Option<Child>,
    stdout: ChildStdout,
    stderr_tail: Option<JoinHandle<String>>,
    finished: bool,
}

impl FfmpegStream {
    fn new(mut ffmpeg: Child, ytdlp: Option<Child>) -> Result<Self, PlaybackError> {
        let stdout = ffmpeg
            .stdout
            .take()
            .ok_or_else(|| PlaybackError::EncodingFailed("ffmpeg has no stdout".into()))?;
        let stderr_tail = ffmpeg.stderr.take().map(drain_stderr);
        Ok(Self {
            ffmpeg,
            ytdlp,
            stdout,
            stderr_tail,
            finished: false,
        })
    }

    async fn exit_error(&mut self) -> Option<PlaybackError> {
        let status = self.ffmpeg.wait().await.ok()?;
        if status.success() {
            return None;
        }

        let stderr = match self.stderr_tail.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Some(PlaybackError::EncodingFailed(format!(
            "ffmpeg exited with {}: {}",
            status,
            stderr.trim()
        )))
    }
}

/// Reads stderr until ffmpeg closes it, so a chatty decoder never blocks on
/// a full pipe. Resolves to the last lines written.
fn drain_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).split(b'\n');
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        loop {
            match lines.next_segment().await {
                Ok(Some(line)) => {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(String::from_utf8_lossy(&line).into_owned());
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("ffmpeg stderr closed: {}", e);
                    break;
                }
            }
        }
        Vec::from(tail).join("\n")
    })
}

#[async_trait]
impl FrameSource for FfmpegStream {
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>, PlaybackError> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = BytesMut::zeroed(FRAME_BYTES);
        let mut filled = 0;
        while filled < FRAME_BYTES {
            let n = self
                .stdout
                .read(&mut buf[filled..])
                .await
                .map_err(|e| PlaybackError::EncodingFailed(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < FRAME_BYTES {
            self.finished = true;
            if filled == 0 {
                return match self.exit_error().await {
                    Some(err) => Err(err),
                    None => Ok(None),
                };
            }
            // Short tail frame: the rest of the buffer is already silence
        }

        Ok(Some(AudioFrame::new(buf.freeze())))
    }

    fn set_paused(&mut self, paused: bool) {
        // Nothing to signal: ffmpeg blocks on the full pipe while nobody reads
        debug!("⏯️ ffmpeg stream paused={}", paused);
    }

    async fn cleanup(&mut self) {
        for child in std::iter::once(&mut self.ffmpeg).chain(self.ytdlp.as_mut()) {
            if let Err(e) = child.start_kill() {
                debug!("process already gone: {}", e);
            }
            if let Err(e) = child.wait().await {
                warn!("⚠️ Failed to reap encoder process: {}", e);
            }
        }
        if let Some(task) = self.stderr_tail.take() {
            task.abort();
        }
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> EncoderConfig {
        EncoderConfig {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ytdlp_path: PathBuf::from("yt-dlp"),
            soundcloud_auth_token: None,
            youtube_oauth: false,
        }
    }

    #[test]
    fn test_ffmpeg_emits_discord_pcm() {
        let args = FfmpegEncoder::ffmpeg_args("/music/song.flac");
        let joined = args.join(" ");
        assert!(joined.contains("-i /music/song.flac"));
        assert!(joined.contains("-f s16le -ar 48000 -ac 2 pipe:1"));
    }

    #[test]
    fn test_ytdlp_auth_options() {
        let plain = FfmpegEncoder::new(config()).ytdlp_args("https://soundcloud.com/a/b");
        assert_eq!(plain.last().map(String::as_str), Some("https://soundcloud.com/a/b"));
        assert!(!plain.iter().any(|a| a == "--add-header"));

        let mut cfg = config();
        cfg.soundcloud_auth_token = Some("secret".into());
        cfg.youtube_oauth = true;
        let authed = FfmpegEncoder::new(cfg).ytdlp_args("https://soundcloud.com/a/b");
        assert!(authed.iter().any(|a| a == "Authorization:OAuth secret"));
        assert!(authed.windows(2).any(|w| w[0] == "--username" && w[1] == "oauth2"));
        assert_eq!(authed.last().map(String::as_str), Some("https://soundcloud.com/a/b"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_encoding_failure() {
        let mut cfg = config();
        cfg.ffmpeg_path = PathBuf::from("/nonexistent/ffmpeg-binary");
        let encoder = FfmpegEncoder::new(cfg);
        let locator = Locator::Local {
            path: PathBuf::from("/tmp/song.mp3"),
        };
        assert!(matches!(
            encoder.open_stream(&locator).await,
            Err(PlaybackError::EncodingFailed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_noisy_failing_decoder_reports_its_last_words() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        // More stderr than a pipe buffer holds, then a failure.
        std::fs::write(
            &script,
            "#!/bin/sh\nhead -c 262144 /dev/zero | tr '\\0' 'x' >&2\necho >&2\necho 'bad input' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = config();
        cfg.ffmpeg_path = script;
        let encoder = FfmpegEncoder::new(cfg);
        let locator = Locator::Local {
            path: PathBuf::from("/tmp/song.mp3"),
        };
        let mut stream = encoder.open_stream(&locator).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), stream.next_frame())
            .await
            .expect("decoder blocked on its stderr pipe");
        match result {
            Err(PlaybackError::EncodingFailed(message)) => {
                assert!(message.ends_with("bad input"), "unexpected message: {message}");
            }
            other => panic!("expected an encoding failure, got {other:?}"),
        }
        stream.cleanup().await;
    }
}
