//! Raw video encoding through an external `ffmpeg` process.
//!
//! Frames are packed RGB24 and are streamed to the encoder's stdin by a writer task.
//! The writer is fed through a bounded channel and awaits each write, so a slow encoder applies backpressure to the producer rather than frames accumulating in memory.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};

use crate::config::global_config;

/// Bytes per pixel of the raw video stream.
pub const RGB24_BYTES_PER_PIXEL: usize = 3;

/// An encoder error.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// An invalid encoder configuration.
    #[error("invalid encoder configuration: {0}")]
    InvalidConfig(String),
    /// The encoder process could not be spawned.
    #[error("failed to spawn encoder {program:?}: {source}")]
    SpawnFailed {
        /// The program.
        program: PathBuf,
        /// The spawn error.
        #[source]
        source: std::io::Error,
    },
    /// A frame with the wrong number of bytes.
    #[error("frame has {got} bytes, expected {expected}")]
    FrameSize {
        /// The expected size.
        expected: usize,
        /// The actual size.
        got: usize,
    },
    /// The encoder stopped accepting frames.
    #[error("encoder stdin closed")]
    PipeClosed,
    /// Writing to the encoder failed.
    #[error("failed to write to encoder stdin: {0}")]
    Write(#[source] std::io::Error),
    /// The encoder exited unsuccessfully.
    #[error("encoder exited with {status}: {stderr}")]
    ExitStatus {
        /// The exit status.
        status: ExitStatus,
        /// The trimmed standard error of the encoder.
        stderr: String,
    },
    /// An IO error preparing the output or waiting on the encoder.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The writer task panicked.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl EncodeError {
    /// The exit code of the encoder, if it exited unsuccessfully with a code.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExitStatus { status, .. } => status.code(),
            _ => None,
        }
    }
}

/// Encoder settings.
#[derive(Clone, Debug)]
pub struct EncodeConfig {
    /// The frame width.
    pub width: u32,
    /// The frame height.
    pub height: u32,
    /// Frames per second.
    pub fps: u32,
    /// The output file.
    pub out_path: PathBuf,
}

impl EncodeConfig {
    /// Check the frame dimensions and frame rate.
    ///
    /// # Errors
    /// Returns [`EncodeError::InvalidConfig`] if any value is zero or a dimension is odd (`yuv420p` output requires even dimensions).
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodeError::InvalidConfig(
                "width and height must be non-zero".to_string(),
            ));
        }
        if self.fps == 0 {
            return Err(EncodeError::InvalidConfig(
                "fps must be non-zero".to_string(),
            ));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(EncodeError::InvalidConfig(format!(
                "{}x{} is not even",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// The number of bytes in one frame.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB24_BYTES_PER_PIXEL
    }

    /// The `ffmpeg` arguments reading raw RGB24 from stdin and writing H.264 to [`out_path`](EncodeConfig::out_path).
    #[must_use]
    pub fn ffmpeg_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &format!("{}x{}", self.width, self.height),
            "-r",
            &self.fps.to_string(),
            "-i",
            "pipe:0",
            "-an",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(self.out_path.clone().into_os_string());
        args
    }
}

/// The program used to encode, and any arguments placed before the `ffmpeg` arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderCommand {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl Default for EncoderCommand {
    /// The `ffmpeg` configured by [`Config::ffmpeg_path`](crate::config::Config::ffmpeg_path).
    fn default() -> Self {
        Self::new(global_config().ffmpeg_path().clone())
    }
}

impl EncoderCommand {
    /// Create a new encoder command running `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Set the arguments passed before the `ffmpeg` arguments.
    #[must_use]
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The program.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The leading arguments.
    #[must_use]
    pub fn leading_args(&self) -> &[OsString] {
        &self.leading_args
    }
}

/// A running encoder process.
#[derive(Debug)]
pub struct RawVideoEncoder {
    child: Child,
    frames: Option<mpsc::Sender<Vec<u8>>>,
    writer: JoinHandle<std::io::Result<()>>,
    stderr: JoinHandle<String>,
    frame_len: usize,
    frames_sent: u64,
}

impl RawVideoEncoder {
    /// Spawn the encoder. At most `buffer_frames` frames are queued ahead of the encoder's stdin.
    ///
    /// The parent directory of the output is created if needed.
    ///
    /// # Errors
    /// Returns an [`EncodeError`] if the configuration is invalid, the output directory cannot be created, or the encoder cannot be spawned.
    pub async fn spawn(
        command: &EncoderCommand,
        config: &EncodeConfig,
        buffer_frames: usize,
    ) -> Result<Self, EncodeError> {
        config.validate()?;
        if let Some(parent) = config.out_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut child = Command::new(&command.program)
            .args(&command.leading_args)
            .args(config.ffmpeg_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncodeError::SpawnFailed {
                program: command.program.clone(),
                source,
            })?;
        tracing::debug!(program = ?command.program, width = config.width, height = config.height, fps = config.fps, "encoder spawned");

        let mut stdin = child.stdin.take().ok_or(EncodeError::PipeClosed)?;
        let mut stderr_pipe = child.stderr.take().ok_or(EncodeError::PipeClosed)?;

        let (frames, mut rx) = mpsc::channel::<Vec<u8>>(buffer_frames.max(1));
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                stdin.write_all(&frame).await?;
            }
            stdin.shutdown().await
        });
        let stderr = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).trim().to_string()
        });

        Ok(Self {
            child,
            frames: Some(frames),
            writer,
            stderr,
            frame_len: config.frame_len(),
            frames_sent: 0,
        })
    }

    /// Queue a frame, waiting while the queue is full.
    ///
    /// # Errors
    /// Returns [`EncodeError::FrameSize`] if `frame` is not a full frame, or [`EncodeError::PipeClosed`] if the encoder stopped accepting input.
    /// The cause of a closed pipe is reported by [`finish`](RawVideoEncoder::finish).
    pub async fn send(&mut self, frame: Vec<u8>) -> Result<(), EncodeError> {
        if frame.len() != self.frame_len {
            return Err(EncodeError::FrameSize {
                expected: self.frame_len,
                got: frame.len(),
            });
        }
        let frames = self.frames.as_ref().ok_or(EncodeError::PipeClosed)?;
        frames
            .send(frame)
            .await
            .map_err(|_| EncodeError::PipeClosed)?;
        self.frames_sent += 1;
        Ok(())
    }

    /// The number of frames queued so far.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Close the encoder's stdin and wait for it to exit. Returns the number of frames sent.
    ///
    /// # Errors
    /// Returns [`EncodeError::ExitStatus`] if the encoder exits unsuccessfully, otherwise an error if writing to it failed.
    pub async fn finish(mut self) -> Result<u64, EncodeError> {
        drop(self.frames.take());
        let written = (&mut self.writer).await;
        let status = self.child.wait().await?;
        let stderr = (&mut self.stderr).await.unwrap_or_default();
        if !status.success() {
            tracing::warn!(%status, stderr = %stderr, "encoder failed");
            return Err(EncodeError::ExitStatus { status, stderr });
        }
        written?.map_err(EncodeError::Write)?;
        tracing::debug!(frames = self.frames_sent, "encoder finished");
        Ok(self.frames_sent)
    }

    /// Stop the encoder without waiting for it to finish.
    pub async fn abort(mut self) {
        drop(self.frames.take());
        self.writer.abort();
        if let Err(err) = self.child.kill().await {
            tracing::debug!(error = %err, "failed to kill encoder");
        }
        self.stderr.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(out_path: PathBuf) -> EncodeConfig {
        EncodeConfig {
            width: 16,
            height: 16,
            fps: 5,
            out_path,
        }
    }

    #[test]
    fn encode_config_validation() {
        let mut cfg = config(PathBuf::from("out.mp4"));
        assert!(cfg.validate().is_ok());
        cfg.width = 0;
        assert!(cfg.validate().is_err());
        cfg.width = 15;
        assert!(cfg.validate().is_err());
        cfg.width = 16;
        cfg.fps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn encode_config_ffmpeg_args() {
        let args = config(PathBuf::from("out.mp4")).ffmpeg_args();
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy()).collect();
        assert_eq!(args.first().map(AsRef::as_ref), Some("-y"));
        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "16x16"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgb24"));
        assert!(args.windows(2).any(|w| w[0] == "-r" && w[1] == "5"));
        assert_eq!(args.last().map(AsRef::as_ref), Some("out.mp4"));
    }

    #[tokio::test]
    async fn encoder_spawn_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let command = EncoderCommand::new(dir.path().join("no-such-encoder"));
        let err = RawVideoEncoder::spawn(&command, &config(dir.path().join("out.mp4")), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::SpawnFailed { .. }));
        assert_eq!(err.exit_code(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn encoder_streams_frames() {
        let dir = tempfile::TempDir::new().unwrap();
        let out_path = dir.path().join("movies/out.raw");
        let command = EncoderCommand::new("sh").with_leading_args([
            "-c",
            "for last; do :; done; cat > \"$last\"",
            "fake-ffmpeg",
        ]);
        let cfg = config(out_path.clone());
        let mut encoder = RawVideoEncoder::spawn(&command, &cfg, 1).await.unwrap();
        for i in 0..3u8 {
            encoder.send(vec![i; cfg.frame_len()]).await.unwrap();
        }
        assert!(matches!(
            encoder.send(vec![0; 3]).await,
            Err(EncodeError::FrameSize { .. })
        ));
        assert_eq!(encoder.finish().await.unwrap(), 3);
        let bytes = std::fs::read(out_path).unwrap();
        assert_eq!(bytes.len(), 3 * cfg.frame_len());
        assert_eq!(bytes[2 * cfg.frame_len()], 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn encoder_exit_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let command = EncoderCommand::new("sh").with_leading_args([
            "-c",
            "echo broken >&2; exit 3",
            "fake-ffmpeg",
        ]);
        let cfg = config(dir.path().join("out.raw"));
        let mut encoder = RawVideoEncoder::spawn(&command, &cfg, 1).await.unwrap();
        // the write may or may not race the exit
        let _ = encoder.send(vec![0; cfg.frame_len()]).await;
        let err = encoder.finish().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("broken"));
    }
}
