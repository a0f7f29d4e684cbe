//! Movie rendering.
//!
//! A movie is rendered from the frames of one channel of a crop array over a selection of time points.
//! Rendering proceeds in two phases:
//!  - the selected frames are loaded through a [`FrameLoader`] (the first 40% of progress), then
//!  - each frame is normalised with the global intensity range of all loaded frames, colour mapped, overlaid with spot crosses, letterboxed, and streamed to an encoder (the remaining 60%).
//!
//! Frames are letterboxed to dimensions that are a multiple of 16.
//! The encoder is `ffmpeg` by default (see [`Config::ffmpeg_path`](crate::config::Config::ffmpeg_path)), reading raw RGB24 frames from stdin.

mod colormap;
mod encoder;
mod overlay;
mod spots;
mod time_selection;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use colormap::{Colormap, UnknownColormapError};
pub use encoder::{EncodeConfig, EncodeError, EncoderCommand, RawVideoEncoder};
pub use overlay::{draw_cross, letterbox, padded_dimension, CROSS_ARM, CROSS_COLOR};
pub use spots::{crop_matches, read_spots, read_spots_csv, Spot, SpotsByTime, SpotsError};
pub use time_selection::{parse_time_selection, TimeSelectionError};

use crate::{
    array::ArrayCreateError,
    cache::ArrayHandleCache,
    config::global_config,
    frame::{Frame, FrameLoadError, FrameLoader},
    metadata::MetadataError,
    storage::{FilesystemStore, FilesystemStoreCreateError, ReadableListableStorage},
    task::{ErrorCategory, TaskContext},
};

/// The share of progress taken by loading frames.
const LOAD_PROGRESS: f64 = 0.4;

/// A movie rendering request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MovieRequest {
    /// The root of the crop store.
    pub array_root: PathBuf,
    /// The position identifier.
    pub pos: String,
    /// The crop identifier.
    pub crop: String,
    /// The channel index.
    pub channel: u64,
    /// The time selection, see [`parse_time_selection`].
    pub time: String,
    /// The movie file to write.
    pub output_path: PathBuf,
    /// Frames per second.
    pub fps: u32,
    /// The colormap.
    #[serde(default)]
    pub colormap: Colormap,
    /// An optional spots CSV to overlay.
    #[serde(default)]
    pub spots_csv: Option<PathBuf>,
}

/// The result of a movie rendering.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MovieOutcome {
    /// The movie file written.
    pub output_path: PathBuf,
    /// The number of frames encoded.
    pub frames: u64,
    /// The encoded width.
    pub width: u32,
    /// The encoded height.
    pub height: u32,
}

/// A movie rendering error.
#[derive(Debug, Error)]
pub enum MovieError {
    /// A zero frame rate.
    #[error("fps must be positive")]
    InvalidFps,
    /// The requested channel does not exist.
    #[error("channel {channel} is out of range for {channels} channels")]
    ChannelOutOfRange {
        /// The requested channel.
        channel: u64,
        /// The number of channels.
        channels: u64,
    },
    /// The crop array is not a `(t, c, z, y, x)` array of frames that can be encoded.
    #[error("crop array shape {0:?} cannot be rendered")]
    InvalidArrayShape(Vec<u64>),
    /// An invalid time selection.
    #[error(transparent)]
    TimeSelection(#[from] TimeSelectionError),
    /// The time selection is empty.
    #[error("time selection {0:?} selects no frames")]
    NoFrames(String),
    /// The store could not be opened.
    #[error(transparent)]
    StoreCreate(#[from] FilesystemStoreCreateError),
    /// The crop array could not be opened.
    #[error("failed to open crop {pos_id}/{crop_id}: {source}")]
    Open {
        /// The position identifier.
        pos_id: String,
        /// The crop identifier.
        crop_id: String,
        /// The open error.
        source: Arc<ArrayCreateError>,
    },
    /// A frame could not be loaded.
    #[error(transparent)]
    FrameLoad(#[from] FrameLoadError),
    /// The spots CSV could not be read.
    #[error("failed to read spots {path:?}: {source}")]
    Spots {
        /// The spots CSV path.
        path: PathBuf,
        /// The error.
        source: SpotsError,
    },
    /// The encoder failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The rendering was canceled.
    #[error("movie rendering canceled")]
    Canceled,
}

fn open_category(err: &ArrayCreateError) -> ErrorCategory {
    match err {
        err if err.is_not_found() => ErrorCategory::NotFound,
        ArrayCreateError::MetadataError(MetadataError::Malformed(..)) => ErrorCategory::Malformed,
        ArrayCreateError::InvalidPath(_) => ErrorCategory::InvalidRequest,
        ArrayCreateError::MetadataError(_) => ErrorCategory::Io,
    }
}

impl MovieError {
    /// The category of the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidFps
            | Self::ChannelOutOfRange { .. }
            | Self::TimeSelection(_)
            | Self::NoFrames(_)
            | Self::StoreCreate(FilesystemStoreCreateError::InvalidBasePath(_)) => {
                ErrorCategory::InvalidRequest
            }
            Self::InvalidArrayShape(_) | Self::FrameLoad(FrameLoadError::NotFramed { .. }) => {
                ErrorCategory::Malformed
            }
            Self::Open { source, .. } | Self::FrameLoad(FrameLoadError::Open { source, .. }) => {
                open_category(source)
            }
            Self::FrameLoad(FrameLoadError::Read { .. }) => ErrorCategory::TransientReadFailure,
            Self::Spots {
                source: SpotsError::IOError(err),
                ..
            } if err.kind() == std::io::ErrorKind::NotFound => ErrorCategory::NotFound,
            Self::Spots { .. } => ErrorCategory::InvalidRequest,
            Self::Encode(EncodeError::IOError(_)) | Self::StoreCreate(_) => ErrorCategory::Io,
            Self::Encode(_) => ErrorCategory::SubprocessFailure,
            Self::Canceled => ErrorCategory::Canceled,
        }
    }
}

/// Normalise `frame` to `[0, 1]` with the intensity range `(min, max)`, colour map it, and draw `spots` over it.
///
/// A zero intensity range maps every pixel to 0.
///
/// # Errors
/// Returns [`MovieError::InvalidArrayShape`] if the frame dimensions exceed [`u32::MAX`].
pub fn render_frame(
    frame: &Frame,
    (min, max): (f64, f64),
    colormap: Colormap,
    spots: &[Spot],
) -> Result<RgbImage, MovieError> {
    let (Ok(width), Ok(height)) = (u32::try_from(frame.width), u32::try_from(frame.height)) else {
        return Err(MovieError::InvalidArrayShape(vec![frame.height, frame.width]));
    };
    let range = max - min;
    let mut image = RgbImage::from_fn(width, height, |x, y| {
        let index = y as usize * width as usize + x as usize;
        let v = match frame.data.get_f64(index) {
            Some(v) if range > 0.0 => (v - min) / range,
            _ => 0.0,
        };
        image::Rgb(colormap.map(v))
    });
    for spot in spots {
        draw_cross(&mut image, spot.y, spot.x);
    }
    Ok(image)
}

/// Renders movies from the crop arrays of stores, sharing an [`ArrayHandleCache`] with other readers.
#[derive(Clone, Debug)]
pub struct MovieRenderer {
    cache: Arc<ArrayHandleCache>,
    encoder: EncoderCommand,
    buffer_frames: usize,
}

impl MovieRenderer {
    /// Create a new movie renderer using the configured encoder.
    #[must_use]
    pub fn new(cache: Arc<ArrayHandleCache>) -> Self {
        Self {
            cache,
            encoder: EncoderCommand::default(),
            buffer_frames: global_config().encoder_buffer_frames(),
        }
    }

    /// Use `program` as the encoder.
    #[must_use]
    pub fn with_encoder_program(self, program: impl Into<PathBuf>) -> Self {
        self.with_encoder_command(EncoderCommand::new(program))
    }

    /// Use `encoder` as the encoder.
    #[must_use]
    pub fn with_encoder_command(mut self, encoder: EncoderCommand) -> Self {
        self.encoder = encoder;
        self
    }

    /// Set the number of frames queued ahead of the encoder.
    #[must_use]
    pub fn with_buffer_frames(mut self, buffer_frames: usize) -> Self {
        self.buffer_frames = buffer_frames.max(1);
        self
    }

    /// The handle cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ArrayHandleCache> {
        &self.cache
    }

    /// The encoder command.
    #[must_use]
    pub fn encoder(&self) -> &EncoderCommand {
        &self.encoder
    }

    /// Render the movie described by `request`.
    ///
    /// Cancellation is checked between frames.
    ///
    /// # Errors
    /// Returns a [`MovieError`] if the request is invalid, a frame cannot be loaded, the encoder fails, or the rendering is canceled.
    #[tracing::instrument(skip_all, fields(pos = %request.pos, crop = %request.crop, output = %request.output_path.display()))]
    pub async fn render(
        &self,
        request: &MovieRequest,
        ctx: &TaskContext,
    ) -> Result<MovieOutcome, MovieError> {
        if request.fps == 0 {
            return Err(MovieError::InvalidFps);
        }
        let storage: ReadableListableStorage =
            Arc::new(FilesystemStore::new(&request.array_root)?);
        let handle = self
            .cache
            .get(&storage, &request.pos, &request.crop)
            .await
            .map_err(|source| MovieError::Open {
                pos_id: request.pos.clone(),
                crop_id: request.crop.clone(),
                source,
            })?;
        let &[num_times, num_channels, _, height, width] = handle.shape().as_slice() else {
            return Err(MovieError::InvalidArrayShape(handle.shape().clone()));
        };
        let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
            return Err(MovieError::InvalidArrayShape(handle.shape().clone()));
        };
        if handle.chunk_shape().as_slice() != [1, 1, 1, u64::from(height), u64::from(width)] {
            return Err(MovieError::InvalidArrayShape(handle.shape().clone()));
        }
        if request.channel >= num_channels {
            return Err(MovieError::ChannelOutOfRange {
                channel: request.channel,
                channels: num_channels,
            });
        }
        let times = parse_time_selection(&request.time, num_times)?;
        if times.is_empty() {
            return Err(MovieError::NoFrames(request.time.clone()));
        }

        let spots = match &request.spots_csv {
            Some(path) => read_spots_file(path, &request.crop).await?,
            None => SpotsByTime::new(),
        };

        // Load
        let loader = FrameLoader::new(storage, self.cache.clone());
        let num_frames = times.len();
        let mut frames = Vec::with_capacity(num_frames);
        for (i, &t) in times.iter().enumerate() {
            if ctx.is_canceled() {
                return Err(MovieError::Canceled);
            }
            let frame = loader
                .load_frame(&request.pos, &request.crop, t, request.channel, 0)
                .await?;
            frames.push(frame);
            ctx.progress(
                LOAD_PROGRESS * fraction(i + 1, num_frames),
                format!("Loaded frame {}/{num_frames}", i + 1),
            );
        }
        let range = frames
            .iter()
            .filter_map(|frame| frame.data.min_max_f64())
            .reduce(|(min_a, max_a), (min_b, max_b)| (min_a.min(min_b), max_a.max(max_b)))
            .unwrap_or((0.0, 0.0));
        tracing::debug!(frames = num_frames, min = range.0, max = range.1, "frames loaded");

        // Encode
        let config = EncodeConfig {
            width: padded_dimension(width),
            height: padded_dimension(height),
            fps: request.fps,
            out_path: request.output_path.clone(),
        };
        let mut encoder = RawVideoEncoder::spawn(&self.encoder, &config, self.buffer_frames).await?;
        for (i, (frame, t)) in frames.iter().zip(&times).enumerate() {
            if ctx.is_canceled() {
                encoder.abort().await;
                return Err(MovieError::Canceled);
            }
            let frame_spots = spots.get(t).map_or(&[][..], Vec::as_slice);
            let image = match render_frame(frame, range, request.colormap, frame_spots) {
                Ok(image) => letterbox(&image),
                Err(err) => {
                    encoder.abort().await;
                    return Err(err);
                }
            };
            let sent = encoder.send(image.into_raw()).await;
            if let Err(err) = sent {
                // a closed pipe means the encoder exited, report why
                let err = if matches!(err, EncodeError::PipeClosed) {
                    encoder.finish().await.err().unwrap_or(err)
                } else {
                    encoder.abort().await;
                    err
                };
                return Err(err.into());
            }
            ctx.progress(
                LOAD_PROGRESS + (1.0 - LOAD_PROGRESS) * fraction(i + 1, num_frames),
                format!("Encoded frame {}/{num_frames}", i + 1),
            );
        }
        let frames = encoder.finish().await?;
        tracing::info!(frames, "movie written");
        ctx.log(format!("Wrote {}", request.output_path.display()));

        Ok(MovieOutcome {
            output_path: request.output_path.clone(),
            frames,
            width: config.width,
            height: config.height,
        })
    }
}

async fn read_spots_file(path: &Path, crop_id: &str) -> Result<SpotsByTime, MovieError> {
    let spots_error = |source: SpotsError| MovieError::Spots {
        path: path.to_path_buf(),
        source,
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| spots_error(err.into()))?;
    read_spots(bytes.as_slice(), crop_id).map_err(spots_error)
}

#[allow(clippy::cast_precision_loss)]
fn fraction(done: usize, total: usize) -> f64 {
    done as f64 / total as f64
}
