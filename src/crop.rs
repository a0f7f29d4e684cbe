//! Crop extraction.
//!
//! Extraction reads the raw frames of one microscope position and cuts every pattern site bounding box out of every frame into its own crop array.
//!
//! Source frames are single channel 8 or 16 bit TIFFs named `img_channel{c}_position{p}_time{t}_z{z}.tif` in the directory `{input_dir}/Pos{pos}`.
//! The distinct channel, time, and z indices found are mapped in ascending order onto the dense `c`, `t`, and `z` axes of the crop arrays.
//!
//! Optionally, a `background` array records the median intensity of the pixels outside all bounding boxes for each frame.
//!
//! Every request problem (a missing position directory, an unreadable bounding box CSV, no source frames, no bounding boxes, or a bounding box outside the frame) is detected before any output is written.
//! A frame that cannot be decoded aborts the extraction.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use image::DynamicImage;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    array::{Array, ArrayCreateError, ArrayElements, ArrayError},
    bbox::{read_bbox_csv, BBox, BBoxError},
    discovery::CropInfo,
    layout::{
        background_array_prefix, crop_array_prefix, crop_id, crops_prefix, position_id,
        position_prefix, positions_prefix,
    },
    metadata::{
        background_attributes, crop_attributes, write_group_metadata, ArrayMetadata, DataType,
        MetadataError,
    },
    storage::{FilesystemStore, FilesystemStoreCreateError, StorePrefix, StorePrefixError},
    task::{ErrorCategory, TaskContext},
};

/// A crop extraction request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CropRequest {
    /// The directory containing the `Pos{pos}` directories of source frames.
    pub input_dir: PathBuf,
    /// The microscope position number.
    pub pos: u32,
    /// The bounding box CSV.
    pub bbox_path: PathBuf,
    /// The root of the crop store to write.
    pub output_root: PathBuf,
    /// Whether to write the per-frame background array.
    #[serde(default)]
    pub background: bool,
}

/// The result of a crop extraction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CropOutcome {
    /// The root of the crop store.
    pub output_root: PathBuf,
    /// The position identifier written.
    pub pos_id: String,
    /// The number of source frames read.
    pub frames: usize,
    /// The crops written.
    pub crops: Vec<CropInfo>,
    /// Whether the background array was written.
    pub background: bool,
}

/// A crop extraction error.
#[derive(Debug, Error)]
pub enum CropError {
    /// The position directory does not exist.
    #[error("position directory {} not found", .0.display())]
    PositionNotFound(PathBuf),
    /// The bounding box CSV could not be read.
    #[error("failed to read bounding boxes from {}: {source}", path.display())]
    BBoxes {
        /// The CSV path.
        path: PathBuf,
        /// The CSV error.
        source: BBoxError,
    },
    /// The position directory has no source frames.
    #[error("no source frames found in {}", .0.display())]
    NoInputFiles(PathBuf),
    /// The bounding box CSV has no rows.
    #[error("no bounding boxes in {}", .0.display())]
    NoBoundingBoxes(PathBuf),
    /// A bounding box does not lie within the source frames.
    #[error("bounding box {bbox:?} does not fit in a {width}x{height} frame")]
    BBoxOutOfBounds {
        /// The bounding box.
        bbox: BBox,
        /// The frame width.
        width: u32,
        /// The frame height.
        height: u32,
    },
    /// A source frame could not be decoded.
    #[error("failed to decode {}: {reason}", path.display())]
    Decode {
        /// The source frame path.
        path: PathBuf,
        /// Why decoding failed.
        reason: String,
    },
    /// A source frame differs in size or pixel format from the first frame.
    #[error("{} is a {width}x{height} {data_type} frame, expected {expected_width}x{expected_height} {expected_data_type}", path.display())]
    FrameMismatch {
        /// The source frame path.
        path: PathBuf,
        /// The frame width.
        width: u32,
        /// The frame height.
        height: u32,
        /// The frame data type.
        data_type: DataType,
        /// The expected width.
        expected_width: u32,
        /// The expected height.
        expected_height: u32,
        /// The expected data type.
        expected_data_type: DataType,
    },
    /// The crop store could not be created.
    #[error(transparent)]
    StoreCreate(#[from] FilesystemStoreCreateError),
    /// An invalid store path.
    #[error(transparent)]
    InvalidPath(#[from] StorePrefixError),
    /// A metadata error.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// An array creation error.
    #[error(transparent)]
    ArrayCreate(#[from] ArrayCreateError),
    /// An array error.
    #[error(transparent)]
    Array(#[from] ArrayError),
    /// An error listing the position directory.
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    /// A decode worker panicked or was aborted.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    /// Extraction was canceled.
    #[error("crop extraction canceled")]
    Canceled,
}

impl CropError {
    /// The category of the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PositionNotFound(_) | Self::NoInputFiles(_) => ErrorCategory::NotFound,
            Self::BBoxes {
                source: BBoxError::IOError(err),
                ..
            } if err.kind() == std::io::ErrorKind::NotFound => ErrorCategory::NotFound,
            Self::BBoxes { .. }
            | Self::NoBoundingBoxes(_)
            | Self::BBoxOutOfBounds { .. }
            | Self::InvalidPath(_) => ErrorCategory::InvalidRequest,
            Self::Decode { .. } | Self::FrameMismatch { .. } | Self::Join(_) => {
                ErrorCategory::DecodeFailure
            }
            Self::Metadata(MetadataError::Malformed(..))
            | Self::ArrayCreate(ArrayCreateError::MetadataError(MetadataError::Malformed(..))) => {
                ErrorCategory::Malformed
            }
            Self::StoreCreate(_)
            | Self::Metadata(_)
            | Self::ArrayCreate(_)
            | Self::Array(_)
            | Self::Walk(_) => ErrorCategory::Io,
            Self::Canceled => ErrorCategory::Canceled,
        }
    }
}

/// The `(channel, time, z)` indices of a source frame as given in its file name.
///
/// Keys order by channel, then time, then z.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SourceFrameKey {
    /// The channel index.
    pub channel: u32,
    /// The time index.
    pub time: u32,
    /// The z index.
    pub z: u32,
}

fn source_frame_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^img_channel(\d+)_position(\d+)_time(\d+)_z(\d+)\.tif$")
            .expect("source frame pattern is a valid regex")
    })
}

/// Parse a source frame file name.
///
/// Returns [`None`] if `file_name` is not a source frame name.
#[must_use]
pub fn parse_source_frame_name(file_name: &str) -> Option<SourceFrameKey> {
    let captures = source_frame_regex().captures(file_name)?;
    Some(SourceFrameKey {
        channel: captures[1].parse().ok()?,
        time: captures[3].parse().ok()?,
        z: captures[4].parse().ok()?,
    })
}

/// Index the source frames in `pos_dir` by their `(channel, time, z)` indices.
///
/// Files that are not named like source frames are ignored.
///
/// # Errors
/// Returns [`CropError::Walk`] if the directory cannot be listed.
pub fn discover_source_frames(
    pos_dir: &Path,
) -> Result<BTreeMap<SourceFrameKey, PathBuf>, CropError> {
    let mut frames = BTreeMap::new();
    for entry in walkdir::WalkDir::new(pos_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = entry.file_name().to_str().and_then(parse_source_frame_name) else {
            continue;
        };
        frames.insert(key, entry.into_path());
    }
    Ok(frames)
}

/// The distinct source indices along each axis, ascending.
#[derive(Debug, Clone)]
struct AxisRanks {
    channels: Vec<u32>,
    times: Vec<u32>,
    zs: Vec<u32>,
}

impl AxisRanks {
    fn new<'a>(keys: impl Iterator<Item = &'a SourceFrameKey> + Clone) -> Self {
        Self {
            channels: keys.clone().map(|k| k.channel).sorted().dedup().collect(),
            times: keys.clone().map(|k| k.time).sorted().dedup().collect(),
            zs: keys.map(|k| k.z).sorted().dedup().collect(),
        }
    }

    /// The dense `(t, c, z)` chunk indices of a source frame.
    fn chunk_indices(&self, key: &SourceFrameKey) -> [u64; 3] {
        let rank = |values: &[u32], value: u32| values.binary_search(&value).unwrap_or_default() as u64;
        [
            rank(&self.times, key.time),
            rank(&self.channels, key.channel),
            rank(&self.zs, key.z),
        ]
    }

    fn shape(&self) -> [u64; 3] {
        [
            self.times.len() as u64,
            self.channels.len() as u64,
            self.zs.len() as u64,
        ]
    }
}

struct DecodedFrame {
    width: u32,
    height: u32,
    pixels: ArrayElements,
}

fn decode_frame(path: &Path) -> Result<DecodedFrame, CropError> {
    let decode_error = |reason: String| CropError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    let image = image::open(path).map_err(|err| decode_error(err.to_string()))?;
    let (width, height) = (image.width(), image.height());
    let pixels = match image {
        DynamicImage::ImageLuma8(buffer) => ArrayElements::UInt8(buffer.into_raw()),
        DynamicImage::ImageLuma16(buffer) => ArrayElements::UInt16(buffer.into_raw()),
        other => {
            return Err(decode_error(format!(
                "unsupported pixel format {:?}, expected 8 or 16 bit grayscale",
                other.color()
            )))
        }
    };
    Ok(DecodedFrame {
        width,
        height,
        pixels,
    })
}

async fn decode_frame_blocking(path: PathBuf) -> Result<DecodedFrame, CropError> {
    tokio::task::spawn_blocking(move || decode_frame(&path)).await?
}

/// A mask over a `width` x `height` frame which is true for pixels outside all `bboxes`.
#[must_use]
pub fn outside_mask(width: usize, height: usize, bboxes: &[BBox]) -> Vec<bool> {
    let mut outside = vec![true; width * height];
    for bbox in bboxes {
        let x0 = (bbox.x as usize).min(width);
        let x1 = (bbox.x as usize + bbox.w as usize).min(width);
        let y0 = (bbox.y as usize).min(height);
        let y1 = (bbox.y as usize + bbox.h as usize).min(height);
        for row in y0..y1 {
            outside[row * width + x0..row * width + x1].fill(false);
        }
    }
    outside
}

/// The median of `values`, averaging the middle pair for an even count.
///
/// Returns NaN if `values` is empty. `values` is reordered.
#[must_use]
pub fn median(values: &mut [f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }
    let (lower, upper, _) = values.select_nth_unstable_by(n / 2, f64::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        upper
    } else {
        let lower = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (lower + upper) / 2.0
    }
}

/// The median of the `pixels` where `outside` is true.
#[must_use]
pub fn median_outside(pixels: &ArrayElements, outside: &[bool]) -> f64 {
    let mut values: Vec<f64> = std::iter::zip(pixels.to_f64_vec(), outside)
        .filter_map(|(value, &outside)| outside.then_some(value))
        .collect();
    median(&mut values)
}

async fn write_groups(store: &FilesystemStore, pos_id: &str) -> Result<(), CropError> {
    for prefix in [
        StorePrefix::root(),
        positions_prefix(),
        position_prefix(pos_id)?,
        crops_prefix(pos_id)?,
    ] {
        write_group_metadata(store, &prefix).await?;
    }
    Ok(())
}

/// Run a crop extraction.
///
/// Progress is reported once per source frame.
/// Cancellation is checked before each source frame; chunks already written are kept.
///
/// # Errors
/// Returns a [`CropError`] if the request is invalid, a source frame cannot be decoded, the output cannot be written, or the extraction is canceled.
#[tracing::instrument(skip_all, fields(pos = request.pos, output = %request.output_root.display()))]
pub async fn run_crop(request: &CropRequest, ctx: &TaskContext) -> Result<CropOutcome, CropError> {
    let pos_dir = request.input_dir.join(format!("Pos{}", request.pos));
    if !tokio::fs::metadata(&pos_dir)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
    {
        return Err(CropError::PositionNotFound(pos_dir));
    }

    let bboxes = read_bbox_csv(&request.bbox_path).map_err(|source| CropError::BBoxes {
        path: request.bbox_path.clone(),
        source,
    })?;
    ctx.log(format!(
        "Loaded {} bounding boxes from {}",
        bboxes.len(),
        request.bbox_path.display()
    ));

    let frames = {
        let pos_dir = pos_dir.clone();
        tokio::task::spawn_blocking(move || discover_source_frames(&pos_dir)).await??
    };
    if frames.is_empty() {
        return Err(CropError::NoInputFiles(pos_dir));
    }
    if bboxes.is_empty() {
        return Err(CropError::NoBoundingBoxes(request.bbox_path.clone()));
    }

    let ranks = AxisRanks::new(frames.keys());
    let [n_times, n_channels, n_z] = ranks.shape();
    ctx.log(format!(
        "Discovered {} frames: T={n_times}, C={n_channels}, Z={n_z}",
        frames.len()
    ));

    // the first frame fixes the frame size and data type
    let Some(first_path) = frames.values().next() else {
        return Err(CropError::NoInputFiles(pos_dir));
    };
    let sample = decode_frame_blocking(first_path.clone()).await?;
    let (width, height, data_type) = (sample.width, sample.height, sample.pixels.data_type());
    if let Some(bbox) = bboxes.iter().find(|bbox| !bbox.fits_within(width, height)) {
        return Err(CropError::BBoxOutOfBounds {
            bbox: *bbox,
            width,
            height,
        });
    }

    let store = Arc::new(FilesystemStore::new(&request.output_root)?);
    let pos_id = position_id(request.pos);
    write_groups(&store, &pos_id).await?;

    let mut arrays = Vec::with_capacity(bboxes.len());
    let mut crops = Vec::with_capacity(bboxes.len());
    for (index, bbox) in bboxes.iter().enumerate() {
        let crop_id = crop_id(index);
        let shape = vec![
            n_times,
            n_channels,
            n_z,
            u64::from(bbox.h),
            u64::from(bbox.w),
        ];
        let chunks = vec![1, 1, 1, u64::from(bbox.h), u64::from(bbox.w)];
        let array = Array::create(
            store.clone(),
            crop_array_prefix(&pos_id, &crop_id)?,
            ArrayMetadata::new(shape.clone(), chunks, data_type),
            crop_attributes(bbox),
        )
        .await?;
        arrays.push(array);
        crops.push(CropInfo {
            pos_id: pos_id.clone(),
            crop_id,
            shape,
            bbox: Some(*bbox),
        });
    }

    let background = if request.background {
        let array = Array::create(
            store.clone(),
            background_array_prefix(&pos_id)?,
            ArrayMetadata::new(
                vec![n_times, n_channels, n_z],
                vec![1, 1, 1],
                DataType::Float64,
            ),
            background_attributes(),
        )
        .await?;
        let outside = outside_mask(width as usize, height as usize, &bboxes);
        Some((array, outside))
    } else {
        None
    };
    tracing::info!(
        pos_id = %pos_id,
        crops = arrays.len(),
        frames = frames.len(),
        background = request.background,
        "crop arrays created"
    );

    let total = frames.len();
    let mut sample = Some(sample);
    for (i, (key, path)) in frames.iter().enumerate() {
        if ctx.is_canceled() {
            ctx.log(format!("Canceled after {i} of {total} frames"));
            return Err(CropError::Canceled);
        }

        let frame = match sample.take() {
            Some(frame) => frame,
            None => decode_frame_blocking(path.clone()).await?,
        };
        if frame.width != width || frame.height != height || frame.pixels.data_type() != data_type
        {
            return Err(CropError::FrameMismatch {
                path: path.clone(),
                width: frame.width,
                height: frame.height,
                data_type: frame.pixels.data_type(),
                expected_width: width,
                expected_height: height,
                expected_data_type: data_type,
            });
        }

        let [t, c, z] = ranks.chunk_indices(key);
        futures::future::try_join_all(std::iter::zip(&arrays, &bboxes).map(|(array, bbox)| {
            let rect = frame.pixels.extract_rect(
                width as usize,
                bbox.x as usize,
                bbox.y as usize,
                bbox.w as usize,
                bbox.h as usize,
            );
            async move { array.store_chunk_array_elements(&[t, c, z, 0, 0], &rect).await }
        }))
        .await?;

        if let Some((array, outside)) = &background {
            let value = median_outside(&frame.pixels, outside);
            array.store_chunk_elements(&[t, c, z], &[value]).await?;
        }

        ctx.progress(
            (i + 1) as f64 / total as f64,
            format!("Cropping frame {}/{total}", i + 1),
        );
    }

    ctx.log(format!("Wrote {}", request.output_root.display()));
    Ok(CropOutcome {
        output_root: request.output_root.clone(),
        pos_id,
        frames: total,
        crops,
        background: request.background,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_frame_names() {
        assert_eq!(
            parse_source_frame_name("img_channel001_position140_time000000012_z003.tif"),
            Some(SourceFrameKey {
                channel: 1,
                time: 12,
                z: 3
            })
        );
        assert_eq!(parse_source_frame_name("img_channel001_position140_time1.tif"), None);
        assert_eq!(
            parse_source_frame_name("img_channel0_position1_time2_z3.tif.bak"),
            None
        );
        assert_eq!(parse_source_frame_name("metadata.txt"), None);
    }

    #[test]
    fn axis_ranks_dense() {
        let keys = [
            SourceFrameKey {
                channel: 2,
                time: 10,
                z: 0,
            },
            SourceFrameKey {
                channel: 0,
                time: 30,
                z: 0,
            },
            SourceFrameKey {
                channel: 2,
                time: 30,
                z: 0,
            },
        ];
        let ranks = AxisRanks::new(keys.iter());
        assert_eq!(ranks.shape(), [2, 2, 1]);
        assert_eq!(ranks.chunk_indices(&keys[0]), [0, 1, 0]);
        assert_eq!(ranks.chunk_indices(&keys[1]), [1, 0, 0]);
    }

    #[test]
    fn median_odd_even_empty() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&mut [5.0]), 5.0);
        assert!(median(&mut []).is_nan());
    }

    #[test]
    fn outside_mask_and_median() {
        // 4x2 frame, box covering the left 2x2
        let bboxes = [BBox {
            crop: 0,
            x: 0,
            y: 0,
            w: 2,
            h: 2,
        }];
        let outside = outside_mask(4, 2, &bboxes);
        assert_eq!(
            outside,
            [false, false, true, true, false, false, true, true]
        );
        let pixels = ArrayElements::UInt16(vec![100, 100, 1, 2, 100, 100, 3, 10]);
        assert_eq!(median_outside(&pixels, &outside), 2.5);

        let all_inside = outside_mask(
            2,
            1,
            &[BBox {
                crop: 0,
                x: 0,
                y: 0,
                w: 2,
                h: 1,
            }],
        );
        assert!(median_outside(&ArrayElements::UInt8(vec![1, 2]), &all_inside).is_nan());
    }

    #[test]
    fn crop_error_categories() {
        assert_eq!(
            CropError::PositionNotFound(PathBuf::new()).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            CropError::NoBoundingBoxes(PathBuf::new()).category(),
            ErrorCategory::InvalidRequest
        );
        assert_eq!(
            CropError::Decode {
                path: PathBuf::new(),
                reason: String::new()
            }
            .category(),
            ErrorCategory::DecodeFailure
        );
        assert_eq!(CropError::Canceled.category(), ErrorCategory::Canceled);
    }
}
