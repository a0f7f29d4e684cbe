//! Pattern site bounding boxes.
//!
//! Bounding boxes are read from a CSV with the header `crop,x,y,w,h` (one row per pattern site).
//! Columns are matched by header name, so column order and extra columns do not matter.

use std::{io::Read, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The bounding box of one pattern site in source frame pixel coordinates.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BBox {
    /// The pattern site index.
    pub crop: u32,
    /// The left edge.
    pub x: u32,
    /// The top edge.
    pub y: u32,
    /// The width.
    pub w: u32,
    /// The height.
    pub h: u32,
}

impl BBox {
    /// Returns true if the box lies entirely within a `width` x `height` frame.
    #[must_use]
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        u64::from(self.x) + u64::from(self.w) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.h) <= u64::from(height)
    }
}

/// A bounding box CSV error.
#[derive(Debug, Error)]
pub enum BBoxError {
    /// An IO error opening the CSV.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// A CSV parse error.
    #[error(transparent)]
    CsvError(#[from] csv::Error),
    /// A bounding box with a zero width or height.
    #[error("bounding box for crop {0} is empty")]
    EmptyBox(u32),
}

/// Read bounding boxes from CSV data.
///
/// # Errors
/// Returns a [`BBoxError`] if the CSV is malformed, is missing a required column, or contains an empty box.
pub fn read_bboxes<R: Read>(reader: R) -> Result<Vec<BBox>, BBoxError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut bboxes = Vec::new();
    for record in reader.deserialize() {
        let bbox: BBox = record?;
        if bbox.w == 0 || bbox.h == 0 {
            return Err(BBoxError::EmptyBox(bbox.crop));
        }
        bboxes.push(bbox);
    }
    Ok(bboxes)
}

/// Read bounding boxes from a CSV file.
///
/// # Errors
/// Returns a [`BBoxError`] if the file cannot be opened or read by [`read_bboxes`].
pub fn read_bbox_csv(path: &Path) -> Result<Vec<BBox>, BBoxError> {
    read_bboxes(std::fs::File::open(path)?)
}
