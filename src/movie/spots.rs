//! Spot overlays.
//!
//! Spots are read from a CSV with a header including `t,crop,y,x`. Extra columns are ignored.

use std::{collections::HashMap, io::Read, path::Path};

use serde::Deserialize;
use thiserror::Error;

/// A spot centre in crop pixel coordinates.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Spot {
    /// The row.
    pub y: f64,
    /// The column.
    pub x: f64,
}

/// Spots keyed by time index.
pub type SpotsByTime = HashMap<u64, Vec<Spot>>;

#[derive(Deserialize)]
struct SpotRecord {
    t: u64,
    crop: String,
    y: f64,
    x: f64,
}

/// A spots CSV error.
#[derive(Debug, Error)]
pub enum SpotsError {
    /// An IO error opening the CSV.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// A CSV parse error.
    #[error(transparent)]
    CsvError(#[from] csv::Error),
}

/// Returns true if the `crop` column of a spot row refers to `crop_id`.
///
/// Crop ids match if they are equal as strings, or as integers so that `7` matches `007`.
#[must_use]
pub fn crop_matches(crop: &str, crop_id: &str) -> bool {
    let (crop, crop_id) = (crop.trim(), crop_id.trim());
    crop == crop_id
        || matches!(
            (crop.parse::<u64>(), crop_id.parse::<u64>()),
            (Ok(a), Ok(b)) if a == b
        )
}

/// Read the spots of crop `crop_id` from CSV data.
///
/// # Errors
/// Returns a [`SpotsError`] if the CSV is malformed or is missing a required column.
pub fn read_spots<R: Read>(reader: R, crop_id: &str) -> Result<SpotsByTime, SpotsError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut spots = SpotsByTime::new();
    for record in reader.deserialize() {
        let SpotRecord { t, crop, y, x } = record?;
        if crop_matches(&crop, crop_id) {
            spots.entry(t).or_default().push(Spot { y, x });
        }
    }
    Ok(spots)
}

/// Read the spots of crop `crop_id` from a CSV file.
///
/// # Errors
/// Returns a [`SpotsError`] if the file cannot be opened or read by [`read_spots`].
pub fn read_spots_csv(path: &Path, crop_id: &str) -> Result<SpotsByTime, SpotsError> {
    read_spots(std::fs::File::open(path)?, crop_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spots_filtered_by_crop() {
        let csv = "t,crop,spot,y,x\n0,000,0,1.5,2.5\n0,1,0,3,4\n2,0,1,5,6\n0,0,2,7,8\n";
        let spots = read_spots(csv.as_bytes(), "000").unwrap();
        assert_eq!(spots.len(), 2);
        assert_eq!(
            spots[&0],
            [Spot { y: 1.5, x: 2.5 }, Spot { y: 7.0, x: 8.0 }]
        );
        assert_eq!(spots[&2], [Spot { y: 5.0, x: 6.0 }]);
        assert!(read_spots(csv.as_bytes(), "abc").unwrap().is_empty());
    }

    #[test]
    fn spots_crop_matching() {
        assert!(crop_matches("007", "7"));
        assert!(crop_matches("a1", "a1"));
        assert!(!crop_matches("a1", "a01"));
        assert!(!crop_matches("1", "2"));
    }

    #[test]
    fn spots_errors() {
        assert!(read_spots("t,crop,y\n0,0,1\n".as_bytes(), "0").is_err());
        assert!(read_spots("t,crop,y,x\nzero,0,1,2\n".as_bytes(), "0").is_err());
        assert!(read_spots_csv(Path::new("/nonexistent/spots.csv"), "0").is_err());
    }
}
