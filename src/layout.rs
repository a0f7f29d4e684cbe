//! The crop store hierarchy.
//!
//! ```text
//! {root}/
//!   .zgroup
//!   pos/
//!     .zgroup
//!     {posId}/
//!       .zgroup
//!       crop/
//!         .zgroup
//!         {cropId}/          uint8 or uint16 array (t, c, z, y, x)
//!       background/          float64 array (t, c, z), optional
//! ```
//!
//! Identifiers are directory names. Extraction names positions and crops with zero padded decimal indices (`140`, `000`), but any valid directory name is accepted when reading.

use crate::storage::{StorePrefix, StorePrefixError};

/// The group holding all positions.
pub const POSITIONS_GROUP: &str = "pos";

/// The group holding the crops of a position.
pub const CROPS_GROUP: &str = "crop";

/// The per-frame background array of a position.
pub const BACKGROUND_ARRAY: &str = "background";

/// The prefix of the positions group, `pos/`.
#[must_use]
pub fn positions_prefix() -> StorePrefix {
    StorePrefix::new_unchecked(format!("{POSITIONS_GROUP}/"))
}

/// The prefix of a position group, `pos/{pos_id}/`.
///
/// # Errors
/// Returns [`StorePrefixError`] if `pos_id` is empty, `.`, `..`, or contains a `/`.
pub fn position_prefix(pos_id: &str) -> Result<StorePrefix, StorePrefixError> {
    positions_prefix().child(pos_id)
}

/// The prefix of the crops group of a position, `pos/{pos_id}/crop/`.
///
/// # Errors
/// Returns [`StorePrefixError`] if `pos_id` is empty, `.`, `..`, or contains a `/`.
pub fn crops_prefix(pos_id: &str) -> Result<StorePrefix, StorePrefixError> {
    position_prefix(pos_id)?.child(CROPS_GROUP)
}

/// The prefix of a crop array, `pos/{pos_id}/crop/{crop_id}/`.
///
/// # Errors
/// Returns [`StorePrefixError`] if either identifier is empty, `.`, `..`, or contains a `/`.
pub fn crop_array_prefix(pos_id: &str, crop_id: &str) -> Result<StorePrefix, StorePrefixError> {
    crops_prefix(pos_id)?.child(crop_id)
}

/// The prefix of the background array of a position, `pos/{pos_id}/background/`.
///
/// # Errors
/// Returns [`StorePrefixError`] if `pos_id` is empty, `.`, `..`, or contains a `/`.
pub fn background_array_prefix(pos_id: &str) -> Result<StorePrefix, StorePrefixError> {
    position_prefix(pos_id)?.child(BACKGROUND_ARRAY)
}

/// The identifier extraction gives to microscope position `pos`.
#[must_use]
pub fn position_id(pos: u32) -> String {
    format!("{pos:03}")
}

/// The identifier extraction gives to the crop cut from the bounding box at `index`.
#[must_use]
pub fn crop_id(index: usize) -> String {
    format!("{index:03}")
}
