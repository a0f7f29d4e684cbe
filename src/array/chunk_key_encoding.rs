//! The Zarr V2 chunk key encoding.

use itertools::Itertools;

use crate::{
    metadata::DimensionSeparator,
    storage::{StoreKey, StoreKeyError, StorePrefix},
};

/// A Zarr V2 chunk key encoding.
///
/// The key of a chunk is formed by joining the ASCII decimal chunk grid indices with the separator, relative to the array prefix.
/// The chunk `(3, 1, 0, 0, 0)` of a crop array is stored at `{array}/3.1.0.0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkKeyEncoding {
    separator: DimensionSeparator,
}

impl ChunkKeyEncoding {
    /// Create a new chunk key encoding with separator `separator`.
    #[must_use]
    pub fn new(separator: DimensionSeparator) -> Self {
        Self { separator }
    }

    /// Returns the separator.
    #[must_use]
    pub fn separator(&self) -> DimensionSeparator {
        self.separator
    }

    /// Encode chunk grid indices into a key under `array_prefix`.
    ///
    /// # Errors
    /// Returns [`StoreKeyError`] if the resulting key is invalid, which happens for zero dimensional indices.
    pub fn encode(
        &self,
        array_prefix: &StorePrefix,
        chunk_grid_indices: &[u64],
    ) -> Result<StoreKey, StoreKeyError> {
        let separator = self.separator.to_string();
        StoreKey::new(format!(
            "{}{}",
            array_prefix.as_str(),
            chunk_grid_indices.iter().join(&separator)
        ))
    }
}

impl Default for ChunkKeyEncoding {
    fn default() -> Self {
        Self::new(DimensionSeparator::Dot)
    }
}
