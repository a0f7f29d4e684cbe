use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::DataType;

/// An array shape. Dimensions are ordered `(t, c, z, y, x)` for crop arrays.
pub type ArrayShape = Vec<u64>;

/// A chunk shape.
pub type ChunkShape = Vec<u64>;

/// Zarr V2 array metadata (the `.zarray` document).
///
/// An example document for a `uint16` crop array with single-frame chunks:
/// ```json
/// {
///     "zarr_format": 2,
///     "shape": [48, 2, 1, 64, 80],
///     "chunks": [1, 1, 1, 64, 80],
///     "dtype": "<u2",
///     "compressor": null,
///     "fill_value": null,
///     "order": "C",
///     "filters": null,
///     "dimension_separator": "."
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Display)]
#[display("{}", serde_json::to_string(self).unwrap_or_default())]
pub struct ArrayMetadata {
    /// The version of the storage specification. Must be `2`.
    pub zarr_format: monostate::MustBe!(2u64),
    /// The length of each dimension of the array.
    pub shape: ArrayShape,
    /// The length of each dimension of a chunk.
    pub chunks: ChunkShape,
    /// The data type.
    pub dtype: DataType,
    /// The compressor. Compressed arrays are not supported, so this must be `null`.
    pub compressor: Option<serde_json::Value>,
    /// The fill value for uninitialised chunks.
    pub fill_value: Option<serde_json::Value>,
    /// The memory layout of each chunk.
    pub order: ArrayOrder,
    /// Filters. Must be `null` or empty.
    #[serde(default)]
    pub filters: Option<Vec<serde_json::Value>>,
    /// The separator between chunk indices in a chunk key.
    #[serde(default = "dimension_separator_default")]
    pub dimension_separator: DimensionSeparator,
}

/// The memory layout of a chunk.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Debug)]
pub enum ArrayOrder {
    /// Row-major order. The last dimension varies fastest.
    C,
    /// Column-major order. The first dimension varies fastest.
    F,
}

/// The separator placed between the indices of a chunk key.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum DimensionSeparator {
    /// `.`
    #[serde(rename = ".")]
    #[display(".")]
    Dot,
    /// `/`
    #[serde(rename = "/")]
    #[display("/")]
    Slash,
}

const fn dimension_separator_default() -> DimensionSeparator {
    DimensionSeparator::Dot
}

impl ArrayMetadata {
    /// Create uncompressed, C-ordered array metadata with a `null` fill value and `.` separated chunk keys.
    #[must_use]
    pub fn new(shape: ArrayShape, chunks: ChunkShape, dtype: DataType) -> Self {
        Self {
            zarr_format: monostate::MustBe!(2u64),
            shape,
            chunks,
            dtype,
            compressor: None,
            fill_value: None,
            order: ArrayOrder::C,
            filters: None,
            dimension_separator: DimensionSeparator::Dot,
        }
    }

    /// Check that the metadata describes an array this crate can read and write.
    ///
    /// # Errors
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.shape.len() != self.chunks.len() {
            return Err(format!(
                "chunk dimensionality {} does not match array dimensionality {}",
                self.chunks.len(),
                self.shape.len()
            ));
        }
        if self.chunks.iter().any(|&c| c == 0) {
            return Err(format!("chunk shape {:?} has a zero dimension", self.chunks));
        }
        if self.compressor.is_some() {
            return Err("compressed arrays are not supported".to_string());
        }
        if self.filters.as_ref().is_some_and(|f| !f.is_empty()) {
            return Err("array filters are not supported".to_string());
        }
        if self.order != ArrayOrder::C {
            return Err("only C order arrays are supported".to_string());
        }
        Ok(())
    }

    /// The number of elements in one chunk.
    #[must_use]
    pub fn chunk_num_elements(&self) -> u64 {
        self.chunks.iter().product()
    }

    /// The size in bytes of one encoded chunk.
    #[must_use]
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_num_elements() * self.dtype.size() as u64
    }

    /// The number of chunks along each dimension.
    #[must_use]
    pub fn chunk_grid_shape(&self) -> Vec<u64> {
        std::iter::zip(&self.shape, &self.chunks)
            .map(|(&s, &c)| s.div_ceil(c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_metadata_json() {
        let metadata = ArrayMetadata::new(vec![3, 2, 1, 4, 5], vec![1, 1, 1, 4, 5], DataType::UInt16);
        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(
            json,
            r#"{"zarr_format":2,"shape":[3,2,1,4,5],"chunks":[1,1,1,4,5],"dtype":"<u2","compressor":null,"fill_value":null,"order":"C","filters":null,"dimension_separator":"."}"#
        );
        let decoded: ArrayMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(metadata.to_string(), json);
    }

    #[test]
    fn array_metadata_defaults() {
        // written by other zarr v2 writers without optional fields
        let json = r#"{"zarr_format":2,"shape":[10],"chunks":[4],"dtype":"|u1","compressor":null,"fill_value":0,"order":"C"}"#;
        let metadata: ArrayMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.dimension_separator, DimensionSeparator::Dot);
        assert_eq!(metadata.chunk_grid_shape(), vec![3]);
        assert_eq!(metadata.chunk_size_bytes(), 4);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn array_metadata_rejects() {
        let json = r#"{"zarr_format":3,"shape":[10],"chunks":[4],"dtype":"|u1","compressor":null,"fill_value":0,"order":"C"}"#;
        assert!(serde_json::from_str::<ArrayMetadata>(json).is_err());

        let mut metadata = ArrayMetadata::new(vec![10, 10], vec![5], DataType::UInt8);
        assert!(metadata.validate().is_err());
        metadata.chunks = vec![5, 5];
        assert!(metadata.validate().is_ok());
        metadata.compressor = Some(serde_json::json!({"id": "blosc"}));
        assert!(metadata.validate().is_err());
        metadata.compressor = None;
        metadata.order = ArrayOrder::F;
        assert!(metadata.validate().is_err());
    }
}
