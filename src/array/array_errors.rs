use thiserror::Error;

use crate::{
    metadata::{DataType, MetadataError},
    storage::{StorageError, StoreKey, StoreKeyError, StorePrefixError},
};

use super::ArrayIndices;

/// An array creation error.
#[derive(Debug, Error)]
pub enum ArrayCreateError {
    /// An invalid array path.
    #[error(transparent)]
    InvalidPath(#[from] StorePrefixError),
    /// A missing, malformed, or unsupported metadata document.
    #[error(transparent)]
    MetadataError(#[from] MetadataError),
}

impl ArrayCreateError {
    /// Returns true if the array metadata does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::MetadataError(MetadataError::NotFound(_)))
    }
}

/// Array errors.
#[derive(Debug, Error)]
pub enum ArrayError {
    /// A store error.
    #[error(transparent)]
    StorageError(#[from] StorageError),
    /// An invalid chunk key.
    #[error(transparent)]
    InvalidKey(#[from] StoreKeyError),
    /// A metadata error.
    #[error(transparent)]
    MetadataError(#[from] MetadataError),
    /// Invalid chunk grid indices.
    #[error("chunk indices {0:?} are not valid for chunk grid shape {1:?}")]
    InvalidChunkGridIndices(ArrayIndices, Vec<u64>),
    /// A chunk that has not been written.
    #[error("chunk {0} does not exist")]
    MissingChunk(StoreKey),
    /// An unexpected encoded chunk size.
    #[error("chunk {0} has {1} bytes, expected {2}")]
    UnexpectedChunkSize(StoreKey, u64, u64),
    /// An unexpected number of elements.
    #[error("got {0} elements, expected {1}")]
    InvalidElementCount(usize, u64),
    /// The element type does not match the array data type.
    #[error("array data type {0} is incompatible with element type {1}")]
    IncompatibleElementType(DataType, DataType),
}
