//! Zarr V2 arrays.
//!
//! An [`Array`] is a handle to the metadata and attributes of an array in a store.
//! Opening an array reads and validates its `.zarray` and `.zattrs` documents once, after which chunks can be read (and written, if the storage is writable) without touching metadata again.
//!
//! Chunks are stored uncompressed in C order with little endian elements.
//! A chunk is addressed by its chunk grid indices, e.g. the frame at time `t`, channel `c`, and z-slice `z` of a crop array is the chunk `[t, c, z, 0, 0]`.

mod array_errors;
mod chunk_key_encoding;
mod element;

use std::sync::Arc;

pub use array_errors::{ArrayCreateError, ArrayError};
pub use chunk_key_encoding::ChunkKeyEncoding;
pub use element::{elements_from_le_bytes, elements_to_le_bytes, ArrayElements, Element};

use crate::{
    bbox::BBox,
    metadata::{
        bbox_from_attributes, meta_key_array, read_array_metadata, read_attributes,
        write_array_metadata, write_attributes, ArrayAttributes, ArrayMetadata, ArrayShape,
        ChunkShape, DataType, MetadataError,
    },
    storage::{Bytes, ReadableStorageTraits, StoreKey, StorePrefix, WritableStorageTraits},
};

/// An array index.
pub type ArrayIndices = Vec<u64>;

/// A Zarr V2 array.
///
/// The array is generic over its storage.
/// Shared read handles use `Array<dyn ReadableListableStorageTraits>`, while extraction writes through a concrete store.
pub struct Array<TStorage: ?Sized> {
    storage: Arc<TStorage>,
    path: StorePrefix,
    metadata: ArrayMetadata,
    attributes: ArrayAttributes,
    chunk_key_encoding: ChunkKeyEncoding,
}

impl<TStorage: ?Sized> std::fmt::Debug for Array<TStorage> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("path", &self.path)
            .field("metadata", &self.metadata)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

impl<TStorage: ?Sized> Array<TStorage> {
    /// Create an array in `storage` at `path` with `metadata` and `attributes`.
    ///
    /// This does not write to the store, use [`store_metadata`](Array::store_metadata) to write the metadata documents.
    ///
    /// # Errors
    /// Returns [`ArrayCreateError`] if the metadata is not supported.
    pub fn new_with_metadata(
        storage: Arc<TStorage>,
        path: StorePrefix,
        metadata: ArrayMetadata,
        attributes: ArrayAttributes,
    ) -> Result<Self, ArrayCreateError> {
        if let Err(err) = metadata.validate() {
            let key = meta_key_array(&path).map_err(MetadataError::from)?;
            return Err(MetadataError::Malformed(key, err).into());
        }
        let chunk_key_encoding = ChunkKeyEncoding::new(metadata.dimension_separator);
        Ok(Self {
            storage,
            path,
            metadata,
            attributes,
            chunk_key_encoding,
        })
    }

    /// Get the underlying storage backing the array.
    #[must_use]
    pub fn storage(&self) -> Arc<TStorage> {
        self.storage.clone()
    }

    /// Get the path of the array.
    #[must_use]
    pub fn path(&self) -> &StorePrefix {
        &self.path
    }

    /// Get the array metadata.
    #[must_use]
    pub fn metadata(&self) -> &ArrayMetadata {
        &self.metadata
    }

    /// Get the array shape.
    #[must_use]
    pub fn shape(&self) -> &ArrayShape {
        &self.metadata.shape
    }

    /// Get the chunk shape.
    #[must_use]
    pub fn chunk_shape(&self) -> &ChunkShape {
        &self.metadata.chunks
    }

    /// Get the data type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.metadata.dtype
    }

    /// Get the array attributes.
    #[must_use]
    pub fn attributes(&self) -> &ArrayAttributes {
        &self.attributes
    }

    /// Get the source bounding box recorded in the attributes of a crop array.
    #[must_use]
    pub fn bbox(&self) -> Option<BBox> {
        bbox_from_attributes(&self.attributes)
    }

    /// Return the shape of the chunk grid (i.e., the number of chunks along each dimension).
    #[must_use]
    pub fn chunk_grid_shape(&self) -> Vec<u64> {
        self.metadata.chunk_grid_shape()
    }

    /// Return the key of the chunk at `chunk_indices`.
    ///
    /// # Errors
    /// Returns [`ArrayError::InvalidChunkGridIndices`] if `chunk_indices` are outside the chunk grid.
    pub fn chunk_key(&self, chunk_indices: &[u64]) -> Result<StoreKey, ArrayError> {
        let chunk_grid_shape = self.chunk_grid_shape();
        if chunk_indices.len() != chunk_grid_shape.len()
            || std::iter::zip(chunk_indices, &chunk_grid_shape).any(|(&i, &n)| i >= n)
        {
            return Err(ArrayError::InvalidChunkGridIndices(
                chunk_indices.to_vec(),
                chunk_grid_shape,
            ));
        }
        Ok(self.chunk_key_encoding.encode(&self.path, chunk_indices)?)
    }

    fn check_element_type(&self, data_type: DataType) -> Result<(), ArrayError> {
        if self.data_type() == data_type {
            Ok(())
        } else {
            Err(ArrayError::IncompatibleElementType(
                self.data_type(),
                data_type,
            ))
        }
    }
}

impl<TStorage: ?Sized + ReadableStorageTraits> Array<TStorage> {
    /// Open an existing array in `storage` at `path`.
    ///
    /// # Errors
    /// Returns [`ArrayCreateError`] if the metadata is missing, malformed, or not supported.
    pub async fn open(storage: Arc<TStorage>, path: &StorePrefix) -> Result<Self, ArrayCreateError> {
        let metadata = read_array_metadata(&*storage, path).await?;
        let attributes = read_attributes(&*storage, path).await?;
        Self::new_with_metadata(storage, path.clone(), metadata, attributes)
    }

    /// Read the encoded bytes of the chunk at `chunk_indices`.
    ///
    /// # Errors
    /// Returns an [`ArrayError`] if the chunk indices are invalid, the chunk is missing or has an unexpected size, or there is an underlying store error.
    pub async fn retrieve_chunk(&self, chunk_indices: &[u64]) -> Result<Bytes, ArrayError> {
        let key = self.chunk_key(chunk_indices)?;
        let Some(bytes) = self.storage.get(&key).await? else {
            return Err(ArrayError::MissingChunk(key));
        };
        let expected = self.metadata.chunk_size_bytes();
        if bytes.len() as u64 != expected {
            return Err(ArrayError::UnexpectedChunkSize(
                key,
                bytes.len() as u64,
                expected,
            ));
        }
        Ok(bytes)
    }

    /// Read the chunk at `chunk_indices` into a vector of its elements.
    ///
    /// # Errors
    /// Returns [`ArrayError::IncompatibleElementType`] if `T` does not match the array data type, or any error of [`retrieve_chunk`](Array::retrieve_chunk).
    pub async fn retrieve_chunk_elements<T: Element>(
        &self,
        chunk_indices: &[u64],
    ) -> Result<Vec<T>, ArrayError> {
        self.check_element_type(T::DATA_TYPE)?;
        let bytes = self.retrieve_chunk(chunk_indices).await?;
        elements_from_le_bytes(&bytes)
    }

    /// Read the chunk at `chunk_indices` into [`ArrayElements`] of the array data type.
    ///
    /// # Errors
    /// See [`retrieve_chunk`](Array::retrieve_chunk).
    pub async fn retrieve_chunk_array_elements(
        &self,
        chunk_indices: &[u64],
    ) -> Result<ArrayElements, ArrayError> {
        let bytes = self.retrieve_chunk(chunk_indices).await?;
        ArrayElements::from_le_bytes(self.data_type(), &bytes)
    }
}

impl<TStorage: ?Sized + WritableStorageTraits> Array<TStorage> {
    /// Create a new array in `storage` at `path` and write its metadata documents.
    ///
    /// # Errors
    /// Returns [`ArrayCreateError`] if the metadata is not supported or cannot be stored.
    pub async fn create(
        storage: Arc<TStorage>,
        path: StorePrefix,
        metadata: ArrayMetadata,
        attributes: ArrayAttributes,
    ) -> Result<Self, ArrayCreateError> {
        let array = Self::new_with_metadata(storage, path, metadata, attributes)?;
        array.store_metadata().await?;
        Ok(array)
    }

    /// Write the `.zarray` document, and the `.zattrs` document if there are attributes.
    ///
    /// # Errors
    /// Returns a [`MetadataError`] if the documents cannot be stored.
    pub async fn store_metadata(&self) -> Result<(), MetadataError> {
        write_array_metadata(&*self.storage, &self.path, &self.metadata).await?;
        if !self.attributes.is_empty() {
            write_attributes(&*self.storage, &self.path, &self.attributes).await?;
        }
        Ok(())
    }

    /// Write the encoded bytes of the chunk at `chunk_indices`.
    ///
    /// # Errors
    /// Returns an [`ArrayError`] if the chunk indices are invalid, `bytes` has an unexpected size, or there is an underlying store error.
    pub async fn store_chunk(&self, chunk_indices: &[u64], bytes: Bytes) -> Result<(), ArrayError> {
        let key = self.chunk_key(chunk_indices)?;
        let expected = self.metadata.chunk_size_bytes();
        if bytes.len() as u64 != expected {
            return Err(ArrayError::UnexpectedChunkSize(
                key,
                bytes.len() as u64,
                expected,
            ));
        }
        self.storage.set(&key, bytes).await?;
        Ok(())
    }

    /// Write the chunk at `chunk_indices` from a slice of its elements.
    ///
    /// # Errors
    /// Returns an [`ArrayError`] if `T` does not match the array data type, the number of elements does not match the chunk shape, or any error of [`store_chunk`](Array::store_chunk).
    pub async fn store_chunk_elements<T: Element>(
        &self,
        chunk_indices: &[u64],
        elements: &[T],
    ) -> Result<(), ArrayError> {
        self.check_element_type(T::DATA_TYPE)?;
        self.check_element_count(elements.len())?;
        self.store_chunk(chunk_indices, Bytes::from(elements_to_le_bytes(elements)))
            .await
    }

    /// Write the chunk at `chunk_indices` from [`ArrayElements`].
    ///
    /// # Errors
    /// See [`store_chunk_elements`](Array::store_chunk_elements).
    pub async fn store_chunk_array_elements(
        &self,
        chunk_indices: &[u64],
        elements: &ArrayElements,
    ) -> Result<(), ArrayError> {
        self.check_element_type(elements.data_type())?;
        self.check_element_count(elements.len())?;
        self.store_chunk(chunk_indices, Bytes::from(elements.to_le_bytes()))
            .await
    }

    fn check_element_count(&self, count: usize) -> Result<(), ArrayError> {
        let expected = self.metadata.chunk_num_elements();
        if count as u64 == expected {
            Ok(())
        } else {
            Err(ArrayError::InvalidElementCount(count, expected))
        }
    }
}
