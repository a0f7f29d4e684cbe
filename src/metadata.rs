//! Zarr V2 metadata encoding and decoding.
//!
//! Every array in the crop store has a `.zarray` descriptor ([`ArrayMetadata`]) and an optional `.zattrs` document ([`ArrayAttributes`]).
//! Groups along the `pos/{posId}/crop/` hierarchy carry a `.zgroup` document so the store is readable by other Zarr V2 implementations.
//!
//! The descriptor is the cross-component contract of the crate: the shape written by crop extraction is exactly what discovery reports and what the frame loader addresses.

mod array_metadata;
mod attributes;
mod data_type;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{
    Bytes, ReadableStorageTraits, StorageError, StoreKey, StoreKeyError, StorePrefix,
    WritableStorageTraits,
};

pub use array_metadata::{ArrayMetadata, ArrayOrder, ArrayShape, ChunkShape, DimensionSeparator};
pub use attributes::{
    axis_names_from_attributes, background_attributes, bbox_from_attributes, crop_attributes,
    ArrayAttributes, AXIS_NAMES_ATTRIBUTE, BBOX_ATTRIBUTE,
};
pub use data_type::{DataType, UnsupportedDataTypeError};

/// The name of the array metadata document.
pub const ARRAY_METADATA_KEY: &str = ".zarray";

/// The name of the attributes document.
pub const ATTRIBUTES_KEY: &str = ".zattrs";

/// The name of the group metadata document.
pub const GROUP_METADATA_KEY: &str = ".zgroup";

/// Zarr V2 group metadata (the `.zgroup` document).
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct GroupMetadata {
    /// The version of the storage specification. Must be `2`.
    pub zarr_format: monostate::MustBe!(2u64),
}

impl Default for GroupMetadata {
    fn default() -> Self {
        Self {
            zarr_format: monostate::MustBe!(2u64),
        }
    }
}

/// A metadata error.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The metadata document does not exist.
    #[error("metadata {0} not found")]
    NotFound(StoreKey),
    /// The metadata document could not be parsed or is not supported.
    #[error("malformed metadata {0}: {1}")]
    Malformed(StoreKey, String),
    /// An invalid metadata key.
    #[error(transparent)]
    InvalidKey(#[from] StoreKeyError),
    /// A storage error.
    #[error(transparent)]
    StorageError(#[from] StorageError),
}

/// Returns the key of the `.zarray` document of the array at `array_prefix`.
///
/// # Errors
/// Returns [`StoreKeyError`] if the key is invalid.
pub fn meta_key_array(array_prefix: &StorePrefix) -> Result<StoreKey, StoreKeyError> {
    array_prefix.key(ARRAY_METADATA_KEY)
}

/// Returns the key of the `.zattrs` document of the node at `prefix`.
///
/// # Errors
/// Returns [`StoreKeyError`] if the key is invalid.
pub fn meta_key_attributes(prefix: &StorePrefix) -> Result<StoreKey, StoreKeyError> {
    prefix.key(ATTRIBUTES_KEY)
}

/// Returns the key of the `.zgroup` document of the group at `group_prefix`.
///
/// # Errors
/// Returns [`StoreKeyError`] if the key is invalid.
pub fn meta_key_group(group_prefix: &StorePrefix) -> Result<StoreKey, StoreKeyError> {
    group_prefix.key(GROUP_METADATA_KEY)
}

/// Write the `.zarray` document of the array at `array_prefix`.
///
/// # Errors
/// Returns [`MetadataError::Malformed`] if `metadata` fails [`ArrayMetadata::validate`], or a storage error.
pub async fn write_array_metadata<TStorage: ?Sized + WritableStorageTraits>(
    storage: &TStorage,
    array_prefix: &StorePrefix,
    metadata: &ArrayMetadata,
) -> Result<(), MetadataError> {
    let key = meta_key_array(array_prefix)?;
    metadata
        .validate()
        .map_err(|err| MetadataError::Malformed(key.clone(), err))?;
    let json = serde_json::to_vec_pretty(metadata)
        .map_err(|err| MetadataError::Malformed(key.clone(), err.to_string()))?;
    storage.set(&key, Bytes::from(json)).await?;
    Ok(())
}

/// Read the `.zarray` document of the array at `array_prefix`.
///
/// # Errors
/// Returns [`MetadataError::NotFound`] if the document is missing, [`MetadataError::Malformed`] if it cannot be parsed or describes an unsupported array, or a storage error.
pub async fn read_array_metadata<TStorage: ?Sized + ReadableStorageTraits>(
    storage: &TStorage,
    array_prefix: &StorePrefix,
) -> Result<ArrayMetadata, MetadataError> {
    let key = meta_key_array(array_prefix)?;
    let Some(bytes) = storage.get(&key).await? else {
        return Err(MetadataError::NotFound(key));
    };
    let metadata: ArrayMetadata = serde_json::from_slice(&bytes)
        .map_err(|err| MetadataError::Malformed(key.clone(), err.to_string()))?;
    metadata
        .validate()
        .map_err(|err| MetadataError::Malformed(key, err))?;
    Ok(metadata)
}

/// Write the `.zattrs` document of the node at `prefix`.
///
/// # Errors
/// Returns a [`MetadataError`] if the attributes cannot be serialised or stored.
pub async fn write_attributes<TStorage: ?Sized + WritableStorageTraits>(
    storage: &TStorage,
    prefix: &StorePrefix,
    attributes: &ArrayAttributes,
) -> Result<(), MetadataError> {
    let key = meta_key_attributes(prefix)?;
    let json = serde_json::to_vec_pretty(attributes)
        .map_err(|err| MetadataError::Malformed(key.clone(), err.to_string()))?;
    storage.set(&key, Bytes::from(json)).await?;
    Ok(())
}

/// Read the `.zattrs` document of the node at `prefix`.
///
/// A missing document reads as empty attributes.
///
/// # Errors
/// Returns [`MetadataError::Malformed`] if the document is not a JSON object, or a storage error.
pub async fn read_attributes<TStorage: ?Sized + ReadableStorageTraits>(
    storage: &TStorage,
    prefix: &StorePrefix,
) -> Result<ArrayAttributes, MetadataError> {
    let key = meta_key_attributes(prefix)?;
    match storage.get(&key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|err| MetadataError::Malformed(key, err.to_string())),
        None => Ok(ArrayAttributes::new()),
    }
}

/// Write a `.zgroup` document at `group_prefix`.
///
/// # Errors
/// Returns a [`MetadataError`] if the document cannot be stored.
pub async fn write_group_metadata<TStorage: ?Sized + WritableStorageTraits>(
    storage: &TStorage,
    group_prefix: &StorePrefix,
) -> Result<(), MetadataError> {
    let key = meta_key_group(group_prefix)?;
    let json = serde_json::to_vec_pretty(&GroupMetadata::default())
        .map_err(|err| MetadataError::Malformed(key.clone(), err.to_string()))?;
    storage.set(&key, Bytes::from(json)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemStore;

    #[tokio::test]
    async fn array_metadata_round_trip() {
        let path = tempfile::TempDir::new().unwrap();
        let store = FilesystemStore::new(path.path()).unwrap();
        let prefix = StorePrefix::new("pos/140/crop/000/").unwrap();

        let metadata =
            ArrayMetadata::new(vec![5, 2, 1, 8, 6], vec![1, 1, 1, 8, 6], DataType::UInt16);
        write_array_metadata(&store, &prefix, &metadata).await.unwrap();
        assert!(path.path().join("pos/140/crop/000/.zarray").is_file());
        assert_eq!(read_array_metadata(&store, &prefix).await.unwrap(), metadata);
    }

    #[tokio::test]
    async fn array_metadata_not_found_and_malformed() {
        let path = tempfile::TempDir::new().unwrap();
        let store = FilesystemStore::new(path.path()).unwrap();
        let prefix = StorePrefix::new("a/").unwrap();

        assert!(matches!(
            read_array_metadata(&store, &prefix).await,
            Err(MetadataError::NotFound(_))
        ));

        let key = meta_key_array(&prefix).unwrap();
        store.set(&key, Bytes::from_static(b"{not json")).await.unwrap();
        assert!(matches!(
            read_array_metadata(&store, &prefix).await,
            Err(MetadataError::Malformed(_, _))
        ));

        let compressed = br#"{"zarr_format":2,"shape":[4],"chunks":[4],"dtype":"|u1","compressor":{"id":"zlib"},"fill_value":null,"order":"C"}"#;
        store.set(&key, Bytes::from_static(compressed)).await.unwrap();
        assert!(matches!(
            read_array_metadata(&store, &prefix).await,
            Err(MetadataError::Malformed(_, _))
        ));
    }

    #[tokio::test]
    async fn attributes_round_trip() {
        let path = tempfile::TempDir::new().unwrap();
        let store = FilesystemStore::new(path.path()).unwrap();
        let prefix = StorePrefix::new("pos/001/background/").unwrap();

        assert!(read_attributes(&store, &prefix).await.unwrap().is_empty());
        write_attributes(&store, &prefix, &background_attributes())
            .await
            .unwrap();
        assert_eq!(
            read_attributes(&store, &prefix).await.unwrap(),
            background_attributes()
        );

        write_group_metadata(&store, &StorePrefix::root()).await.unwrap();
        let zgroup = std::fs::read_to_string(path.path().join(".zgroup")).unwrap();
        let group: GroupMetadata = serde_json::from_str(&zgroup).unwrap();
        assert_eq!(group, GroupMetadata::default());
    }
}
