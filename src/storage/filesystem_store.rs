//! A filesystem store.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{
    Bytes, ListableStorageTraits, MaybeBytes, ReadableStorageTraits, StorageError, StoreId,
    StoreKey, StoreKeys, StoreKeysPrefixes, StorePrefix, StorePrefixes, WritableStorageTraits,
};

/// An asynchronous file system store.
///
/// Keys map directly onto relative paths under the base path, so the array `pos/140/crop/000` lives in the directory `{base_path}/pos/140/crop/000/`.
#[derive(Debug)]
pub struct FilesystemStore {
    base_path: PathBuf,
    id: StoreId,
    sort: bool,
    readonly: bool,
}

impl FilesystemStore {
    /// Create a new file system store at a given `base_path`.
    ///
    /// The store identity is the canonical base path if it exists, otherwise the path as given.
    ///
    /// # Errors
    /// Returns a [`FilesystemStoreCreateError`] if `base_path`:
    ///   - is not valid, or
    ///   - it points to an existing file rather than a directory.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, FilesystemStoreCreateError> {
        let base_path = base_path.as_ref().to_path_buf();
        if base_path.to_str().is_none() {
            return Err(FilesystemStoreCreateError::InvalidBasePath(base_path));
        }

        let readonly = if base_path.exists() {
            let md = std::fs::metadata(&base_path)?;
            if !md.is_dir() {
                return Err(FilesystemStoreCreateError::InvalidBasePath(base_path));
            }
            md.permissions().readonly()
        } else {
            false
        };

        let id = std::fs::canonicalize(&base_path)
            .unwrap_or_else(|_| base_path.clone())
            .to_string_lossy()
            .into_owned();

        Ok(Self {
            base_path,
            id: StoreId::new(id),
            sort: false,
            readonly,
        })
    }

    /// Makes the store sort directories/files when listing.
    #[must_use]
    pub const fn sorted(mut self) -> Self {
        self.sort = true;
        self
    }

    /// Returns the base path of the store.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Maps a [`StoreKey`] to a filesystem [`PathBuf`].
    #[must_use]
    pub fn key_to_fspath(&self, key: &StoreKey) -> PathBuf {
        self.base_path.join(key.as_str())
    }

    /// Maps a [`StorePrefix`] to a filesystem [`PathBuf`].
    #[must_use]
    pub fn prefix_to_fs_path(&self, prefix: &StorePrefix) -> PathBuf {
        self.base_path.join(prefix.as_str())
    }
}

#[async_trait::async_trait]
impl ReadableStorageTraits for FilesystemStore {
    fn store_id(&self) -> StoreId {
        self.id.clone()
    }

    async fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        match tokio::fs::read(self.key_to_fspath(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        match tokio::fs::metadata(self.key_to_fspath(key)).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait]
impl WritableStorageTraits for FilesystemStore {
    async fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }

        let key_path = self.key_to_fspath(key);
        if let Some(parent) = key_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(key_path, &value).await?;
        Ok(())
    }

    async fn erase(&self, key: &StoreKey) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }

        match tokio::fs::remove_file(self.key_to_fspath(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait]
impl ListableStorageTraits for FilesystemStore {
    async fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        let mut keys: StoreKeys = vec![];
        let mut prefixes: StorePrefixes = vec![];
        let mut dir = match tokio::fs::read_dir(self.prefix_to_fs_path(prefix)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreKeysPrefixes::default())
            }
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                // non UTF-8 names cannot be store keys
                continue;
            };
            if entry.file_type().await?.is_dir() {
                prefixes.push(prefix.child(name)?);
            } else {
                keys.push(prefix.key(name)?);
            }
        }
        if self.sort {
            keys.sort();
            prefixes.sort();
        }

        Ok(StoreKeysPrefixes::new(keys, prefixes))
    }
}

/// A filesystem store creation error.
#[derive(Debug, Error)]
pub enum FilesystemStoreCreateError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The path is not valid on this system.
    #[error("base path {} is not valid", .0.display())]
    InvalidBasePath(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[tokio::test]
    async fn filesystem_write_read_list() -> Result<(), Box<dyn Error>> {
        let path = tempfile::TempDir::new()?;
        let store = FilesystemStore::new(path.path())?.sorted();

        let a = StoreKey::new("a/b")?;
        let c = StoreKey::new("a/c")?;
        store.set(&a, Bytes::from_static(&[0, 1, 2])).await?;
        store.set(&c, Bytes::from_static(&[3])).await?;
        store.set(&StoreKey::new("a/d/e")?, Bytes::new()).await?;

        assert_eq!(store.get(&a).await?.as_deref(), Some(&[0u8, 1, 2][..]));
        assert_eq!(store.size_key(&c).await?, Some(1));
        assert!(store.get(&StoreKey::new("missing")?).await?.is_none());

        let listing = store.list_dir(&StorePrefix::new("a/")?).await?;
        assert_eq!(listing.keys(), &[a.clone(), c.clone()]);
        assert_eq!(listing.prefixes(), &[StorePrefix::new("a/d/")?]);

        let missing = store.list_dir(&StorePrefix::new("nothing/")?).await?;
        assert!(missing.keys().is_empty() && missing.prefixes().is_empty());

        store.erase(&a).await?;
        store.erase(&a).await?;
        assert!(store.get(&a).await?.is_none());
        Ok(())
    }

    #[test]
    fn filesystem_store_identity() -> Result<(), Box<dyn Error>> {
        let path = tempfile::TempDir::new()?;
        let a = FilesystemStore::new(path.path())?;
        let b = FilesystemStore::new(path.path().join("."))?;
        assert_eq!(a.store_id(), b.store_id());

        let other = tempfile::TempDir::new()?;
        assert_ne!(a.store_id(), FilesystemStore::new(other.path())?.store_id());
        Ok(())
    }

    #[test]
    fn filesystem_store_rejects_file() -> Result<(), Box<dyn Error>> {
        let file = tempfile::NamedTempFile::new()?;
        assert!(matches!(
            FilesystemStore::new(file.path()),
            Err(FilesystemStoreCreateError::InvalidBasePath(_))
        ));
        Ok(())
    }
}
