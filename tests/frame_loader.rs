use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use mupattern::{
    array::{Array, ArrayElements},
    cache::ArrayHandleCache,
    frame::{FrameLoadError, FrameLoader},
    layout::crop_array_prefix,
    metadata::{ArrayAttributes, ArrayMetadata, DataType},
    storage::{
        FilesystemStore, ListableStorageTraits, MaybeBytes, ReadableListableStorage,
        ReadableStorageTraits, StorageError, StoreId, StoreKey, StoreKeysPrefixes, StorePrefix,
    },
};

/// A store that fails the first `failures` chunk reads.
struct FlakyStore {
    inner: FilesystemStore,
    failures: AtomicUsize,
}

#[async_trait::async_trait]
impl ReadableStorageTraits for FlakyStore {
    fn store_id(&self) -> StoreId {
        self.inner.store_id()
    }

    async fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        let is_chunk = !key.name().starts_with('.');
        if is_chunk
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StorageError::Other("transient read failure".to_string()));
        }
        self.inner.get(key).await
    }

    async fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        self.inner.size_key(key).await
    }
}

#[async_trait::async_trait]
impl ListableStorageTraits for FlakyStore {
    async fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        self.inner.list_dir(prefix).await
    }
}

async fn flaky_store(path: &std::path::Path, failures: usize) -> ReadableListableStorage {
    let store = Arc::new(FilesystemStore::new(path).unwrap());
    let array = Array::create(
        store,
        crop_array_prefix("000", "000").unwrap(),
        ArrayMetadata::new(vec![1, 1, 1, 2, 2], vec![1, 1, 1, 2, 2], DataType::UInt8),
        ArrayAttributes::new(),
    )
    .await
    .unwrap();
    array
        .store_chunk_elements::<u8>(&[0, 0, 0, 0, 0], &[1, 2, 3, 4])
        .await
        .unwrap();
    Arc::new(FlakyStore {
        inner: FilesystemStore::new(path).unwrap(),
        failures: AtomicUsize::new(failures),
    })
}

#[tokio::test]
async fn frame_loader_retries_once() {
    let path = tempfile::TempDir::new().unwrap();
    let storage = flaky_store(path.path(), 1).await;
    let cache = Arc::new(ArrayHandleCache::new());
    let loader = FrameLoader::new(storage, cache.clone());

    let frame = loader.load_frame("000", "000", 0, 0, 0).await.unwrap();
    assert_eq!(frame.data, ArrayElements::UInt8(vec![1, 2, 3, 4]));
    // the failed read invalidated the handle and the retry reopened it
    assert_eq!(cache.opens(), 2);

    loader.load_frame("000", "000", 0, 0, 0).await.unwrap();
    assert_eq!(cache.opens(), 2);
}

#[tokio::test]
async fn frame_loader_second_failure_propagates() {
    let path = tempfile::TempDir::new().unwrap();
    let storage = flaky_store(path.path(), 2).await;
    let loader = FrameLoader::new(storage, Arc::new(ArrayHandleCache::new()));

    let err = loader.load_frame("000", "000", 0, 0, 0).await.unwrap_err();
    assert!(matches!(err, FrameLoadError::Read { t: 0, .. }));

    // the store has recovered
    loader.load_frame("000", "000", 0, 0, 0).await.unwrap();
}

#[tokio::test]
async fn frame_loader_missing_crop() {
    let path = tempfile::TempDir::new().unwrap();
    let storage = flaky_store(path.path(), 0).await;
    let loader = FrameLoader::new(storage, Arc::new(ArrayHandleCache::new()));

    let err = loader.load_frame("000", "999", 0, 0, 0).await.unwrap_err();
    assert!(matches!(err, FrameLoadError::Open { ref source, .. } if source.is_not_found()));
}
