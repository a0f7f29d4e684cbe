//! A process-wide cache of open crop array handles.
//!
//! Opening a crop array reads and parses its metadata, which is far more expensive than reading a frame chunk once the handle is open.
//! [`ArrayHandleCache`] keeps one open handle per `(store, posId, cropId)` and shares it between all callers.
//!
//! Opens are single-flight: concurrent requests for an uncached key all await the same in-flight open, so the metadata is read at most once.
//! A failed open is not cached, the next request retries.
//! [`ArrayHandleCache::invalidate`] drops an entry so the next request reopens the array, e.g. after the array has been rewritten.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;

use crate::{
    array::{Array, ArrayCreateError},
    layout::crop_array_prefix,
    storage::{ReadableListableStorage, ReadableListableStorageTraits, StoreId},
};

/// A shared handle to an open crop array.
pub type ArrayHandle = Arc<Array<dyn ReadableListableStorageTraits>>;

/// The result of opening a crop array through the cache.
pub type ArrayHandleResult = Result<ArrayHandle, Arc<ArrayCreateError>>;

type OpenFuture = Shared<BoxFuture<'static, ArrayHandleResult>>;

/// The key of a cached array handle.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ArrayKey {
    /// The store identity.
    pub store: StoreId,
    /// The position identifier.
    pub pos_id: String,
    /// The crop identifier.
    pub crop_id: String,
}

impl ArrayKey {
    /// Create a new array key.
    #[must_use]
    pub fn new(store: StoreId, pos_id: &str, crop_id: &str) -> Self {
        Self {
            store,
            pos_id: pos_id.to_string(),
            crop_id: crop_id.to_string(),
        }
    }
}

struct CacheEntry {
    generation: u64,
    open: OpenFuture,
}

/// A single-flight cache of open crop array handles.
///
/// Entries are never evicted by size.
/// The number of crop arrays in a store is bounded by the number of pattern sites, and a handle holds only metadata.
#[derive(Default)]
pub struct ArrayHandleCache {
    entries: Mutex<HashMap<ArrayKey, CacheEntry>>,
    generation: AtomicU64,
    opens: AtomicUsize,
}

impl std::fmt::Debug for ArrayHandleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayHandleCache")
            .field("len", &self.len())
            .field("opens", &self.opens())
            .finish()
    }
}

impl ArrayHandleCache {
    /// Create a new empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the handle of the crop array `pos_id`/`crop_id` in `storage`, opening it if it is not cached.
    ///
    /// If an open of the same key is already in flight, this awaits that open rather than starting another.
    ///
    /// # Errors
    /// Returns the [`ArrayCreateError`] of the open if it fails. All callers awaiting the same open receive the same error.
    pub async fn get(
        &self,
        storage: &ReadableListableStorage,
        pos_id: &str,
        crop_id: &str,
    ) -> ArrayHandleResult {
        let key = ArrayKey::new(storage.store_id(), pos_id, crop_id);
        let (generation, open) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(&key) {
                (entry.generation, entry.open.clone())
            } else {
                let path = crop_array_prefix(pos_id, crop_id)
                    .map_err(|err| Arc::new(ArrayCreateError::from(err)))?;
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                self.opens.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(store = %key.store, pos_id, crop_id, "opening crop array");
                let storage = storage.clone();
                let open = async move {
                    Array::open(storage, &path)
                        .await
                        .map(Arc::new)
                        .map_err(Arc::new)
                }
                .boxed()
                .shared();
                entries.insert(
                    key.clone(),
                    CacheEntry {
                        generation,
                        open: open.clone(),
                    },
                );
                (generation, open)
            }
        };

        let result = open.await;
        if let Err(err) = &result {
            let mut entries = self.entries.lock();
            // a newer open may have replaced the failed one
            if entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation)
            {
                tracing::debug!(store = %key.store, pos_id, crop_id, error = %err, "evicting failed open");
                entries.remove(&key);
            }
        }
        result
    }

    /// Drop the cached handle of the crop array `pos_id`/`crop_id` in `storage`, if any.
    ///
    /// Callers already holding the handle keep using it. The next [`get`](ArrayHandleCache::get) opens the array again.
    pub fn invalidate(&self, storage: &ReadableListableStorage, pos_id: &str, crop_id: &str) {
        let key = ArrayKey::new(storage.store_id(), pos_id, crop_id);
        if self.entries.lock().remove(&key).is_some() {
            tracing::debug!(store = %key.store, pos_id, crop_id, "invalidated crop array handle");
        }
    }

    /// Drop all cached handles.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Returns true if a handle (or an in-flight open) is cached for the crop array `pos_id`/`crop_id` in `storage`.
    #[must_use]
    pub fn contains(&self, storage: &ReadableListableStorage, pos_id: &str, crop_id: &str) -> bool {
        let key = ArrayKey::new(storage.store_id(), pos_id, crop_id);
        self.entries.lock().contains_key(&key)
    }

    /// The number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The number of array opens started by this cache.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}
