//! Frame loading.
//!
//! A frame is the 2D `(y, x)` plane of a crop array at one `(t, c, z)`, stored as a single chunk.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::{
    array::{ArrayCreateError, ArrayElements, ArrayError},
    cache::{ArrayHandle, ArrayHandleCache},
    storage::ReadableListableStorage,
};

/// A decoded frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Frame {
    /// The pixels in row-major order.
    pub data: ArrayElements,
    /// The frame width.
    pub width: u64,
    /// The frame height.
    pub height: u64,
}

/// A frame loading error.
#[derive(Debug, Error)]
pub enum FrameLoadError {
    /// The crop array could not be opened.
    #[error("failed to open crop {pos_id}/{crop_id}: {source}")]
    Open {
        /// The position identifier.
        pos_id: String,
        /// The crop identifier.
        crop_id: String,
        /// The open error.
        source: Arc<ArrayCreateError>,
    },
    /// The crop array is not a `(t, c, z, y, x)` array with single-frame chunks.
    #[error("crop {pos_id}/{crop_id} with chunk shape {chunk_shape:?} is not chunked by frame")]
    NotFramed {
        /// The position identifier.
        pos_id: String,
        /// The crop identifier.
        crop_id: String,
        /// The chunk shape.
        chunk_shape: Vec<u64>,
    },
    /// The frame chunk could not be read.
    #[error("failed to read frame (t={t}, c={c}, z={z}) of crop {pos_id}/{crop_id}: {source}")]
    Read {
        /// The position identifier.
        pos_id: String,
        /// The crop identifier.
        crop_id: String,
        /// The time index.
        t: u64,
        /// The channel index.
        c: u64,
        /// The z index.
        z: u64,
        /// The read error.
        source: ArrayError,
    },
}

/// Loads frames from the crop arrays of a store through a shared [`ArrayHandleCache`].
#[derive(Clone)]
pub struct FrameLoader {
    storage: ReadableListableStorage,
    cache: Arc<ArrayHandleCache>,
}

impl std::fmt::Debug for FrameLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLoader")
            .field("store", &self.storage.store_id())
            .field("cache", &self.cache)
            .finish()
    }
}

impl FrameLoader {
    /// Create a new frame loader for `storage`.
    #[must_use]
    pub fn new(storage: ReadableListableStorage, cache: Arc<ArrayHandleCache>) -> Self {
        Self { storage, cache }
    }

    /// Get the storage.
    #[must_use]
    pub fn storage(&self) -> &ReadableListableStorage {
        &self.storage
    }

    /// Get the handle cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ArrayHandleCache> {
        &self.cache
    }

    /// Load the frame at (`t`, `c`, `z`) of crop `pos_id`/`crop_id`.
    ///
    /// If opening the array or reading the chunk fails, the cached handle is invalidated and the load is retried exactly once with a freshly opened handle.
    ///
    /// # Errors
    /// Returns a [`FrameLoadError`] if the retry also fails.
    pub async fn load_frame(
        &self,
        pos_id: &str,
        crop_id: &str,
        t: u64,
        c: u64,
        z: u64,
    ) -> Result<Frame, FrameLoadError> {
        match self.try_load_frame(pos_id, crop_id, t, c, z).await {
            Ok(frame) => Ok(frame),
            Err(err) => {
                tracing::warn!(pos_id, crop_id, t, c, z, error = %err, "frame load failed, retrying with a fresh handle");
                self.cache.invalidate(&self.storage, pos_id, crop_id);
                self.try_load_frame(pos_id, crop_id, t, c, z).await
            }
        }
    }

    async fn try_load_frame(
        &self,
        pos_id: &str,
        crop_id: &str,
        t: u64,
        c: u64,
        z: u64,
    ) -> Result<Frame, FrameLoadError> {
        let handle = self
            .cache
            .get(&self.storage, pos_id, crop_id)
            .await
            .map_err(|source| FrameLoadError::Open {
                pos_id: pos_id.to_string(),
                crop_id: crop_id.to_string(),
                source,
            })?;
        read_frame(&handle, pos_id, crop_id, t, c, z).await
    }
}

async fn read_frame(
    handle: &ArrayHandle,
    pos_id: &str,
    crop_id: &str,
    t: u64,
    c: u64,
    z: u64,
) -> Result<Frame, FrameLoadError> {
    let chunk_shape = handle.chunk_shape();
    let [1, 1, 1, height, width] = chunk_shape.as_slice() else {
        return Err(FrameLoadError::NotFramed {
            pos_id: pos_id.to_string(),
            crop_id: crop_id.to_string(),
            chunk_shape: chunk_shape.clone(),
        });
    };
    let data = handle
        .retrieve_chunk_array_elements(&[t, c, z, 0, 0])
        .await
        .map_err(|source| FrameLoadError::Read {
            pos_id: pos_id.to_string(),
            crop_id: crop_id.to_string(),
            t,
            c,
            z,
            source,
        })?;
    Ok(Frame {
        data,
        width: *width,
        height: *height,
    })
}
