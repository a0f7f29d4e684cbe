//! Crop store discovery.
//!
//! Discovery enumerates the positions and crops of a crop store.
//!
//! - [`DiscoveryMode::Fast`] lists directories and reads the `.zarray` document of the first crop of each position only.
//!   Every crop of the position is reported with that shape. No array handles are opened.
//! - [`DiscoveryMode::Full`] opens every crop through the [`ArrayHandleCache`], reporting exact per-crop shapes and bounding boxes and warming the cache for subsequent frame loads.
//!
//! [`list_positions`] is a cheaper pre-pass which only lists position directories.

use std::{collections::BTreeMap, str::FromStr, sync::Arc, time::Duration};

use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    array::ArrayCreateError,
    bbox::BBox,
    cache::ArrayHandleCache,
    config::global_config,
    layout::{crop_array_prefix, crops_prefix, position_prefix, positions_prefix, CROPS_GROUP},
    metadata::{read_array_metadata, ArrayShape},
    storage::{ReadableListableStorage, StorageError, StorePrefixError},
};

/// The shape reported by a fast discovery when the first crop of a position has no readable metadata.
pub const SENTINEL_SHAPE: [u64; 5] = [1, 1, 1, 1, 1];

/// The discovery mode.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// List directories and read the metadata of the first crop per position.
    #[default]
    Fast,
    /// Open every crop.
    Full,
}

impl FromStr for DiscoveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "full" => Ok(Self::Full),
            _ => Err(format!("unknown discovery mode {s:?}, expected fast or full")),
        }
    }
}

/// A crop reported by discovery or produced by extraction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CropInfo {
    /// The position identifier.
    pub pos_id: String,
    /// The crop identifier.
    pub crop_id: String,
    /// The array shape `(t, c, z, y, x)`.
    pub shape: ArrayShape,
    /// The source bounding box, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
}

/// The positions and crops of a crop store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct StoreIndex {
    /// The identifiers of positions with at least one crop, sorted.
    pub positions: Vec<String>,
    /// The crops of each position, sorted by crop identifier.
    pub crops: BTreeMap<String, Vec<CropInfo>>,
}

impl StoreIndex {
    /// The total number of crops.
    #[must_use]
    pub fn num_crops(&self) -> usize {
        self.crops.values().map(Vec::len).sum()
    }
}

/// A discovery error.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A storage error.
    #[error(transparent)]
    StorageError(#[from] StorageError),
    /// An invalid position or crop identifier.
    #[error(transparent)]
    InvalidPath(#[from] StorePrefixError),
    /// A crop array could not be opened in full discovery.
    #[error("failed to open crop {pos_id}/{crop_id}: {source}")]
    Open {
        /// The position identifier.
        pos_id: String,
        /// The crop identifier.
        crop_id: String,
        /// The open error.
        source: Arc<ArrayCreateError>,
    },
    /// Discovery did not complete in time.
    #[error("discovery timed out after {0:?}")]
    Timeout(Duration),
}

/// List the positions of a crop store.
///
/// A position is listed if its directory contains a `crop` subdirectory. Crops are not enumerated.
///
/// # Errors
/// Returns a [`DiscoveryError`] if there is an underlying storage error.
pub async fn list_positions(
    storage: &ReadableListableStorage,
) -> Result<Vec<String>, DiscoveryError> {
    let mut positions = Vec::new();
    for position in storage.list_dir(&positions_prefix()).await?.prefixes() {
        let pos_id = position.name();
        let children = storage.list_dir(&position_prefix(pos_id)?).await?;
        if children
            .prefixes()
            .iter()
            .any(|child| child.name() == CROPS_GROUP)
        {
            positions.push(pos_id.to_string());
        }
    }
    positions.sort();
    Ok(positions)
}

async fn list_crop_ids(
    storage: &ReadableListableStorage,
    pos_id: &str,
) -> Result<Vec<String>, DiscoveryError> {
    let mut crop_ids: Vec<String> = storage
        .list_dir(&crops_prefix(pos_id)?)
        .await?
        .prefixes()
        .iter()
        .map(|prefix| prefix.name().to_string())
        .collect();
    crop_ids.sort();
    Ok(crop_ids)
}

async fn discover_position_fast(
    storage: &ReadableListableStorage,
    pos_id: &str,
    crop_ids: Vec<String>,
) -> Result<Vec<CropInfo>, DiscoveryError> {
    let Some(first) = crop_ids.first() else {
        return Ok(vec![]);
    };
    let shape = match read_array_metadata(&**storage, &crop_array_prefix(pos_id, first)?).await {
        Ok(metadata) => metadata.shape,
        Err(err) => {
            tracing::debug!(pos_id, crop_id = %first, error = %err, "using sentinel shape");
            SENTINEL_SHAPE.to_vec()
        }
    };
    Ok(crop_ids
        .into_iter()
        .map(|crop_id| CropInfo {
            pos_id: pos_id.to_string(),
            crop_id,
            shape: shape.clone(),
            bbox: None,
        })
        .collect())
}

async fn discover_position_full(
    storage: &ReadableListableStorage,
    cache: &ArrayHandleCache,
    pos_id: &str,
    crop_ids: Vec<String>,
) -> Result<Vec<CropInfo>, DiscoveryError> {
    let concurrency = global_config().discovery_concurrency();
    futures::stream::iter(crop_ids)
        .map(|crop_id| async move {
            match cache.get(storage, pos_id, &crop_id).await {
                Ok(handle) => Ok(CropInfo {
                    pos_id: pos_id.to_string(),
                    shape: handle.shape().clone(),
                    bbox: handle.bbox(),
                    crop_id,
                }),
                Err(source) => Err(DiscoveryError::Open {
                    pos_id: pos_id.to_string(),
                    crop_id,
                    source,
                }),
            }
        })
        .buffered(concurrency)
        .try_collect()
        .await
}

/// Discover the positions and crops of a crop store.
///
/// If `positions` is given, only those positions are examined and any that do not exist are skipped.
/// Positions without crops are not reported.
///
/// # Errors
/// Returns a [`DiscoveryError`] if there is an underlying storage error, or in [`DiscoveryMode::Full`] if any crop cannot be opened.
#[tracing::instrument(level = "debug", skip(storage, cache), fields(store = %storage.store_id()))]
pub async fn discover(
    storage: &ReadableListableStorage,
    cache: &ArrayHandleCache,
    positions: Option<&[String]>,
    mode: DiscoveryMode,
) -> Result<StoreIndex, DiscoveryError> {
    let candidates: Vec<String> = match positions {
        Some(positions) => {
            let mut positions = positions.to_vec();
            positions.sort();
            positions.dedup();
            positions
        }
        None => list_positions(storage).await?,
    };

    let mut index = StoreIndex::default();
    for pos_id in candidates {
        let crop_ids = list_crop_ids(storage, &pos_id).await?;
        if crop_ids.is_empty() {
            continue;
        }
        let crops = match mode {
            DiscoveryMode::Fast => discover_position_fast(storage, &pos_id, crop_ids).await?,
            DiscoveryMode::Full => {
                discover_position_full(storage, cache, &pos_id, crop_ids).await?
            }
        };
        index.positions.push(pos_id.clone());
        index.crops.insert(pos_id, crops);
    }
    tracing::debug!(
        positions = index.positions.len(),
        crops = index.num_crops(),
        "discovery complete"
    );
    Ok(index)
}

/// [`discover`] with an upper bound on its duration.
///
/// # Errors
/// Returns [`DiscoveryError::Timeout`] if discovery does not complete within `timeout`, or any error of [`discover`].
pub async fn discover_with_timeout(
    storage: &ReadableListableStorage,
    cache: &ArrayHandleCache,
    positions: Option<&[String]>,
    mode: DiscoveryMode,
    timeout: Duration,
) -> Result<StoreIndex, DiscoveryError> {
    tokio::time::timeout(timeout, discover(storage, cache, positions, mode))
        .await
        .map_err(|_| DiscoveryError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_mode_parse() {
        assert_eq!("fast".parse::<DiscoveryMode>().unwrap(), DiscoveryMode::Fast);
        assert_eq!("FULL".parse::<DiscoveryMode>().unwrap(), DiscoveryMode::Full);
        assert!("slow".parse::<DiscoveryMode>().is_err());
        assert_eq!(DiscoveryMode::default(), DiscoveryMode::Fast);
    }

    #[test]
    fn crop_info_json() {
        let crop = CropInfo {
            pos_id: "140".to_string(),
            crop_id: "000".to_string(),
            shape: vec![1, 1, 1, 4, 4],
            bbox: None,
        };
        assert_eq!(
            serde_json::to_string(&crop).unwrap(),
            r#"{"posId":"140","cropId":"000","shape":[1,1,1,4,4]}"#
        );
    }
}
