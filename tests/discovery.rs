use std::{sync::Arc, time::Duration};

use mupattern::{
    array::Array,
    bbox::BBox,
    cache::ArrayHandleCache,
    discovery::{
        discover, discover_with_timeout, list_positions, DiscoveryError, DiscoveryMode,
        SENTINEL_SHAPE,
    },
    layout::{crop_array_prefix, crops_prefix},
    metadata::{crop_attributes, ArrayMetadata, DataType},
    storage::{FilesystemStore, ReadableListableStorage, WritableStorageTraits},
};

async fn create_crop(store: &Arc<FilesystemStore>, pos_id: &str, crop_id: &str, size: u64) {
    let bbox = BBox {
        crop: 0,
        x: 0,
        y: 0,
        w: u32::try_from(size).unwrap(),
        h: u32::try_from(size).unwrap(),
    };
    Array::create(
        store.clone(),
        crop_array_prefix(pos_id, crop_id).unwrap(),
        ArrayMetadata::new(vec![2, 1, 1, size, size], vec![1, 1, 1, size, size], DataType::UInt16),
        crop_attributes(&bbox),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn discovery_fast_opens_nothing() {
    let path = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FilesystemStore::new(path.path()).unwrap());
    for crop_id in ["a", "b", "c", "d"] {
        create_crop(&store, "140", crop_id, 4).await;
    }
    let storage: ReadableListableStorage = store;
    let cache = ArrayHandleCache::new();

    let index = discover(&storage, &cache, None, DiscoveryMode::Fast).await.unwrap();
    assert_eq!(cache.opens(), 0);
    assert_eq!(index.positions, ["140"]);
    let crops = &index.crops["140"];
    assert_eq!(crops.len(), 4);
    // every crop is assumed to share the first crop's shape
    assert!(crops.iter().all(|crop| crop.shape == [2, 1, 1, 4, 4]));
    assert!(crops.iter().all(|crop| crop.bbox.is_none()));
}

#[tokio::test]
async fn discovery_full_opens_each_crop() {
    let path = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FilesystemStore::new(path.path()).unwrap());
    create_crop(&store, "000", "000", 4).await;
    create_crop(&store, "000", "001", 6).await;
    create_crop(&store, "000", "002", 8).await;
    let storage: ReadableListableStorage = store;
    let cache = ArrayHandleCache::new();

    let index = discover(&storage, &cache, None, DiscoveryMode::Full).await.unwrap();
    assert_eq!(cache.opens(), 3);
    let shapes: Vec<_> = index.crops["000"].iter().map(|c| c.shape[4]).collect();
    assert_eq!(shapes, [4, 6, 8]);
    assert_eq!(index.crops["000"][1].bbox.map(|b| b.w), Some(6));

    // a second discovery reuses the cached handles
    discover(&storage, &cache, None, DiscoveryMode::Full).await.unwrap();
    assert_eq!(cache.opens(), 3);
}

#[tokio::test]
async fn discovery_position_filter() {
    let path = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FilesystemStore::new(path.path()).unwrap());
    create_crop(&store, "001", "000", 2).await;
    create_crop(&store, "002", "000", 2).await;
    // a position directory without crops
    std::fs::create_dir_all(path.path().join("pos/003/background")).unwrap();
    let storage: ReadableListableStorage = store;
    let cache = ArrayHandleCache::new();

    assert_eq!(list_positions(&storage).await.unwrap(), ["001", "002"]);

    let filter = ["002".to_string(), "999".to_string()];
    let index = discover(&storage, &cache, Some(&filter[..]), DiscoveryMode::Fast)
        .await
        .unwrap();
    assert_eq!(index.positions, ["002"]);
    assert_eq!(index.num_crops(), 1);

    let empty: ReadableListableStorage =
        Arc::new(FilesystemStore::new(path.path().join("missing")).unwrap());
    let index = discover(&empty, &cache, None, DiscoveryMode::Full).await.unwrap();
    assert!(index.positions.is_empty());
}

#[tokio::test]
async fn discovery_malformed_crop() {
    let path = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FilesystemStore::new(path.path()).unwrap());
    create_crop(&store, "000", "001", 4).await;
    let broken = crops_prefix("000").unwrap().child("000").unwrap();
    store
        .set(&broken.key(".zarray").unwrap(), "{not json".into())
        .await
        .unwrap();
    let storage: ReadableListableStorage = store;
    let cache = ArrayHandleCache::new();

    // fast discovery falls back to a sentinel shape
    let index = discover(&storage, &cache, None, DiscoveryMode::Fast).await.unwrap();
    assert!(index.crops["000"]
        .iter()
        .all(|crop| crop.shape == SENTINEL_SHAPE));

    // full discovery reports the crop that failed to open
    let err = discover_with_timeout(
        &storage,
        &cache,
        None,
        DiscoveryMode::Full,
        Duration::from_secs(10),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, DiscoveryError::Open { ref crop_id, .. } if crop_id == "000"));
    assert!(!cache.contains(&storage, "000", "000"));
}
