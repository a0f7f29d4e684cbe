use std::path::Path;

use image::{GrayImage, Luma};
use mupattern::{
    crop::CropRequest,
    task::{TaskEvent, TaskManager, TaskRecord, TaskStatus},
};

fn write_position(root: &Path, times: u32) {
    let pos_dir = root.join("raw/Pos7");
    std::fs::create_dir_all(&pos_dir).unwrap();
    for t in 0..times {
        GrayImage::from_fn(16, 16, |x, y| Luma([u8::try_from((x + y + t) % 256).unwrap()]))
            .save(pos_dir.join(format!("img_channel000_position7_time{t:09}_z000.tif")))
            .unwrap();
    }
    std::fs::write(root.join("bbox.csv"), "crop,x,y,w,h\n0,0,0,4,4\n1,8,8,8,8\n").unwrap();
}

fn request(root: &Path) -> CropRequest {
    CropRequest {
        input_dir: root.join("raw"),
        pos: 7,
        bbox_path: root.join("bbox.csv"),
        output_root: root.join("crops.zarr"),
        background: false,
    }
}

#[tokio::test]
async fn crop_task_lifecycle() {
    let root = tempfile::TempDir::new().unwrap();
    write_position(root.path(), 5);
    let manager = TaskManager::with_storage_dir(root.path().join("tasks")).unwrap();
    let mut events = manager.subscribe();

    let record = manager.submit_crop(request(root.path()));
    assert_eq!(record.kind, "crop");
    assert_eq!(record.request["pos"], 7);

    let record = manager.wait(&record.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Succeeded, "{:?}", record.error);
    let result = record.result.clone().unwrap();
    assert_eq!(result["ok"], true);
    assert_eq!(result["posId"], "007");
    assert_eq!(result["frames"], 5);
    assert_eq!(result["crops"].as_array().unwrap().len(), 2);
    assert_eq!(result["crops"][1]["shape"], serde_json::json!([5, 1, 1, 8, 8]));

    assert_eq!(record.progress_events.len(), 5);
    assert!((record.progress() - 1.0).abs() < 1e-9);
    assert!(record.logs.iter().any(|line| line.contains("2 bounding boxes")));
    assert!(root.path().join("crops.zarr/pos/007/crop/001/4.0.0.0.0").exists());

    let mut progress_events = 0;
    while let Ok(event) = events.try_recv() {
        if let TaskEvent::Progress { .. } = event {
            progress_events += 1;
        }
    }
    assert_eq!(progress_events, 5);

    let persisted: TaskRecord = serde_json::from_slice(
        &std::fs::read(root.path().join(format!("tasks/{}.json", record.id))).unwrap(),
    )
    .unwrap();
    assert_eq!(persisted.status, TaskStatus::Succeeded);
    assert_eq!(persisted.progress_events, record.progress_events);
}

#[tokio::test]
async fn crop_task_failure_categories() {
    let root = tempfile::TempDir::new().unwrap();
    let manager = TaskManager::with_options(None, 2, 64);

    let missing = manager.submit_crop(request(root.path()));
    let missing = manager.wait(&missing.id).await.unwrap();
    assert_eq!(missing.status, TaskStatus::Failed);
    let result = missing.result.unwrap();
    assert_eq!(result["ok"], false);
    assert_eq!(result["category"], "not_found");

    write_position(root.path(), 1);
    std::fs::write(root.path().join("bbox.csv"), "crop,x,y,w,h\n0,10,10,8,8\n").unwrap();
    let outside = manager.submit_crop(request(root.path()));
    let outside = manager.wait(&outside.id).await.unwrap();
    assert_eq!(outside.status, TaskStatus::Failed);
    assert_eq!(outside.result.unwrap()["category"], "invalid_request");

    assert_eq!(manager.list(Some(TaskStatus::Failed)).len(), 2);
}
