#![cfg(unix)]

use std::{path::Path, sync::Arc};

use mupattern::{
    array::Array,
    cache::ArrayHandleCache,
    layout::crop_array_prefix,
    metadata::{ArrayAttributes, ArrayMetadata, DataType},
    movie::{Colormap, EncoderCommand, MovieError, MovieRenderer, MovieRequest, CROSS_COLOR},
    storage::FilesystemStore,
    task::{ErrorCategory, TaskContext, TaskManager, TaskStatus},
};

const WIDTH: u64 = 12;
const HEIGHT: u64 = 10;
const TIMES: u64 = 4;

/// An encoder that copies raw frames from stdin to its last argument.
fn fake_encoder() -> EncoderCommand {
    EncoderCommand::new("sh").with_leading_args([
        "-c",
        "for last; do :; done; cat > \"$last\"",
        "fake-ffmpeg",
    ])
}

fn failing_encoder() -> EncoderCommand {
    EncoderCommand::new("sh").with_leading_args([
        "-c",
        "cat > /dev/null; echo 'unknown encoder' >&2; exit 7",
        "fake-ffmpeg",
    ])
}

/// Frame `t` has every pixel equal to `t * 10`, except a bright pixel at (0, 0) in the last frame.
async fn write_crop(root: &Path) {
    let store = Arc::new(FilesystemStore::new(root).unwrap());
    let array = Array::create(
        store,
        crop_array_prefix("150", "000").unwrap(),
        ArrayMetadata::new(
            vec![TIMES, 2, 1, HEIGHT, WIDTH],
            vec![1, 1, 1, HEIGHT, WIDTH],
            DataType::UInt16,
        ),
        ArrayAttributes::new(),
    )
    .await
    .unwrap();
    for t in 0..TIMES {
        for c in 0..2 {
            let mut pixels = vec![u16::try_from(t * 10).unwrap(); (WIDTH * HEIGHT) as usize];
            if t == TIMES - 1 {
                pixels[0] = 60;
            }
            array
                .store_chunk_elements(&[t, c, 0, 0, 0], &pixels)
                .await
                .unwrap();
        }
    }
}

fn request(root: &Path, time: &str) -> MovieRequest {
    MovieRequest {
        array_root: root.join("crops.zarr"),
        pos: "150".to_string(),
        crop: "000".to_string(),
        channel: 1,
        time: time.to_string(),
        output_path: root.join("movies/out.raw"),
        fps: 5,
        colormap: Colormap::Grayscale,
        spots_csv: None,
    }
}

#[tokio::test]
async fn movie_render_streams_padded_frames() {
    let root = tempfile::TempDir::new().unwrap();
    write_crop(&root.path().join("crops.zarr")).await;
    std::fs::write(
        root.path().join("spots.csv"),
        "t,crop,y,x\n1,0,5,6\n1,001,2,2\n",
    )
    .unwrap();
    let request = MovieRequest {
        spots_csv: Some(root.path().join("spots.csv")),
        ..request(root.path(), "1:")
    };

    let renderer =
        MovieRenderer::new(Arc::new(ArrayHandleCache::new())).with_encoder_command(fake_encoder());
    let outcome = renderer
        .render(&request, &TaskContext::default())
        .await
        .unwrap();
    assert_eq!(outcome.frames, 3);
    assert_eq!((outcome.width, outcome.height), (16, 16));

    let bytes = std::fs::read(&request.output_path).unwrap();
    let frame_len = 16 * 16 * 3;
    assert_eq!(bytes.len(), 3 * frame_len);
    let pixel = |frame: usize, x: usize, y: usize| {
        let offset = frame * frame_len + (y * 16 + x) * 3;
        [bytes[offset], bytes[offset + 1], bytes[offset + 2]]
    };
    // the 12x10 frame is centred with a 2 pixel left and 3 pixel top border
    assert_eq!(pixel(0, 0, 0), [0, 0, 0]);
    assert_eq!(pixel(0, 1, 3), [0, 0, 0]);
    // global range is 10..60 over the selected frames, so t=1 is black and t=2 is 0.2
    assert_eq!(pixel(0, 2, 4), [0, 0, 0]);
    assert_eq!(pixel(1, 3, 4), [51, 51, 51]);
    assert_eq!(pixel(2, 2, 3), [255, 255, 255]);
    // the spot of crop 0 at t=1, (y=5, x=6), lands at (y=8, x=8) in the padded frame
    assert_eq!(pixel(0, 8, 8), CROSS_COLOR.0);
    assert_eq!(pixel(0, 8, 5), CROSS_COLOR.0);
    assert_eq!(pixel(0, 4, 5), [0, 0, 0]);
    assert_ne!(pixel(1, 8, 8), CROSS_COLOR.0);
}

#[tokio::test]
async fn movie_render_request_errors() {
    let root = tempfile::TempDir::new().unwrap();
    write_crop(&root.path().join("crops.zarr")).await;
    let renderer =
        MovieRenderer::new(Arc::new(ArrayHandleCache::new())).with_encoder_command(fake_encoder());
    let ctx = TaskContext::default();

    let err = renderer
        .render(&MovieRequest { channel: 2, ..request(root.path(), "all") }, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, MovieError::ChannelOutOfRange { channel: 2, channels: 2 }));

    for time in ["0:4:0", "4", "-5", "x"] {
        let err = renderer
            .render(&request(root.path(), time), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, MovieError::TimeSelection(_)), "{time}");
        assert_eq!(err.category(), ErrorCategory::InvalidRequest);
    }

    let err = renderer
        .render(&request(root.path(), "3:1"), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, MovieError::NoFrames(_)));

    let err = renderer
        .render(
            &MovieRequest { crop: "404".to_string(), ..request(root.path(), "all") },
            &ctx,
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);

    assert!(!root.path().join("movies").exists());
}

#[tokio::test]
async fn movie_render_encoder_failure() {
    let root = tempfile::TempDir::new().unwrap();
    write_crop(&root.path().join("crops.zarr")).await;
    let renderer = MovieRenderer::new(Arc::new(ArrayHandleCache::new()))
        .with_encoder_command(failing_encoder());

    let err = renderer
        .render(&request(root.path(), "all"), &TaskContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::SubprocessFailure);
    assert!(err.to_string().contains("unknown encoder"));

    let renderer = MovieRenderer::new(Arc::new(ArrayHandleCache::new()))
        .with_encoder_program(root.path().join("no-such-ffmpeg"));
    let err = renderer
        .render(&request(root.path(), "all"), &TaskContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::SubprocessFailure);
}

#[tokio::test]
async fn movie_task_records() {
    let root = tempfile::TempDir::new().unwrap();
    write_crop(&root.path().join("crops.zarr")).await;
    let manager = TaskManager::with_options(None, 2, 64);
    let cache = Arc::new(ArrayHandleCache::new());

    let ok = manager.submit_movie(
        request(root.path(), "all"),
        MovieRenderer::new(cache.clone()).with_encoder_command(fake_encoder()),
    );
    let failed = manager.submit_movie(
        MovieRequest {
            output_path: root.path().join("movies/failed.mp4"),
            ..request(root.path(), "all")
        },
        MovieRenderer::new(cache.clone()).with_encoder_command(failing_encoder()),
    );

    let ok = manager.wait(&ok.id).await.unwrap();
    assert_eq!(ok.status, TaskStatus::Succeeded);
    let result = ok.result.clone().unwrap();
    assert_eq!(result["ok"], true);
    assert_eq!(result["frames"], 4);
    assert!((ok.progress() - 1.0).abs() < 1e-9);
    let progress: Vec<f64> = ok.progress_events.iter().map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().any(|&p| (p - 0.4).abs() < 1e-9));

    let failed = manager.wait(&failed.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    let result = failed.result.unwrap();
    assert_eq!(result["ok"], false);
    assert_eq!(result["category"], "subprocess_failure");
    assert!(failed.error.unwrap().contains("unknown encoder"));

    // both tasks share one open of the crop array
    assert_eq!(cache.opens(), 1);
}
