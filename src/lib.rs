//! Crop extraction, chunked array access, and movie rendering for time-lapse micropattern microscopy.
//!
//! A microscope position is imaged as a series of single channel TIFF frames.
//! Each frame holds many micropattern sites, and each site is analysed on its own.
//! `mupattern` cuts every site out of every frame into a per-site crop array, stored as a [Zarr V2](https://zarr.readthedocs.io/en/stable/spec/v2.html) hierarchy:
//! ```text
//! root/
//! └── pos/
//!     └── {posId}/
//!         ├── crop/
//!         │   └── {cropId}/      (t, c, z, y, x), one chunk per frame: {t}.{c}.{z}.0.0
//!         └── background/        (t, c, z), one chunk per frame: {t}.{c}.{z}
//! ```
//!
//! ## Getting Started
//! - [`crop::run_crop`] extracts the crop arrays of a position.
//! - [`discovery::discover`] lists the positions and crops of a store.
//! - [`frame::FrameLoader`] loads single frames from crop arrays.
//! - [`movie::MovieRenderer`] renders a crop over time to a movie with `ffmpeg`.
//! - [`task::TaskManager`] runs crop and movie tasks in the background and records their progress.
//!
//! Crop array handles are shared between readers by an [`cache::ArrayHandleCache`], which opens each array at most once even under concurrent access.
//!
//! ## Example
//! ```rust,no_run
//! # use std::sync::Arc;
//! use mupattern::{
//!     cache::ArrayHandleCache,
//!     discovery::{discover, DiscoveryMode},
//!     frame::FrameLoader,
//!     storage::{FilesystemStore, ReadableListableStorage},
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store: ReadableListableStorage = Arc::new(FilesystemStore::new("/path/to/crops.zarr")?);
//! let cache = Arc::new(ArrayHandleCache::new());
//!
//! let index = discover(&store, &cache, None, DiscoveryMode::Full).await?;
//! let loader = FrameLoader::new(store, cache);
//! for (pos_id, crops) in &index.crops {
//!     for crop in crops {
//!         let frame = loader.load_frame(pos_id, &crop.crop_id, 0, 0, 0).await?;
//!         println!("{pos_id}/{}: {}x{}", crop.crop_id, frame.width, frame.height);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//! Global settings such as the `ffmpeg` path and task worker limit are in [`config::Config`].

#![warn(unused_variables)]
#![warn(dead_code)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![deny(clippy::missing_panics_doc)]

pub mod array;
pub mod bbox;
pub mod cache;
pub mod config;
pub mod crop;
pub mod discovery;
pub mod frame;
pub mod layout;
pub mod metadata;
pub mod movie;
pub mod storage;
pub mod task;
