//! Global configuration options.

use std::{path::PathBuf, sync::OnceLock, time::Duration};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The environment variable overriding the default [encoder program](#encoder-program).
pub const FFMPEG_PATH_ENV: &str = "MUPATTERN_FFMPEG";

/// Global configuration options for the mupattern crate.
///
/// Retrieve the global [`Config`] with [`global_config`] and modify it with [`global_config_mut`].
///
/// # Movie Configuration Options
///
/// ## Encoder Program
/// > default: the value of the `MUPATTERN_FFMPEG` environment variable, otherwise `ffmpeg`
///
/// The program that encodes movies. It must accept `ffmpeg` style arguments and read raw `rgb24` frames on standard input.
///
/// ## Encoder Buffer Frames
/// > default: `4`
///
/// The number of rendered frames that may be queued ahead of the encoder.
/// A slow encoder applies backpressure to rendering once the queue is full.
///
/// # Discovery Configuration Options
///
/// ## Discovery Concurrency
/// > default: `16`
///
/// The number of array handles opened concurrently by a full discovery.
///
/// ## Discovery Timeout
/// > default: 30 seconds
///
/// The default upper bound on a discovery run, see [`discover_with_timeout`](crate::discovery::discover_with_timeout).
///
/// # Task Configuration Options
///
/// ## Task Workers
/// > default: `2`
///
/// The number of tasks a [`TaskManager`](crate::task::TaskManager) runs at once. Further tasks stay queued.
///
/// ## Task Event Capacity
/// > default: `256`
///
/// The number of task events buffered for each live subscriber. Slow subscribers skip the oldest events.
#[derive(Debug, Clone)]
pub struct Config {
    ffmpeg_path: PathBuf,
    encoder_buffer_frames: usize,
    discovery_concurrency: usize,
    discovery_timeout: Duration,
    task_workers: usize,
    task_event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let ffmpeg_path = std::env::var_os(FFMPEG_PATH_ENV)
            .filter(|path| !path.is_empty())
            .map_or_else(|| PathBuf::from("ffmpeg"), PathBuf::from);
        Config {
            ffmpeg_path,
            encoder_buffer_frames: 4,
            discovery_concurrency: 16,
            discovery_timeout: Duration::from_secs(30),
            task_workers: 2,
            task_event_capacity: 256,
        }
    }
}

impl Config {
    /// Get the [encoder program](#encoder-program) configuration.
    #[must_use]
    pub fn ffmpeg_path(&self) -> &PathBuf {
        &self.ffmpeg_path
    }

    /// Set the [encoder program](#encoder-program) configuration.
    pub fn set_ffmpeg_path(&mut self, ffmpeg_path: impl Into<PathBuf>) {
        self.ffmpeg_path = ffmpeg_path.into();
    }

    /// Get the [encoder buffer frames](#encoder-buffer-frames) configuration.
    #[must_use]
    pub fn encoder_buffer_frames(&self) -> usize {
        self.encoder_buffer_frames
    }

    /// Set the [encoder buffer frames](#encoder-buffer-frames) configuration.
    ///
    /// A value of zero is treated as one.
    pub fn set_encoder_buffer_frames(&mut self, encoder_buffer_frames: usize) {
        self.encoder_buffer_frames = encoder_buffer_frames.max(1);
    }

    /// Get the [discovery concurrency](#discovery-concurrency) configuration.
    #[must_use]
    pub fn discovery_concurrency(&self) -> usize {
        self.discovery_concurrency
    }

    /// Set the [discovery concurrency](#discovery-concurrency) configuration.
    ///
    /// A value of zero is treated as one.
    pub fn set_discovery_concurrency(&mut self, discovery_concurrency: usize) {
        self.discovery_concurrency = discovery_concurrency.max(1);
    }

    /// Get the [discovery timeout](#discovery-timeout) configuration.
    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        self.discovery_timeout
    }

    /// Set the [discovery timeout](#discovery-timeout) configuration.
    pub fn set_discovery_timeout(&mut self, discovery_timeout: Duration) {
        self.discovery_timeout = discovery_timeout;
    }

    /// Get the [task workers](#task-workers) configuration.
    #[must_use]
    pub fn task_workers(&self) -> usize {
        self.task_workers
    }

    /// Set the [task workers](#task-workers) configuration.
    ///
    /// A value of zero is treated as one.
    pub fn set_task_workers(&mut self, task_workers: usize) {
        self.task_workers = task_workers.max(1);
    }

    /// Get the [task event capacity](#task-event-capacity) configuration.
    #[must_use]
    pub fn task_event_capacity(&self) -> usize {
        self.task_event_capacity
    }

    /// Set the [task event capacity](#task-event-capacity) configuration.
    ///
    /// A value of zero is treated as one.
    pub fn set_task_event_capacity(&mut self, task_event_capacity: usize) {
        self.task_event_capacity = task_event_capacity.max(1);
    }
}

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Returns a reference to the global mupattern configuration.
///
/// This might deadlock if the global config is already mutably held by the current thread.
pub fn global_config() -> RwLockReadGuard<'static, Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::default())).read()
}

/// Returns a mutable reference to the global mupattern configuration.
///
/// This might deadlock if the global config is already held by the current thread.
pub fn global_config_mut() -> RwLockWriteGuard<'static, Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::default())).write()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.encoder_buffer_frames(), 4);
        assert_eq!(config.discovery_concurrency(), 16);
        assert_eq!(config.discovery_timeout(), Duration::from_secs(30));
        assert_eq!(config.task_workers(), 2);
        assert_eq!(config.task_event_capacity(), 256);
        assert!(!config.ffmpeg_path().as_os_str().is_empty());
    }

    #[test]
    fn config_setters_clamp_zero() {
        let mut config = Config::default();
        config.set_encoder_buffer_frames(0);
        config.set_discovery_concurrency(0);
        config.set_task_workers(0);
        config.set_task_event_capacity(0);
        assert_eq!(config.encoder_buffer_frames(), 1);
        assert_eq!(config.discovery_concurrency(), 1);
        assert_eq!(config.task_workers(), 1);
        assert_eq!(config.task_event_capacity(), 1);
        config.set_ffmpeg_path("/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.ffmpeg_path(), &PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    }

    #[test]
    fn config_global() {
        let timeout = global_config().discovery_timeout();
        global_config_mut().set_discovery_timeout(Duration::from_secs(5));
        assert_eq!(global_config().discovery_timeout(), Duration::from_secs(5));
        global_config_mut().set_discovery_timeout(timeout);
    }
}
