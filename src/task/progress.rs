use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A receiver of task progress and log messages.
pub trait ProgressSink: Send + Sync {
    /// Report that `progress` (in `[0, 1]`) of the task is complete.
    fn progress(&self, progress: f64, message: &str);

    /// Report a log line.
    fn log(&self, message: &str) {
        let _ = message;
    }
}

impl<F> ProgressSink for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn progress(&self, progress: f64, message: &str) {
        self(progress, message);
    }
}

struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&self, _progress: f64, _message: &str) {}
}

/// A cooperative cancellation flag shared between a task and its manager.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a new token that is not canceled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The context a task runs in: where it reports progress and how it learns of cancellation.
///
/// Tasks check [`is_canceled`](TaskContext::is_canceled) between units of work and stop issuing further I/O once it is set.
#[derive(Clone)]
pub struct TaskContext {
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new(Arc::new(NoProgress), CancellationToken::new())
    }
}

impl TaskContext {
    /// Create a new task context.
    #[must_use]
    pub fn new(sink: Arc<dyn ProgressSink>, cancel: CancellationToken) -> Self {
        Self { sink, cancel }
    }

    /// Create a task context reporting to `sink` with a fresh cancellation token.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn ProgressSink>) -> Self {
        Self::new(sink, CancellationToken::new())
    }

    /// Report progress. `progress` is clamped to `[0, 1]`.
    pub fn progress(&self, progress: f64, message: impl AsRef<str>) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        tracing::trace!(progress, message = message.as_ref(), "task progress");
        self.sink.progress(progress, message.as_ref());
    }

    /// Report a log line.
    pub fn log(&self, message: impl AsRef<str>) {
        tracing::debug!(message = message.as_ref(), "task log");
        self.sink.log(message.as_ref());
    }

    /// The progress sink.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn ProgressSink> {
        self.sink.clone()
    }

    /// The cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn task_context_progress_clamped() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = events.clone();
            move |progress: f64, message: &str| events.lock().push((progress, message.to_string()))
        };
        let ctx = TaskContext::with_sink(Arc::new(sink));
        ctx.progress(0.5, "half");
        ctx.progress(1.5, "over");
        ctx.progress(f64::NAN, "nan");
        ctx.log("ignored by closures");
        assert_eq!(
            *events.lock(),
            [
                (0.5, "half".to_string()),
                (1.0, "over".to_string()),
                (0.0, "nan".to_string())
            ]
        );
    }

    #[test]
    fn cancellation_token_shared() {
        let ctx = TaskContext::default();
        let token = ctx.cancellation().clone();
        assert!(!ctx.is_canceled());
        token.cancel();
        assert!(ctx.is_canceled());
    }
}
