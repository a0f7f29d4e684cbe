use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};

use crate::{
    config::global_config,
    crop::{run_crop, CropRequest},
    movie::{MovieRenderer, MovieRequest},
};

use super::{
    CancellationToken, ProgressEvent, ProgressSink, TaskContext, TaskError, TaskRecord, TaskStatus,
};

/// A live notification about a task.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskEvent {
    /// A progress event was appended to the task record.
    Progress {
        /// The task identifier.
        task_id: String,
        /// The progress event.
        #[serde(flatten)]
        event: ProgressEvent,
    },
    /// A log line was appended to the task record.
    Log {
        /// The task identifier.
        task_id: String,
        /// The log line.
        message: String,
    },
    /// The task changed status.
    Status {
        /// The task identifier.
        task_id: String,
        /// The new status.
        status: TaskStatus,
    },
}

impl TaskEvent {
    /// The identifier of the task the event is about.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress { task_id, .. }
            | Self::Log { task_id, .. }
            | Self::Status { task_id, .. } => task_id,
        }
    }
}

struct TaskEntry {
    record: TaskRecord,
    cancel: CancellationToken,
}

/// A record snapshot to write, with an optional acknowledgement sent once it and everything queued before it is on disk.
struct PersistRequest {
    record: Box<TaskRecord>,
    written: Option<oneshot::Sender<()>>,
}

/// Writes queued record snapshots in order, keeping only the latest snapshot of each task in a batch.
async fn run_persister(storage_dir: PathBuf, mut requests: mpsc::UnboundedReceiver<PersistRequest>) {
    while let Some(first) = requests.recv().await {
        let mut latest: HashMap<String, TaskRecord> = HashMap::new();
        let mut acks = Vec::new();
        let mut next = Some(first);
        while let Some(request) = next {
            latest.insert(request.record.id.clone(), *request.record);
            acks.extend(request.written);
            next = requests.try_recv().ok();
        }
        let storage_dir = storage_dir.clone();
        let records: Vec<TaskRecord> = latest.into_values().collect();
        if let Err(err) =
            tokio::task::spawn_blocking(move || write_records(&storage_dir, &records)).await
        {
            tracing::warn!(error = %err, "task record writer failed");
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
}

fn write_records(storage_dir: &Path, records: &[TaskRecord]) {
    for record in records {
        let path = storage_dir.join(format!("{}.json", record.id));
        let result = serde_json::to_vec_pretty(record)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(&path, json));
        if let Err(err) = result {
            tracing::warn!(path = %path.display(), error = %err, "failed to persist task record");
        }
    }
}

struct TaskManagerInner {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    storage_dir: Option<PathBuf>,
    persister: OnceLock<mpsc::UnboundedSender<PersistRequest>>,
    events: broadcast::Sender<TaskEvent>,
    workers: Arc<Semaphore>,
}

impl TaskManagerInner {
    /// Update the record of `task_id` under the lock, persist it, then broadcast `event`.
    fn update(
        &self,
        task_id: &str,
        update: impl FnOnce(&mut TaskRecord),
        event: impl FnOnce(&TaskRecord) -> TaskEvent,
    ) {
        let (event, snapshot) = {
            let mut tasks = self.tasks.lock();
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            update(&mut entry.record);
            let event = event(&entry.record);
            let snapshot = self.storage_dir.as_ref().map(|_| entry.record.clone());
            (event, snapshot)
        };
        if let Some(record) = snapshot {
            self.persist(record, None);
        }
        // no receivers is not an error
        let _ = self.events.send(event);
    }

    fn set_status(&self, task_id: &str, status: TaskStatus, update: impl FnOnce(&mut TaskRecord)) {
        self.update(
            task_id,
            |record| {
                record.status = status;
                update(record);
            },
            |record| TaskEvent::Status {
                task_id: record.id.clone(),
                status,
            },
        );
    }

    /// Move `task_id` to the terminal `status`.
    ///
    /// The final record is on disk before it becomes visible to [`TaskManager::get`] and [`TaskManager::wait`].
    async fn finish(&self, task_id: &str, status: TaskStatus, update: impl FnOnce(&mut TaskRecord)) {
        let snapshot = {
            let tasks = self.tasks.lock();
            let Some(entry) = tasks.get(task_id) else {
                return;
            };
            let mut record = entry.record.clone();
            record.status = status;
            update(&mut record);
            record
        };
        if self.storage_dir.is_some() {
            let (written, done) = oneshot::channel();
            self.persist(snapshot.clone(), Some(written));
            let _ = done.await;
        }
        let diverged = {
            let mut tasks = self.tasks.lock();
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            entry.record.status = snapshot.status;
            entry.record.result = snapshot.result.clone();
            entry.record.error = snapshot.error.clone();
            entry.record.finished_at = snapshot.finished_at;
            // a log line may have been appended while the snapshot was written
            (self.storage_dir.is_some() && entry.record != snapshot).then(|| entry.record.clone())
        };
        if let Some(record) = diverged {
            self.persist(record, None);
        }
        let _ = self.events.send(TaskEvent::Status {
            task_id: task_id.to_string(),
            status,
        });
    }

    /// Queue `record` to be written to `{id}.json`. Requires a Tokio runtime when `storage_dir` is set.
    fn persist(&self, record: TaskRecord, written: Option<oneshot::Sender<()>>) {
        let Some(storage_dir) = &self.storage_dir else {
            return;
        };
        let persister = self.persister.get_or_init(|| {
            let (sender, requests) = mpsc::unbounded_channel();
            tokio::spawn(run_persister(storage_dir.clone(), requests));
            sender
        });
        let task_id = record.id.clone();
        let request = PersistRequest {
            record: Box::new(record),
            written,
        };
        if persister.send(request).is_err() {
            tracing::warn!(task_id = %task_id, "task record writer stopped");
        }
    }
}

struct RecordSink {
    task_id: String,
    inner: Arc<TaskManagerInner>,
}

impl ProgressSink for RecordSink {
    fn progress(&self, progress: f64, message: &str) {
        let event = ProgressEvent {
            progress,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        let stored = event.clone();
        self.inner.update(
            &self.task_id,
            move |record| record.progress_events.push(stored),
            |record| TaskEvent::Progress {
                task_id: record.id.clone(),
                event,
            },
        );
    }

    fn log(&self, message: &str) {
        self.inner.update(
            &self.task_id,
            |record| record.logs.push(message.to_string()),
            |record| TaskEvent::Log {
                task_id: record.id.clone(),
                message: message.to_string(),
            },
        );
    }
}

/// Runs crop and movie tasks in the background and keeps their records.
///
/// Tasks run on the Tokio runtime, at most [`task_workers`](crate::config::Config#task-workers) at a time.
/// A task never returns an error to its submitter: failures are recorded in the [`TaskRecord`] with status [`TaskStatus::Failed`].
///
/// If the manager has a storage directory, every record is written there as pretty printed `{id}.json` at each status transition and progress report.
/// Writes happen in order on a blocking thread, off the task's reporting path, and a task's final record is on disk before [`TaskManager::wait`] returns it.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskManagerInner>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("storage_dir", &self.inner.storage_dir)
            .field("tasks", &self.inner.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    /// Create a task manager that keeps records in memory only.
    #[must_use]
    pub fn new() -> Self {
        let (workers, capacity) = {
            let config = global_config();
            (config.task_workers(), config.task_event_capacity())
        };
        Self::with_options(None, workers, capacity)
    }

    /// Create a task manager that also persists records to `storage_dir`, creating it if necessary.
    ///
    /// # Errors
    /// Returns an [`std::io::Error`] if `storage_dir` cannot be created.
    pub fn with_storage_dir(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;
        let (workers, capacity) = {
            let config = global_config();
            (config.task_workers(), config.task_event_capacity())
        };
        Ok(Self::with_options(Some(storage_dir), workers, capacity))
    }

    /// Create a task manager running at most `workers` tasks at once with `event_capacity` buffered events per subscriber.
    #[must_use]
    pub fn with_options(storage_dir: Option<PathBuf>, workers: usize, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(TaskManagerInner {
                tasks: Mutex::new(HashMap::new()),
                storage_dir,
                persister: OnceLock::new(),
                events,
                workers: Arc::new(Semaphore::new(workers.max(1))),
            }),
        }
    }

    /// Submit a task of `kind` running `runner`.
    ///
    /// The returned record is a snapshot of the queued task. The runner's output becomes the `result` of the record, merged with `"ok": true`.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime.
    pub fn submit<F, Fut>(&self, kind: &str, request: serde_json::Value, runner: F) -> TaskRecord
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        let record = TaskRecord::new(kind, request);
        let cancel = CancellationToken::new();
        let task_id = record.id.clone();
        self.inner.tasks.lock().insert(
            task_id.clone(),
            TaskEntry {
                record: record.clone(),
                cancel: cancel.clone(),
            },
        );
        self.inner.persist(record.clone(), None);
        tracing::info!(task_id = %task_id, kind, "task queued");
        let _ = self.inner.events.send(TaskEvent::Status {
            task_id: task_id.clone(),
            status: TaskStatus::Queued,
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
                inner
                    .finish(&task_id, TaskStatus::Failed, |record| {
                        record.error = Some("task manager shut down".to_string());
                        record.finished_at = Some(Utc::now());
                    })
                    .await;
                return;
            };
            if cancel.is_canceled() {
                tracing::info!(task_id = %task_id, "task canceled before start");
                inner
                    .finish(&task_id, TaskStatus::Canceled, |record| {
                        record.result = Some(failure_result(&TaskError::Canceled));
                        record.finished_at = Some(Utc::now());
                    })
                    .await;
                return;
            }

            inner.set_status(&task_id, TaskStatus::Running, |record| {
                record.started_at = Some(Utc::now());
            });
            tracing::info!(task_id = %task_id, "task running");

            let sink = Arc::new(RecordSink {
                task_id: task_id.clone(),
                inner: inner.clone(),
            });
            let ctx = TaskContext::new(sink, cancel.clone());
            let outcome = runner(ctx).await;

            // the outcome decides the status: a task that finished or failed despite a cancellation request keeps that result
            match outcome {
                Err(err) if err.is_canceled() => {
                    tracing::info!(task_id = %task_id, "task canceled");
                    inner
                        .finish(&task_id, TaskStatus::Canceled, |record| {
                            record.result = Some(failure_result(&TaskError::Canceled));
                            record.finished_at = Some(Utc::now());
                        })
                        .await;
                }
                Err(err) => {
                    tracing::warn!(task_id = %task_id, category = %err.category(), error = %err, "task failed");
                    inner
                        .finish(&task_id, TaskStatus::Failed, |record| {
                            record.result = Some(failure_result(&err));
                            record.error = Some(err.to_string());
                            record.finished_at = Some(Utc::now());
                        })
                        .await;
                }
                Ok(value) => {
                    tracing::info!(task_id = %task_id, "task finished");
                    inner
                        .finish(&task_id, TaskStatus::Succeeded, |record| {
                            record.result = Some(success_result(value));
                            record.finished_at = Some(Utc::now());
                        })
                        .await;
                }
            }
        });

        record
    }

    /// Submit a crop extraction task.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime.
    pub fn submit_crop(&self, request: CropRequest) -> TaskRecord {
        let json = serde_json::to_value(&request).unwrap_or_default();
        self.submit("crop", json, move |ctx| async move {
            let outcome = run_crop(&request, &ctx).await?;
            Ok(serde_json::to_value(outcome).unwrap_or_default())
        })
    }

    /// Submit a movie rendering task.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime.
    pub fn submit_movie(&self, request: MovieRequest, renderer: MovieRenderer) -> TaskRecord {
        let json = serde_json::to_value(&request).unwrap_or_default();
        self.submit("movie", json, move |ctx| async move {
            let outcome = renderer.render(&request, &ctx).await?;
            Ok(serde_json::to_value(outcome).unwrap_or_default())
        })
    }

    /// Get a snapshot of the record of `task_id`.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner
            .tasks
            .lock()
            .get(task_id)
            .map(|entry| entry.record.clone())
    }

    /// List snapshots of all task records, optionally only those with `status`, oldest first.
    #[must_use]
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|entry| status.map_or(true, |status| entry.record.status == status))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Get the log lines of `task_id`.
    #[must_use]
    pub fn logs(&self, task_id: &str) -> Option<Vec<String>> {
        self.inner
            .tasks
            .lock()
            .get(task_id)
            .map(|entry| entry.record.logs.clone())
    }

    /// Request cancellation of `task_id`.
    ///
    /// Returns false if the task does not exist.
    /// Cancelling a completed task has no effect on its status.
    pub fn cancel(&self, task_id: &str) -> bool {
        let Some(cancel) = self
            .inner
            .tasks
            .lock()
            .get(task_id)
            .map(|entry| entry.cancel.clone())
        else {
            return false;
        };
        cancel.cancel();
        tracing::info!(task_id = %task_id, "cancellation requested");
        RecordSink {
            task_id: task_id.to_string(),
            inner: self.inner.clone(),
        }
        .log("Cancellation requested");
        true
    }

    /// Subscribe to live events of all tasks.
    ///
    /// Events are only delivered for changes after subscribing. A subscriber that falls more than [`task_event_capacity`](crate::config::Config#task-event-capacity) events behind skips the oldest.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until `task_id` reaches a terminal status and return its final record.
    ///
    /// Returns [`None`] if the task does not exist.
    pub async fn wait(&self, task_id: &str) -> Option<TaskRecord> {
        let mut events = self.subscribe();
        loop {
            let record = self.get(task_id)?;
            if record.status.is_terminal() {
                return Some(record);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.get(task_id),
            }
        }
    }
}

fn success_result(value: serde_json::Value) -> serde_json::Value {
    let mut result = serde_json::Map::new();
    result.insert("ok".to_string(), serde_json::Value::Bool(true));
    match value {
        serde_json::Value::Object(fields) => {
            result.extend(fields.into_iter().filter(|(key, _)| key != "ok"));
        }
        serde_json::Value::Null => {}
        value => {
            result.insert("value".to_string(), value);
        }
    }
    serde_json::Value::Object(result)
}

fn failure_result(err: &TaskError) -> serde_json::Value {
    serde_json::json!({
        "ok": false,
        "error": err.to_string(),
        "category": err.category(),
    })
}
