use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The status of a task.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Submitted and waiting for a worker.
    #[display("queued")]
    Queued,
    /// Running.
    #[display("running")]
    Running,
    /// Completed successfully.
    #[display("succeeded")]
    Succeeded,
    /// Completed with an error.
    #[display("failed")]
    Failed,
    /// Stopped at a cancellation request.
    #[display("canceled")]
    Canceled,
}

impl TaskStatus {
    /// Returns true if the task has completed and its record will not change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("unknown task status {s:?}")),
        }
    }
}

/// A progress report of a running task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    /// The fraction of the task completed, in `[0, 1]`.
    pub progress: f64,
    /// A human readable description of the current step.
    pub message: String,
    /// When the progress was reported.
    pub timestamp: DateTime<Utc>,
}

/// The record of a submitted task.
///
/// The record is the single source of truth for a task: progress events and log lines are appended to it as they are reported, and it is retained after completion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskRecord {
    /// The task identifier.
    pub id: String,
    /// The kind of task, e.g. `crop` or `movie`.
    pub kind: String,
    /// The status.
    pub status: TaskStatus,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task completed.
    pub finished_at: Option<DateTime<Utc>>,
    /// The task request.
    pub request: serde_json::Value,
    /// The task result, `{"ok": true, ...}` or `{"ok": false, "error": ...}`.
    pub result: Option<serde_json::Value>,
    /// The error message of a failed task.
    pub error: Option<String>,
    /// Log lines.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Progress events, oldest first.
    #[serde(default)]
    pub progress_events: Vec<ProgressEvent>,
}

impl TaskRecord {
    /// Create a new queued task record with a random identifier.
    #[must_use]
    pub fn new(kind: impl Into<String>, request: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind: kind.into(),
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            request,
            result: None,
            error: None,
            logs: Vec::new(),
            progress_events: Vec::new(),
        }
    }

    /// The most recent progress, or zero if none has been reported.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.progress_events
            .last()
            .map_or(0.0, |event| event.progress)
    }
}
