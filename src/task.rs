//! Background tasks.
//!
//! Crop extraction and movie rendering run as tasks under a [`TaskManager`].
//! Each task has a [`TaskRecord`] holding its status, request, result, log lines, and an append-only list of [`ProgressEvent`]s.
//! Live subscribers are notified of changes through a separate [`TaskEvent`] channel.
//!
//! Task failures never propagate to the submitter. A failed task is recorded with [`TaskStatus::Failed`], its error message, and an [`ErrorCategory`].

mod manager;
mod progress;
mod record;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use manager::{TaskEvent, TaskManager};
pub use progress::{CancellationToken, ProgressSink, TaskContext};
pub use record::{ProgressEvent, TaskRecord, TaskStatus};

use crate::{crop::CropError, movie::MovieError};

/// The category of a task failure.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A missing directory, file, or array.
    #[display("not_found")]
    NotFound,
    /// Unreadable or unsupported metadata.
    #[display("malformed")]
    Malformed,
    /// An unreadable source frame.
    #[display("decode_failure")]
    DecodeFailure,
    /// A chunk read that failed again after a retry with a fresh handle.
    #[display("transient_read_failure")]
    TransientReadFailure,
    /// The encoder could not be spawned or exited unsuccessfully.
    #[display("subprocess_failure")]
    SubprocessFailure,
    /// A request rejected before any I/O.
    #[display("invalid_request")]
    InvalidRequest,
    /// Any other I/O error.
    #[display("io")]
    Io,
    /// The task was canceled.
    #[display("canceled")]
    Canceled,
}

/// A task error.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A crop extraction error.
    #[error(transparent)]
    Crop(#[from] CropError),
    /// A movie rendering error.
    #[error(transparent)]
    Movie(#[from] MovieError),
    /// An invalid task request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The task was canceled.
    #[error("task canceled")]
    Canceled,
}

impl TaskError {
    /// The category of the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Crop(err) => err.category(),
            Self::Movie(err) => err.category(),
            Self::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            Self::Canceled => ErrorCategory::Canceled,
        }
    }

    /// Returns true if the task stopped at a cancellation request rather than failing.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Crop(CropError::Canceled) | Self::Movie(MovieError::Canceled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_category_names() {
        assert_eq!(ErrorCategory::NotFound.to_string(), "not_found");
        assert_eq!(
            serde_json::to_string(&ErrorCategory::SubprocessFailure).unwrap(),
            r#""subprocess_failure""#
        );
        assert_eq!(TaskError::Canceled.category(), ErrorCategory::Canceled);
        assert_eq!(
            TaskError::InvalidRequest(String::new()).category(),
            ErrorCategory::InvalidRequest
        );
    }

    #[test]
    fn task_error_is_canceled() {
        assert!(TaskError::Canceled.is_canceled());
        assert!(TaskError::from(CropError::Canceled).is_canceled());
        assert!(TaskError::from(MovieError::Canceled).is_canceled());
        assert!(!TaskError::from(MovieError::InvalidFps).is_canceled());
        assert!(!TaskError::InvalidRequest(String::new()).is_canceled());
    }
}
