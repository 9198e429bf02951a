//! Error types for task coordination.
//!
//! Each layer has its own error enum carrying the context needed to debug
//! it (task id, resource name, fencing token). The crate-level [`Error`]
//! wraps all of them so callers that drive several layers at once (the
//! [`TaskService`](crate::service::TaskService) facade, mostly) can use `?`
//! throughout.
//!
//! | Kind | Type |
//! |------|------|
//! | store unreachable | [`StoreError::Connection`] |
//! | lock acquire exceeded its bound | [`LockError::Timeout`] |
//! | lease expired under a holder | [`LockError::LeaseLost`], [`LockError::StaleFence`] |
//! | task record absent on a mark | [`TaskError::NotFound`] |
//! | work failed inside the runner | [`JobFailure`] (never propagated past submission) |
//! | one or more stream cleanup steps failed | [`StreamTeardownError`] |

use std::time::Duration;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::types::task::TaskStatus;

/// Convenience alias for results using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error wrapping every layer's error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key-value store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lock acquisition or lease failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Task registry failure.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Stream cleanup failure.
    #[error(transparent)]
    Teardown(#[from] StreamTeardownError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised by the task registry.
///
/// Note that reading an absent record is **not** an error:
/// [`TaskRegistry::get`](crate::registry::TaskRegistry::get) returns `None`
/// for unknown or expired ids. [`TaskError::NotFound`] only appears when a
/// state transition targets a record that does not exist.
///
/// # Examples
///
/// ```
/// use taskcast::{TaskError, TaskStatus};
///
/// let err = TaskError::InvalidTransition {
///     task_id: "t1".to_string(),
///     from: TaskStatus::Finished,
///     to: TaskStatus::Running,
/// };
/// assert!(err.to_string().contains("finished"));
/// assert!(err.to_string().contains("t1"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// No record exists for the task id.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The task id that was looked up.
        task_id: String,
    },

    /// A record already exists for the task id.
    #[error("task already exists: {task_id}")]
    AlreadyExists {
        /// The duplicated task id.
        task_id: String,
    },

    /// The state machine rejected a transition.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task being transitioned.
        task_id: String,
        /// Current status.
        from: TaskStatus,
        /// Rejected target status.
        to: TaskStatus,
    },

    /// The stored record could not be decoded.
    #[error("corrupt record for task {task_id}: {message}")]
    Corrupt {
        /// The task whose record is unreadable.
        task_id: String,
        /// Decoder message.
        message: String,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the lock manager.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// An acquire loop exceeded its configured bound.
    ///
    /// Anything acquired on the way (a reader-count increment, the
    /// operation-lock) has already been rolled back when this is returned.
    #[error("timed out after {waited:?} acquiring {stage} for resource {resource}")]
    Timeout {
        /// The locked resource name.
        resource: String,
        /// Which key the loop was waiting on.
        stage: LockStage,
        /// How long the loop waited.
        waited: Duration,
    },

    /// The holder's lease expired and the key was taken over or removed.
    #[error("lease lost on {stage} for resource {resource}")]
    LeaseLost {
        /// The locked resource name.
        resource: String,
        /// Which key lost its lease.
        stage: LockStage,
        /// The holder's fencing token, for write holds.
        token: Option<u64>,
    },

    /// A fencing token no longer matches the current write holder.
    #[error("stale fencing token {token} for resource {resource}")]
    StaleFence {
        /// The locked resource name.
        resource: String,
        /// The rejected token.
        token: u64,
    },

    /// A lock key held a value this manager did not write.
    #[error("unexpected value {value:?} in {stage} for resource {resource}")]
    Corrupt {
        /// The locked resource name.
        resource: String,
        /// Which key held the value.
        stage: LockStage,
        /// The raw value.
        value: String,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Identifies one of the lock's derived keys in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStage {
    /// The operation-lock guarding reader-count mutations.
    OperationLock,
    /// The exclusive write-flag.
    WriteFlag,
    /// The reader counter.
    ReadCount,
}

impl std::fmt::Display for LockStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OperationLock => write!(f, "operation lock"),
            Self::WriteFlag => write!(f, "write flag"),
            Self::ReadCount => write!(f, "read count"),
        }
    }
}

/// Failure reported by an opaque job collaborator.
///
/// The runner records it as a `failed` task and logs the message; it never
/// reaches the submitter.
///
/// # Examples
///
/// ```
/// use taskcast::JobFailure;
///
/// let failure = JobFailure::new("model not loaded");
/// assert_eq!(failure.to_string(), "model not loaded");
///
/// let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.wav");
/// let failure = JobFailure::from_error(&io);
/// assert!(failure.message().contains("missing.wav"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    message: String,
}

impl JobFailure {
    /// Creates a failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Captures the display text of any error.
    pub fn from_error(err: &dyn std::error::Error) -> Self {
        Self::new(err.to_string())
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for JobFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// One or more stream cleanup steps failed.
///
/// Teardown is fan-out: every step runs even if an earlier one failed, and
/// each failure is listed here.
#[derive(Debug, thiserror::Error)]
#[error("teardown of stream for task {task_id} failed: {}", .failures.join("; "))]
pub struct StreamTeardownError {
    /// The task the stream was observing.
    pub task_id: String,
    /// One message per failed cleanup step.
    pub failures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_display_messages() {
        let err = TaskError::NotFound {
            task_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "task not found: abc");

        let err = TaskError::AlreadyExists {
            task_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "task already exists: abc");

        let err = TaskError::InvalidTransition {
            task_id: "t".to_string(),
            from: TaskStatus::Failed,
            to: TaskStatus::Finished,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition from failed to finished for task t"
        );
    }

    #[test]
    fn lock_timeout_names_stage_and_resource() {
        let err = LockError::Timeout {
            resource: "index".to_string(),
            stage: LockStage::WriteFlag,
            waited: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("write flag"));
        assert!(msg.contains("index"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn teardown_error_lists_every_failure() {
        let err = StreamTeardownError {
            task_id: "t9".to_string(),
            failures: vec!["unsubscribe: closed".to_string(), "heartbeat: panicked".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("t9"));
        assert!(msg.contains("unsubscribe: closed; heartbeat: panicked"));
    }

    #[test]
    fn crate_error_wraps_layers_transparently() {
        let err: Error = TaskError::NotFound {
            task_id: "x".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "task not found: x");

        let err: Error = StoreError::Connection {
            message: "refused".to_string(),
            source: None,
        }
        .into();
        assert!(err.to_string().contains("refused"));
    }
}
