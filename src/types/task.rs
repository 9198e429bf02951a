//! Task status and task record wire types.
//!
//! A [`TaskRecord`] serializes to exactly the payload carried by the
//! registry, the status channel and the server-push stream:
//!
//! ```json
//! {"id": "T1", "status": "finished", "result": "OK"}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

/// Task lifecycle status.
///
/// # State Machine
///
/// ```text
/// Pending  -> Running, Failed
/// Running  -> Finished, Failed
/// Finished -> (terminal, no transitions)
/// Failed   -> (terminal, no transitions)
/// ```
///
/// `Pending -> Failed` covers work that never started (the runner was shut
/// down, or the job panicked before its first status write). Self
/// transitions are rejected.
///
/// # Examples
///
/// ```
/// use taskcast::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Running));
/// assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Finished));
/// assert!(!TaskStatus::Finished.can_transition_to(&TaskStatus::Failed));
/// assert!(TaskStatus::Failed.is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, not started.
    Pending,
    /// Work in progress.
    Running,
    /// Work completed with a result (terminal).
    Finished,
    /// Work failed (terminal).
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl TaskStatus {
    /// Returns `true` for `Finished` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Returns `true` if moving from this status to `next` is allowed.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed),
            Self::Running => matches!(next, Self::Finished | Self::Failed),
            Self::Finished | Self::Failed => false,
        }
    }

    /// Validates a transition, returning [`TaskError::InvalidTransition`]
    /// when the state machine rejects it.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskcast::TaskStatus;
    ///
    /// assert!(TaskStatus::Running
    ///     .validate_transition("t1", &TaskStatus::Finished)
    ///     .is_ok());
    /// assert!(TaskStatus::Finished
    ///     .validate_transition("t1", &TaskStatus::Running)
    ///     .is_err());
    /// ```
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// One job's lifecycle state as stored in the registry.
///
/// `result` is opaque to this crate: the empty string until the job
/// finishes, then whatever the job returned.
///
/// # Examples
///
/// ```
/// use taskcast::{TaskRecord, TaskStatus};
/// use serde_json::json;
///
/// let record = TaskRecord::pending("T1");
/// assert_eq!(
///     serde_json::to_value(&record).unwrap(),
///     json!({"id": "T1", "status": "pending", "result": ""})
/// );
///
/// let done = record.transition(TaskStatus::Running).unwrap()
///     .finish(json!("OK")).unwrap();
/// assert_eq!(done.status, TaskStatus::Finished);
/// assert_eq!(done.result, json!("OK"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Opaque task identifier.
    pub id: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Opaque result payload.
    pub result: Value,
}

impl TaskRecord {
    /// A freshly submitted record: `pending` with an empty result.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            result: Value::String(String::new()),
        }
    }

    /// A record in the given status with an empty result.
    ///
    /// Used for synthetic events such as heartbeats.
    pub fn with_status(id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: id.into(),
            status,
            result: Value::String(String::new()),
        }
    }

    /// Returns `true` if the record is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves to `next`, keeping the current result.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidTransition`] if the state machine rejects it.
    pub fn transition(mut self, next: TaskStatus) -> Result<Self, TaskError> {
        self.status.validate_transition(&self.id, &next)?;
        self.status = next;
        Ok(self)
    }

    /// Moves to `finished` with the job's result.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidTransition`] unless the record is `running`.
    pub fn finish(self, result: Value) -> Result<Self, TaskError> {
        let mut record = self.transition(TaskStatus::Finished)?;
        record.result = result;
        Ok(record)
    }
}
