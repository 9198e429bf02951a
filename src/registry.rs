//! Store-backed task status records.
//!
//! One JSON record per task at `{prefix}:task:{task_id}`, rewritten in full
//! on every transition and given the configured record TTL each time, so a
//! finished task eventually reads as absent.
//!
//! Writes are last-writer-wins with no compare-and-swap: the runner that
//! created a task is its only writer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::TaskError;
use crate::store::KvStore;
use crate::types::{TaskRecord, TaskStatus};

/// Default record retention.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(86_400);

/// Reads and writes task records, enforcing the status state machine.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use taskcast::registry::TaskRegistry;
/// use taskcast::store::InMemoryStore;
/// use taskcast::TaskStatus;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let registry = TaskRegistry::new(Arc::new(InMemoryStore::new()), "app");
/// registry.create("T1").await.unwrap();
/// registry.mark_running("T1").await.unwrap();
/// registry.mark_finished("T1", json!("OK")).await.unwrap();
///
/// let record = registry.get("T1").await.unwrap().unwrap();
/// assert_eq!(record.status, TaskStatus::Finished);
/// assert_eq!(record.result, json!("OK"));
/// assert!(registry.get("unknown").await.unwrap().is_none());
/// # }
/// ```
#[derive(Clone)]
pub struct TaskRegistry {
    store: Arc<dyn KvStore>,
    prefix: String,
    record_ttl: Duration,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("prefix", &self.prefix)
            .field("record_ttl", &self.record_ttl)
            .finish_non_exhaustive()
    }
}

impl TaskRegistry {
    /// Creates a registry with the default record TTL.
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            record_ttl: DEFAULT_RECORD_TTL,
        }
    }

    /// Sets the record TTL (builder pattern).
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    /// The store key holding `task_id`'s record.
    pub fn key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    /// Writes a fresh `pending` record.
    ///
    /// # Errors
    ///
    /// [`TaskError::AlreadyExists`] if the id is taken.
    pub async fn create(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        let record = TaskRecord::pending(task_id);
        let written = self
            .store
            .set_if_absent(&self.key(task_id), &encode(&record), Some(self.record_ttl))
            .await?;
        if !written {
            return Err(TaskError::AlreadyExists {
                task_id: task_id.to_string(),
            });
        }
        debug!(task_id, "task created");
        Ok(record)
    }

    /// Returns the current record, or `None` if it never existed or has
    /// expired.
    ///
    /// # Errors
    ///
    /// [`TaskError::Corrupt`] if the stored value does not decode.
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        let Some(raw) = self.store.get(&self.key(task_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| TaskError::Corrupt {
                task_id: task_id.to_string(),
                message: e.to_string(),
            })
    }

    /// `pending -> running`.
    pub async fn mark_running(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.update(task_id, |record| record.transition(TaskStatus::Running))
            .await
    }

    /// `running -> finished`, storing `result`.
    pub async fn mark_finished(&self, task_id: &str, result: Value) -> Result<TaskRecord, TaskError> {
        self.update(task_id, |record| record.finish(result)).await
    }

    /// `pending | running -> failed`. The result stays empty.
    pub async fn mark_failed(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.update(task_id, |record| record.transition(TaskStatus::Failed))
            .await
    }

    async fn update<F>(&self, task_id: &str, apply: F) -> Result<TaskRecord, TaskError>
    where
        F: FnOnce(TaskRecord) -> Result<TaskRecord, TaskError>,
    {
        let current = self.get(task_id).await?.ok_or_else(|| TaskError::NotFound {
            task_id: task_id.to_string(),
        })?;
        let from = current.status;
        let next = apply(current)?;
        self.store
            .set(&self.key(task_id), &encode(&next), Some(self.record_ttl))
            .await?;
        debug!(task_id, %from, to = %next.status, "task transitioned");
        Ok(next)
    }
}

fn encode(record: &TaskRecord) -> String {
    // TaskRecord holds only strings, an enum and a JSON value.
    serde_json::to_string(record).unwrap_or_default()
}
