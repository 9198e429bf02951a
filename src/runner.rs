//! Background execution of opaque jobs.
//!
//! [`JobRunner::submit`] records the task as `pending` before returning,
//! then drives it on a [`TaskTracker`]:
//!
//! ```text
//! pending ──► running ──► finished(result)
//!    │           └──────► failed
//!    └──────────────────► failed      (never started)
//! ```
//!
//! Every transition is written to the registry and then published on the
//! task's status channel. Job failures and panics end in `failed` and are
//! logged; nothing is re-raised to the submitter.
//!
//! Accepted work is not cancelable. A client that stops watching only
//! tears down its own stream; the job runs to completion.
//! [`JobRunner::shutdown`] waits for every job in flight.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::error::{JobFailure, TaskError};
use crate::publisher::StatusPublisher;
use crate::registry::TaskRegistry;
use crate::types::TaskRecord;

/// An opaque unit of work, such as a retrieval query or a transcription.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use taskcast::{Job, JobFailure};
///
/// struct Echo;
///
/// #[async_trait]
/// impl Job for Echo {
///     async fn invoke(&self, input: Value) -> Result<Value, JobFailure> {
///         input.get("text").cloned().ok_or_else(|| JobFailure::new("missing text"))
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// Runs the work on `input` and returns its result.
    async fn invoke(&self, input: Value) -> Result<Value, JobFailure>;
}

/// A [`Job`] backed by an async closure. Build one with [`job_fn`].
pub struct FnJob<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnJob<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnJob").finish_non_exhaustive()
    }
}

/// Adapts an async closure into a [`Job`].
///
/// ```
/// use serde_json::json;
/// use taskcast::{job_fn, Job};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let job = job_fn(|input| async move { Ok(json!({"echo": input})) });
/// assert_eq!(job.invoke(json!(1)).await.unwrap(), json!({"echo": 1}));
/// # }
/// ```
pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobFailure>> + Send,
{
    FnJob { f }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobFailure>> + Send,
{
    async fn invoke(&self, input: Value) -> Result<Value, JobFailure> {
        (self.f)(input).await
    }
}

/// Runs jobs in the background and records their lifecycle.
#[derive(Debug, Clone)]
pub struct JobRunner {
    registry: TaskRegistry,
    publisher: StatusPublisher,
    tracker: TaskTracker,
}

impl JobRunner {
    /// Creates a runner writing to `registry` and announcing on `publisher`.
    pub fn new(registry: TaskRegistry, publisher: StatusPublisher) -> Self {
        Self {
            registry,
            publisher,
            tracker: TaskTracker::new(),
        }
    }

    /// Records `task_id` as pending and starts `job` on `input` in the
    /// background.
    ///
    /// Returns once the pending record is written. If the runner has been
    /// shut down the task is recorded as failed instead of started.
    ///
    /// # Errors
    ///
    /// [`TaskError::AlreadyExists`] for a duplicate id, or the store
    /// failure that prevented the pending write.
    pub async fn submit(&self, job: Arc<dyn Job>, input: Value, task_id: &str) -> Result<(), TaskError> {
        let record = self.registry.create(task_id).await?;
        announce(&self.publisher, &record).await;

        if self.tracker.is_closed() {
            warn!(task_id, "runner is shut down, failing task without running it");
            settle(&self.registry, &self.publisher, task_id, Outcome::NotStarted).await;
            return Ok(());
        }

        let registry = self.registry.clone();
        let publisher = self.publisher.clone();
        let task_id = task_id.to_string();
        self.tracker
            .spawn(drive(registry, publisher, job, input, task_id));
        Ok(())
    }

    /// As [`submit`](Self::submit) with a fresh UUIDv4 task id, which is
    /// returned.
    pub async fn submit_new(&self, job: Arc<dyn Job>, input: Value) -> Result<String, TaskError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.submit(job, input, &task_id).await?;
        Ok(task_id)
    }

    /// Number of jobs still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting work and waits for every job in flight to settle.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        debug!("job runner drained");
    }
}

enum Outcome {
    Finished(Value),
    Failed,
    NotStarted,
}

async fn drive(
    registry: TaskRegistry,
    publisher: StatusPublisher,
    job: Arc<dyn Job>,
    input: Value,
    task_id: String,
) {
    match registry.mark_running(&task_id).await {
        Ok(record) => announce(&publisher, &record).await,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "failed to mark task running");
            settle(&registry, &publisher, &task_id, Outcome::NotStarted).await;
            return;
        },
    }

    let outcome = match AssertUnwindSafe(job.invoke(input)).catch_unwind().await {
        Ok(Ok(result)) => Outcome::Finished(result),
        Ok(Err(failure)) => {
            warn!(task_id = %task_id, error = %failure, "job failed");
            Outcome::Failed
        },
        Err(panic) => {
            error!(task_id = %task_id, panic = %panic_message(panic.as_ref()), "job panicked");
            Outcome::Failed
        },
    };
    settle(&registry, &publisher, &task_id, outcome).await;
}

async fn settle(registry: &TaskRegistry, publisher: &StatusPublisher, task_id: &str, outcome: Outcome) {
    let written = match outcome {
        Outcome::Finished(result) => registry.mark_finished(task_id, result).await,
        Outcome::Failed | Outcome::NotStarted => registry.mark_failed(task_id).await,
    };
    match written {
        Ok(record) => announce(publisher, &record).await,
        Err(e) => warn!(task_id, error = %e, "failed to record task outcome"),
    }
}

async fn announce(publisher: &StatusPublisher, record: &TaskRecord) {
    match publisher.publish(&record.id, record).await {
        Ok(receivers) => debug!(task_id = %record.id, status = %record.status, receivers, "status published"),
        Err(e) => warn!(task_id = %record.id, error = %e, "failed to publish status"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
