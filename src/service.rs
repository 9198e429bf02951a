//! One handle wiring every component over a single store.
//!
//! [`TaskService`] is what an HTTP layer would hold: `submit` answers a
//! submission request with a task id straight away, `stream` answers a
//! status request with a [`TaskStream`]. There is no global connection;
//! the store handle is passed in, and [`TaskService::shutdown`] drains
//! the background jobs.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use serde_json::json;
//! use taskcast::config::CoordConfig;
//! use taskcast::store::InMemoryStore;
//! use taskcast::stream::StreamMode;
//! use taskcast::{job_fn, TaskService, TaskStatus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> taskcast::Result<()> {
//! let service = TaskService::new(Arc::new(InMemoryStore::new()), CoordConfig::default())?;
//!
//! let job = Arc::new(job_fn(|input| async move { Ok(json!({"answer": input["q"]})) }));
//! let task_id = service.submit(job, json!({"q": "why"})).await?;
//! service.shutdown().await;
//!
//! let frames: Vec<_> = service.stream(&task_id, StreamMode::Push).await?.collect().await;
//! let last = frames.last().and_then(|f| f.record()).unwrap();
//! assert_eq!(last.status, TaskStatus::Finished);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::config::CoordConfig;
use crate::error::Result;
use crate::lock::LockManager;
use crate::publisher::StatusPublisher;
use crate::registry::TaskRegistry;
use crate::runner::{Job, JobRunner};
use crate::store::KvStore;
use crate::stream::{StreamMode, StreamMultiplexer, StreamOptions, TaskStream};

/// Task coordination facade.
#[derive(Debug, Clone)]
pub struct TaskService {
    config: CoordConfig,
    locks: LockManager,
    registry: TaskRegistry,
    publisher: StatusPublisher,
    runner: JobRunner,
    streams: StreamMultiplexer,
}

impl TaskService {
    /// Builds every component over `store`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`](crate::config::ConfigError::Invalid) if
    /// `config` does not validate.
    pub fn new(store: Arc<dyn KvStore>, config: CoordConfig) -> Result<Self> {
        config.validate()?;
        let prefix = config.store.key_prefix.clone();

        let locks = LockManager::new(Arc::clone(&store), prefix.clone(), config.lock.to_lock_config());
        let registry = TaskRegistry::new(Arc::clone(&store), prefix.clone())
            .with_record_ttl(config.registry.record_ttl());
        let publisher = StatusPublisher::new(store, prefix);
        let runner = JobRunner::new(registry.clone(), publisher.clone());
        let streams = StreamMultiplexer::new(
            registry.clone(),
            publisher.clone(),
            StreamOptions::from(&config.stream),
        );

        tracing::debug!(prefix = %config.store.key_prefix, "task service ready");
        Ok(Self {
            config,
            locks,
            registry,
            publisher,
            runner,
            streams,
        })
    }

    /// Connects to Redis at `config.store.url` and builds the service.
    ///
    /// # Errors
    ///
    /// Connection failures and invalid configuration.
    #[cfg(feature = "redis")]
    pub async fn connect(config: CoordConfig) -> Result<Self> {
        let store = crate::store::RedisStore::connect(&config.store.url).await?;
        Self::new(Arc::new(store), config)
    }

    /// Submits `job` on `input` under a fresh task id and returns the id as
    /// soon as the pending record is written.
    pub async fn submit(&self, job: Arc<dyn Job>, input: Value) -> Result<String> {
        Ok(self.runner.submit_new(job, input).await?)
    }

    /// Submits `job` under a caller-chosen task id.
    pub async fn submit_with_id(&self, task_id: &str, job: Arc<dyn Job>, input: Value) -> Result<()> {
        Ok(self.runner.submit(job, input, task_id).await?)
    }

    /// Opens a status stream for `task_id`.
    pub async fn stream(&self, task_id: &str, mode: StreamMode) -> Result<TaskStream> {
        Ok(self.streams.open(task_id, mode).await?)
    }

    /// The lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// The task registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The status publisher.
    pub fn publisher(&self) -> &StatusPublisher {
        &self.publisher
    }

    /// The configuration in effect.
    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    /// Stops accepting jobs and waits for those in flight.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }
}
