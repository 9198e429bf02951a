//! Task coordination and status streaming over a shared key-value store.
//!
//! Long-running jobs (document indexing, retrieval queries, transcription)
//! are started by one request and observed by others. This crate provides
//! the pieces in between:
//!
//! - a readers/writer lock with leases and fencing tokens, built only from
//!   single-key store atomics;
//! - a task registry enforcing `pending -> running -> finished | failed`;
//! - per-task status channels with at-most-once delivery;
//! - a job runner that drives the registry and isolates job failures;
//! - a stream multiplexer producing one server-push frame sequence per
//!   client, by polling or by channel relay with heartbeats.
//!
//! # Module Organization
//!
//! - [`store`] - `KvStore` trait, in-memory and Redis backends
//! - [`lock`] - distributed readers/writer lock
//! - [`registry`] - task records and the status state machine
//! - [`publisher`] - per-task status channels
//! - [`runner`] - background job execution
//! - [`stream`] - polling and push streams, server-push frames
//! - [`service`] - facade wiring everything over one store handle
//! - [`config`] - TOML and environment configuration
//! - [`error`] - error types
//!
//! # Feature Flags
//!
//! - `logging` (default): [`logging::init`] installs a `tracing-subscriber`
//!   formatter.
//! - `redis`: the Redis backend and `TaskService::connect`.
//! - `redis-tests`: contract tests against a live Redis (`REDIS_URL`).

pub mod config;
pub mod error;
pub mod lock;
#[cfg(feature = "logging")]
pub mod logging;
pub mod publisher;
pub mod registry;
pub mod runner;
pub mod service;
pub mod store;
pub mod stream;
pub mod types;

// Re-exports for ergonomic access
pub use config::CoordConfig;
pub use error::{Error, JobFailure, LockError, Result, StreamTeardownError, TaskError};
pub use lock::{LockConfig, LockManager, ReadGuard, WriteGuard};
pub use runner::{job_fn, Job, JobRunner};
pub use service::TaskService;
pub use store::{InMemoryStore, KvStore, StoreError};
pub use stream::{SseFrame, StreamMode, TaskStream};
pub use types::{StatusEvent, TaskRecord, TaskStatus};
