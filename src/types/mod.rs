//! Wire types shared by the registry, the status channel and the stream.

pub mod task;

pub use task::{TaskRecord, TaskStatus};

/// A live status event on a task channel.
///
/// Same shape as a stored [`TaskRecord`]; events are never persisted.
pub type StatusEvent = TaskRecord;
