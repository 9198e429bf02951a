//! Per-stream task group.
//!
//! Owns the background tasks feeding one [`TaskStream`](super::TaskStream):
//! a cancellation token they all watch, the tracker they run on, and their
//! join handles so panics can be reported. Teardown (cancel + close) runs
//! once no matter how many paths request it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Cleanup failures reported by tasks in the group.
pub(crate) type FailureLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug)]
pub(crate) struct TaskGroup {
    token: CancellationToken,
    tracker: TaskTracker,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    failures: FailureLog,
    torn_down: AtomicBool,
}

impl TaskGroup {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            handles: Mutex::new(Vec::new()),
            failures: Arc::new(Mutex::new(Vec::new())),
            torn_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn failures(&self) -> FailureLog {
        Arc::clone(&self.failures)
    }

    pub(crate) fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(fut);
        self.handles.lock().push((name, handle));
    }

    /// Number of group tasks still running.
    pub(crate) fn active(&self) -> usize {
        self.tracker.len()
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Cancels every task and closes the tracker. Returns `true` only for
    /// the call that actually did it.
    pub(crate) fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        self.tracker.close();
        true
    }

    /// Waits for every task and returns all recorded cleanup failures,
    /// including panics.
    pub(crate) async fn join(&self) -> Vec<String> {
        let handles = std::mem::take(&mut *self.handles.lock());
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                self.failures.lock().push(format!("{name}: {e}"));
            }
        }
        self.tracker.wait().await;
        std::mem::take(&mut *self.failures.lock())
    }
}
