//! Per-client task status streams.
//!
//! A [`StreamMultiplexer`] turns one task id into a [`TaskStream`] of
//! [`SseFrame`]s, in one of two modes:
//!
//! - [`StreamMode::Polling`]: read the registry now and every poll
//!   interval, emitting each record, until one is terminal.
//! - [`StreamMode::Push`]: subscribe to the task channel, then read the
//!   registry once (so a task that finished before the subscription is
//!   still seen exactly once), then relay channel events while a heartbeat
//!   emits a synthetic `running` record every heartbeat interval.
//!
//! In both modes an absent task yields a single `not_found` frame, and a
//! terminal frame is always the last one. A stream that ends without a
//! terminal frame because the store failed reports the failure from
//! [`TaskStream::close`].
//!
//! Each stream runs its producers in its own task group. The group is torn
//! down exactly once: when the terminal frame is yielded, when the stream
//! is dropped, or on [`TaskStream::close`]. Teardown never touches the job
//! itself.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use serde_json::json;
//! use taskcast::publisher::StatusPublisher;
//! use taskcast::registry::TaskRegistry;
//! use taskcast::store::InMemoryStore;
//! use taskcast::stream::{StreamMode, StreamMultiplexer, StreamOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryStore::new());
//! let registry = TaskRegistry::new(store.clone(), "app");
//! let mux = StreamMultiplexer::new(
//!     registry.clone(),
//!     StatusPublisher::new(store, "app"),
//!     StreamOptions::default(),
//! );
//!
//! registry.create("T1").await.unwrap();
//! registry.mark_running("T1").await.unwrap();
//! registry.mark_finished("T1", json!("OK")).await.unwrap();
//!
//! let frames: Vec<_> = mux.open("T1", StreamMode::Polling).await.unwrap().collect().await;
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].data, json!({"id": "T1", "status": "finished", "result": "OK"}));
//! # }
//! ```

mod group;
pub mod sse;

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StreamSettings;
use crate::error::StreamTeardownError;
use crate::publisher::{StatusPublisher, StatusSubscription};
use crate::registry::TaskRegistry;
use crate::store::StoreError;
use crate::types::{TaskRecord, TaskStatus};

use group::{FailureLog, TaskGroup};
pub use sse::{EventTag, FrameClock, SseFrame};

/// How a stream learns about status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Periodic registry reads.
    Polling,
    /// Channel events plus heartbeats.
    Push,
}

/// Stream timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Registry read interval in polling mode.
    pub poll_interval: Duration,
    /// Heartbeat interval in push mode.
    pub heartbeat_interval: Duration,
    /// Events buffered between the producers and the reader.
    pub buffer: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamSettings::default())
    }
}

impl From<&StreamSettings> for StreamOptions {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            heartbeat_interval: settings.heartbeat_interval(),
            buffer: settings.buffer,
        }
    }
}

/// What producers hand to the stream; ids are assigned on the way out.
#[derive(Debug)]
enum Event {
    Record(TaskRecord),
    NotFound,
}

/// Opens task streams.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    registry: TaskRegistry,
    publisher: StatusPublisher,
    options: StreamOptions,
}

impl StreamMultiplexer {
    /// Creates a multiplexer over `registry` and `publisher`.
    pub fn new(registry: TaskRegistry, publisher: StatusPublisher, options: StreamOptions) -> Self {
        Self {
            registry,
            publisher,
            options,
        }
    }

    /// The active timing options.
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Opens a stream for `task_id`.
    ///
    /// In push mode the channel subscription is live when this returns.
    ///
    /// # Errors
    ///
    /// The store failure that prevented subscribing (push mode only).
    pub async fn open(&self, task_id: &str, mode: StreamMode) -> Result<TaskStream, StoreError> {
        let (tx, rx) = mpsc::channel(self.options.buffer.max(1));
        let group = TaskGroup::new();

        match mode {
            StreamMode::Polling => {
                group.spawn(
                    "poll",
                    poll(
                        self.registry.clone(),
                        task_id.to_string(),
                        self.options.poll_interval,
                        tx,
                        group.token(),
                        group.failures(),
                    ),
                );
            },
            StreamMode::Push => {
                let subscription = self.publisher.subscribe(task_id).await?;
                let (started_tx, started_rx) = oneshot::channel();
                group.spawn(
                    "relay",
                    relay(
                        self.registry.clone(),
                        subscription,
                        tx.clone(),
                        group.token(),
                        group.failures(),
                        started_tx,
                    ),
                );
                group.spawn(
                    "heartbeat",
                    heartbeat(
                        task_id.to_string(),
                        self.options.heartbeat_interval,
                        tx,
                        group.token(),
                        started_rx,
                    ),
                );
            },
        }

        debug!(task_id, ?mode, "stream opened");
        Ok(TaskStream {
            task_id: task_id.to_string(),
            rx,
            clock: FrameClock::new(),
            group,
            done: false,
        })
    }
}

/// One client's view of one task.
///
/// Yields frames until a terminal frame (inclusive), the producers stop,
/// or the stream is closed.
#[derive(Debug)]
pub struct TaskStream {
    task_id: String,
    rx: mpsc::Receiver<Event>,
    clock: FrameClock,
    group: TaskGroup,
    done: bool,
}

impl TaskStream {
    /// The task being observed.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Background tasks still running for this stream.
    pub fn active_tasks(&self) -> usize {
        self.group.active()
    }

    /// `true` once teardown has run.
    pub fn is_torn_down(&self) -> bool {
        self.group.is_torn_down()
    }

    /// Encoded frames, ready to write to a server-push response.
    pub fn encoded(self) -> impl Stream<Item = String> + Send {
        self.map(|frame| frame.encode())
    }

    /// Tears the stream down and waits for its background tasks.
    ///
    /// # Errors
    ///
    /// [`StreamTeardownError`] listing every step that failed: store
    /// failures that ended the stream early (registry reads, the status
    /// subscription), unsubscribe errors and panicked tasks. All steps run
    /// regardless.
    pub async fn close(mut self) -> Result<(), StreamTeardownError> {
        self.finish();
        let failures = self.group.join().await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StreamTeardownError {
                task_id: self.task_id.clone(),
                failures,
            })
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.rx.close();
        if self.group.teardown() {
            debug!(task_id = %self.task_id, "stream torn down");
        }
    }
}

impl Stream for TaskStream {
    type Item = SseFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let id = self.clock.next_id();
                let frame = match event {
                    Event::Record(record) => SseFrame::message(id, &record),
                    Event::NotFound => SseFrame::not_found(id, &self.task_id),
                };
                if frame.is_terminal() {
                    self.finish();
                }
                Poll::Ready(Some(frame))
            },
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TaskStream {
    fn drop(&mut self) {
        if self.group.teardown() {
            debug!(task_id = %self.task_id, "stream dropped before completion");
        }
    }
}

/// Logs a failure that ended a stream early and keeps it for
/// [`TaskStream::close`].
fn record_failure(failures: &FailureLog, task_id: &str, step: &str, error: &dyn std::fmt::Display) {
    warn!(task_id, step, error = %error, "stream failed");
    failures.lock().push(format!("{step}: {error}"));
}

async fn poll(
    registry: TaskRegistry,
    task_id: String,
    interval: Duration,
    tx: mpsc::Sender<Event>,
    token: CancellationToken,
    failures: FailureLog,
) {
    loop {
        let event = match registry.get(&task_id).await {
            Ok(Some(record)) => Event::Record(record),
            Ok(None) => Event::NotFound,
            Err(e) => {
                record_failure(&failures, &task_id, "registry read", &e);
                return;
            },
        };
        let last = match &event {
            Event::Record(record) => record.is_terminal(),
            Event::NotFound => true,
        };
        if tx.send(event).await.is_err() || last {
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {},
        }
    }
}

async fn relay(
    registry: TaskRegistry,
    mut subscription: StatusSubscription,
    tx: mpsc::Sender<Event>,
    token: CancellationToken,
    failures: FailureLog,
    started: oneshot::Sender<()>,
) {
    let task_id = subscription.task_id().to_string();

    match registry.get(&task_id).await {
        Ok(None) => {
            let _ = tx.send(Event::NotFound).await;
        },
        Ok(Some(record)) if record.is_terminal() => {
            let _ = tx.send(Event::Record(record)).await;
        },
        Ok(Some(record)) => {
            let status = record.status;
            if tx.send(Event::Record(record)).await.is_ok() {
                let _ = started.send(());
                let relay = Relay {
                    task_id: &task_id,
                    registry: &registry,
                    tx: &tx,
                    token: &token,
                    failures: &failures,
                };
                relay.forward(&mut subscription, status).await;
            }
        },
        Err(e) => record_failure(&failures, &task_id, "registry read", &e),
    }

    token.cancel();
    if let Err(e) = subscription.unsubscribe().await {
        record_failure(&failures, &task_id, "unsubscribe", &e);
    }
}

/// Lifecycle position of a status; relayed events never move backwards.
fn stage(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::Running => 1,
        TaskStatus::Finished | TaskStatus::Failed => 2,
    }
}

struct Relay<'a> {
    task_id: &'a str,
    registry: &'a TaskRegistry,
    tx: &'a mpsc::Sender<Event>,
    token: &'a CancellationToken,
    failures: &'a FailureLog,
}

impl Relay<'_> {
    /// Relays channel events until a terminal one, cancellation, or the
    /// end of the subscription. `last` is the status already emitted;
    /// events older than it (published before the attach-time read) are
    /// dropped.
    async fn forward(&self, subscription: &mut StatusSubscription, mut last: TaskStatus) {
        let task_id = self.task_id;
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return,
                next = subscription.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if stage(event.status) < stage(last) {
                        debug!(task_id, status = %event.status, "dropping stale status event");
                        continue;
                    }
                    last = event.status;
                    let terminal = event.is_terminal();
                    if self.tx.send(Event::Record(event)).await.is_err() || terminal {
                        return;
                    }
                },
                Some(Err(e)) => {
                    record_failure(self.failures, task_id, "status subscription", &e);
                    break;
                },
                None => {
                    debug!(task_id, "status subscription closed");
                    break;
                },
            }
        }

        // The channel is gone; one last look so a task that finished
        // meanwhile still ends the stream.
        match self.registry.get(task_id).await {
            Ok(Some(record)) if record.is_terminal() => {
                let _ = self.tx.send(Event::Record(record)).await;
            },
            Ok(_) => {},
            Err(e) => record_failure(self.failures, task_id, "registry read", &e),
        }
    }
}

async fn heartbeat(
    task_id: String,
    interval: Duration,
    tx: mpsc::Sender<Event>,
    token: CancellationToken,
    started: oneshot::Receiver<()>,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        started = started => if started.is_err() { return },
    }

    let Some(first) = tokio::time::Instant::now().checked_add(interval) else {
        token.cancelled().await;
        return;
    };
    let mut ticker = tokio::time::interval_at(first, interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                let beat = TaskRecord::with_status(task_id.as_str(), TaskStatus::Running);
                if tx.send(Event::Record(beat)).await.is_err() {
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, KvStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<InMemoryStore>,
        registry: TaskRegistry,
        publisher: StatusPublisher,
        mux: StreamMultiplexer,
    }

    fn fixture(options: StreamOptions) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let registry = TaskRegistry::new(store.clone(), "t");
        let publisher = StatusPublisher::new(store.clone(), "t");
        let mux = StreamMultiplexer::new(registry.clone(), publisher.clone(), options);
        Fixture {
            store,
            registry,
            publisher,
            mux,
        }
    }

    fn fast() -> StreamOptions {
        StreamOptions {
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(20),
            buffer: 16,
        }
    }

    #[tokio::test]
    async fn unknown_task_yields_single_not_found_in_both_modes() {
        let f = fixture(fast());
        for mode in [StreamMode::Polling, StreamMode::Push] {
            let frames: Vec<_> = f.mux.open("ghost", mode).await.unwrap().collect().await;
            assert_eq!(frames.len(), 1, "{mode:?}");
            assert_eq!(frames[0].event, EventTag::NotFound);
            assert_eq!(frames[0].data, json!({"id": "ghost"}));
        }
    }

    #[tokio::test]
    async fn polling_emits_until_terminal() {
        let f = fixture(fast());
        f.registry.create("a").await.unwrap();
        f.registry.mark_running("a").await.unwrap();

        let stream = f.mux.open("a", StreamMode::Polling).await.unwrap();
        let registry = f.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            registry.mark_finished("a", json!("done")).await.unwrap();
        });

        let frames: Vec<_> = stream.collect().await;
        assert!(frames.len() >= 2);
        let last = frames.last().unwrap().record().unwrap();
        assert_eq!(last.status, TaskStatus::Finished);
        assert!(frames[..frames.len() - 1].iter().all(|f| !f.is_terminal()));
        assert!(frames.windows(2).all(|w| w[0].id <= w[1].id));
    }

    #[tokio::test]
    async fn push_relays_events_and_ends_on_terminal() {
        let f = fixture(StreamOptions {
            heartbeat_interval: Duration::from_secs(60),
            ..fast()
        });
        f.registry.create("a").await.unwrap();
        let mut stream = f.mux.open("a", StreamMode::Push).await.unwrap();

        let first = stream.next().await.unwrap().record().unwrap();
        assert_eq!(first.status, TaskStatus::Pending);

        let running = f.registry.mark_running("a").await.unwrap();
        f.publisher.publish("a", &running).await.unwrap();
        let finished = f.registry.mark_finished("a", json!(1)).await.unwrap();
        f.publisher.publish("a", &finished).await.unwrap();

        assert_eq!(stream.next().await.unwrap().record().unwrap(), running);
        assert_eq!(stream.next().await.unwrap().record().unwrap(), finished);
        assert!(stream.next().await.is_none());
        assert!(stream.is_torn_down());
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn push_on_finished_task_emits_it_once() {
        let f = fixture(fast());
        f.registry.create("a").await.unwrap();
        f.registry.mark_running("a").await.unwrap();
        f.registry.mark_finished("a", json!("OK")).await.unwrap();

        let frames: Vec<_> = f.mux.open("a", StreamMode::Push).await.unwrap().collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, json!({"id": "a", "status": "finished", "result": "OK"}));
    }

    #[tokio::test]
    async fn heartbeats_flow_while_running_and_stop_after_terminal() {
        let f = fixture(fast());
        f.registry.create("a").await.unwrap();
        f.registry.mark_running("a").await.unwrap();
        let mut stream = f.mux.open("a", StreamMode::Push).await.unwrap();

        // current record, then at least two heartbeats
        for _ in 0..3 {
            let record = stream.next().await.unwrap().record().unwrap();
            assert_eq!(record.status, TaskStatus::Running);
        }

        let failed = f.registry.mark_failed("a").await.unwrap();
        f.publisher.publish("a", &failed).await.unwrap();

        loop {
            let frame = stream.next().await.unwrap();
            if frame.is_terminal() {
                assert_eq!(frame.record().unwrap().status, TaskStatus::Failed);
                break;
            }
        }
        assert!(stream.next().await.is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(stream.active_tasks(), 0);
    }

    #[tokio::test]
    async fn dropping_stream_stops_producers_and_unsubscribes() {
        let f = fixture(fast());
        f.registry.create("a").await.unwrap();
        let mut stream = f.mux.open("a", StreamMode::Push).await.unwrap();
        stream.next().await.unwrap();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let event = TaskRecord::pending("a");
        assert_eq!(f.publisher.publish("a", &event).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_is_clean_midway() {
        let f = fixture(fast());
        f.registry.create("a").await.unwrap();
        let mut stream = f.mux.open("a", StreamMode::Polling).await.unwrap();
        stream.next().await.unwrap();
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn transport_loss_ends_push_stream_and_is_reported() {
        let f = fixture(StreamOptions {
            heartbeat_interval: Duration::from_secs(60),
            ..fast()
        });
        f.registry.create("a").await.unwrap();
        let mut stream = f.mux.open("a", StreamMode::Push).await.unwrap();
        stream.next().await.unwrap();

        f.store.disconnect();
        let mut after_loss = 0;
        while stream.next().await.is_some() {
            after_loss += 1;
        }
        assert_eq!(after_loss, 0);
        assert!(stream.is_torn_down());

        let err = stream.close().await.unwrap_err();
        assert_eq!(err.task_id, "a");
        assert!(err.failures.iter().any(|f| f.starts_with("registry read: ")));
    }

    #[tokio::test]
    async fn store_loss_while_polling_is_reported_by_close() {
        let f = fixture(fast());
        f.registry.create("a").await.unwrap();
        let mut stream = f.mux.open("a", StreamMode::Polling).await.unwrap();
        stream.next().await.unwrap();

        f.store.disconnect();
        assert!(stream.next().await.is_none());

        let err = stream.close().await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert!(err.failures[0].starts_with("registry read: "));
    }

    #[tokio::test]
    async fn events_older_than_the_attach_read_are_dropped() {
        let f = fixture(StreamOptions {
            heartbeat_interval: Duration::from_secs(60),
            ..fast()
        });
        f.registry.create("a").await.unwrap();
        let running = f.registry.mark_running("a").await.unwrap();
        let mut stream = f.mux.open("a", StreamMode::Push).await.unwrap();
        assert_eq!(stream.next().await.unwrap().record().unwrap(), running);

        // A pending announcement that lost the race with the attach read.
        f.publisher.publish("a", &TaskRecord::pending("a")).await.unwrap();
        f.publisher.publish("a", &running).await.unwrap();
        let finished = f.registry.mark_finished("a", json!("OK")).await.unwrap();
        f.publisher.publish("a", &finished).await.unwrap();

        let rest: Vec<_> = stream
            .map(|frame| frame.record().unwrap().status)
            .collect()
            .await;
        assert_eq!(rest, vec![TaskStatus::Running, TaskStatus::Finished]);
    }

    #[tokio::test]
    async fn push_open_fails_when_store_is_down() {
        let f = fixture(fast());
        f.store.disconnect();
        assert!(f.mux.open("a", StreamMode::Push).await.is_err());
        assert!(f.store.get("x").await.is_err());
    }
}
