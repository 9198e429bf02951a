//! Per-task status channels.
//!
//! Events go to `{prefix}:status:{task_id}` as the same JSON the registry
//! stores. Delivery is at-most-once to whoever is subscribed at publish
//! time: nothing is buffered or replayed. A consumer that must not miss the
//! terminal event subscribes first and then reads the registry.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{ready, Stream};
use tracing::warn;

use crate::store::{KvStore, StoreError, Subscription};
use crate::types::StatusEvent;

/// Publishes and subscribes to task status events.
#[derive(Clone)]
pub struct StatusPublisher {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl StatusPublisher {
    /// Creates a publisher over `store`.
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// The channel carrying `task_id`'s events.
    pub fn channel(&self, task_id: &str) -> String {
        format!("{}:status:{}", self.prefix, task_id)
    }

    /// Publishes `event` on `task_id`'s channel and returns how many
    /// subscribers received it.
    ///
    /// # Errors
    ///
    /// Store failures. Callers on the job path log these and carry on.
    pub async fn publish(&self, task_id: &str, event: &StatusEvent) -> Result<usize, StoreError> {
        let payload = serde_json::to_string(event).map_err(|e| StoreError::InvalidValue {
            key: self.channel(task_id),
            message: e.to_string(),
        })?;
        self.store.publish(&self.channel(task_id), &payload).await
    }

    /// Subscribes to `task_id`'s channel.
    pub async fn subscribe(&self, task_id: &str) -> Result<StatusSubscription, StoreError> {
        let inner = self.store.subscribe(&self.channel(task_id)).await?;
        Ok(StatusSubscription {
            task_id: task_id.to_string(),
            inner,
        })
    }
}

/// Decoded events from one task channel.
///
/// Undecodable payloads are logged and skipped; transport errors are
/// yielded.
#[derive(Debug)]
pub struct StatusSubscription {
    task_id: String,
    inner: Subscription,
}

impl StatusSubscription {
    /// The task being observed.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Detaches from the channel.
    pub async fn unsubscribe(self) -> Result<(), StoreError> {
        self.inner.unsubscribe().await
    }
}

impl Stream for StatusSubscription {
    type Item = Result<StatusEvent, StoreError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(payload)) => match serde_json::from_str(&payload) {
                    Ok(event) => return Poll::Ready(Some(Ok(event))),
                    Err(e) => {
                        warn!(task_id = %self.task_id, error = %e, "skipping undecodable status event");
                    },
                },
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{TaskRecord, TaskStatus};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn publisher() -> (Arc<InMemoryStore>, StatusPublisher) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), StatusPublisher::new(store, "t"))
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let (_, publisher) = publisher();
        let mut sub = publisher.subscribe("a").await.unwrap();

        let running = TaskRecord::with_status("a", TaskStatus::Running);
        let mut finished = running.clone();
        finished.status = TaskStatus::Finished;
        finished.result = json!("OK");

        assert_eq!(publisher.publish("a", &running).await.unwrap(), 1);
        assert_eq!(publisher.publish("a", &finished).await.unwrap(), 1);

        assert_eq!(sub.next().await.unwrap().unwrap(), running);
        assert_eq!(sub.next().await.unwrap().unwrap(), finished);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let (_, publisher) = publisher();
        let event = TaskRecord::pending("a");
        assert_eq!(publisher.publish("a", &event).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn channels_are_per_task() {
        let (_, publisher) = publisher();
        let mut sub = publisher.subscribe("a").await.unwrap();
        publisher
            .publish("b", &TaskRecord::pending("b"))
            .await
            .unwrap();
        publisher
            .publish("a", &TaskRecord::pending("a"))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().id, "a");
    }

    #[tokio::test]
    async fn garbage_payloads_are_skipped() {
        let (store, publisher) = publisher();
        let mut sub = publisher.subscribe("a").await.unwrap();
        store.publish("t:status:a", "not json").await.unwrap();
        publisher
            .publish("a", &TaskRecord::pending("a"))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn stream_ends_when_transport_closes() {
        let (store, publisher) = publisher();
        let mut sub = publisher.subscribe("a").await.unwrap();
        store.disconnect();
        assert!(sub.next().await.is_none());
    }
}
