//! In-memory key-value store with publish/subscribe.
//!
//! [`InMemoryStore`] implements [`KvStore`] inside one process:
//!
//! - keys live in a `DashMap<String, Slot>`; each slot carries an optional
//!   expiry instant that is checked lazily on every access, so an expired
//!   key behaves exactly like an absent one;
//! - each channel is a `tokio::sync::broadcast` sender created on first
//!   subscribe and dropped again once nobody listens.
//!
//! Single-key atomicity comes from `DashMap`'s shard locking: every
//! operation touches exactly one entry under one shard guard.
//!
//! It is the backend used by the test suite and by single-process
//! deployments. Cross-process coordination needs
//! [`RedisStore`](crate::store::redis::RedisStore).
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use taskcast::store::{InMemoryStore, KvStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
//! assert!(store.set_if_absent("k", "v", None).await.unwrap());
//! assert!(!store.set_if_absent("k", "other", None).await.unwrap());
//! assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::backend::{KvStore, StoreError, Subscription};

/// Default per-channel buffer for in-process subscribers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

/// Expiry instant for a TTL starting at `now`. A TTL too large to
/// represent never expires.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

impl Slot {
    fn new(value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at: ttl.and_then(|ttl| deadline(Instant::now(), ttl)),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-process [`KvStore`].
///
/// See the [module docs](self) for the storage model.
#[derive(Debug)]
pub struct InMemoryStore {
    data: DashMap<String, Slot>,
    channels: DashMap<String, broadcast::Sender<String>>,
    channel_capacity: usize,
    connected: AtomicBool,
}

impl InMemoryStore {
    /// Creates an empty store with the default channel capacity.
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates an empty store whose channels buffer up to `capacity`
    /// undelivered messages per subscriber. A subscriber that falls further
    /// behind skips the overflow.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            data: DashMap::new(),
            channels: DashMap::new(),
            channel_capacity: capacity.max(1),
            connected: AtomicBool::new(true),
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    /// Returns `true` if no live keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired key and returns how many were removed.
    ///
    /// Expiry is also enforced at read time; this only reclaims memory.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, slot| !slot.is_expired(now));
        before - self.data.len()
    }

    /// Simulates losing the store: every later call fails with
    /// [`StoreError::Connection`] and open subscriptions end.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.channels.clear();
    }

    /// Undoes [`disconnect`](Self::disconnect). Stored keys survive.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connection {
                message: "in-memory store disconnected".to_string(),
                source: None,
            })
        }
    }

    /// Applies `delta` to the integer at `key`, treating missing or
    /// expired as 0 and keeping any live TTL.
    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new("0", None));
        if slot.is_expired(now) {
            *slot = Slot::new("0", None);
        }
        let current: i64 = slot.value.parse().map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
            message: format!("not an integer: {:?}", slot.value),
        })?;
        let next = current + delta;
        slot.value = next.to_string();
        Ok(next)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        let value = self
            .data
            .get(key)
            .and_then(|slot| (!slot.is_expired(now)).then(|| slot.value.clone()));
        if value.is_none() {
            self.data.remove_if(key, |_, slot| slot.is_expired(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.data.insert(key.to_string(), Slot::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, slot)| !slot.is_expired(now)))
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.ensure_connected()?;
        self.add(key, 1)
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        self.ensure_connected()?;
        self.add(key, -1)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl));
                Ok(true)
            },
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        Ok(self
            .data
            .remove_if(key, |_, slot| !slot.is_expired(now) && slot.value == expected)
            .is_some())
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) && slot.value == expected => {
                slot.expires_at = deadline(now, ttl);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) && slot.value == expected => {
                *slot = Slot::new(value, ttl);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) => {
                slot.expires_at = deadline(now, ttl);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        self.ensure_connected()?;
        let delivered = self
            .channels
            .get(channel)
            .map_or(0, |tx| tx.send(payload.to_string()).unwrap_or(0));
        if delivered == 0 {
            self.channels
                .remove_if(channel, |_, tx| tx.receiver_count() == 0);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.ensure_connected()?;
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe();

        let name = channel.to_string();
        let messages = BroadcastStream::new(rx).filter_map(move |item| {
            let name = name.clone();
            async move {
                match item {
                    Ok(payload) => Some(Ok(payload)),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            channel = %name,
                            skipped,
                            "subscriber lagged, messages dropped"
                        );
                        None
                    },
                }
            }
        });

        Ok(Subscription::new(channel, messages.boxed(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_overwrites_value() {
        let store = InMemoryStore::new();
        store.set("k", "one", None).await.unwrap();
        store.set("k", "two", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let store = InMemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn set_if_absent_replaces_expired_key() {
        let store = InMemoryStore::new();
        assert!(store
            .set_if_absent("k", "a", Some(Duration::from_millis(10)))
            .await
            .unwrap());
        assert!(!store.set_if_absent("k", "b", None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn increment_and_decrement_from_missing() {
        let store = InMemoryStore::new();
        assert_eq!(store.increment("c").await.unwrap(), 1);
        assert_eq!(store.increment("c").await.unwrap(), 2);
        assert_eq!(store.decrement("c").await.unwrap(), 1);
        assert_eq!(store.decrement("missing").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn increment_rejects_non_integer() {
        let store = InMemoryStore::new();
        store.set("c", "abc", None).await.unwrap();
        let err = store.increment("c").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn increment_keeps_ttl() {
        let store = InMemoryStore::new();
        store
            .set("c", "5", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.increment("c").await.unwrap(), 6);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_delete_only_matches_expected() {
        let store = InMemoryStore::new();
        store.set("k", "mine", None).await.unwrap();
        assert!(!store.delete_if_equals("k", "theirs").await.unwrap());
        assert!(store.delete_if_equals("k", "mine").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_expire_extends_lease() {
        let store = InMemoryStore::new();
        store
            .set("k", "mine", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(!store
            .expire_if_equals("k", "theirs", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store
            .expire_if_equals("k", "mine", Duration::from_secs(5))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn compare_and_set_only_replaces_expected() {
        let store = InMemoryStore::new();
        store.set("k", "claim", None).await.unwrap();
        assert!(!store
            .set_if_equals("k", "other", "stolen", None)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("claim"));

        assert!(store
            .set_if_equals("k", "claim", "stamped", Some(Duration::from_millis(20)))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("stamped"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.set_if_equals("k", "stamped", "x", None).await.unwrap());
    }

    #[tokio::test]
    async fn huge_ttls_never_expire_instead_of_overflowing() {
        let store = InMemoryStore::new();
        store.set("a", "1", Some(Duration::MAX)).await.unwrap();
        assert!(store.set_if_absent("b", "2", Some(Duration::MAX)).await.unwrap());
        assert!(store.expire("a", Duration::MAX).await.unwrap());
        assert!(store.expire_if_equals("b", "2", Duration::MAX).await.unwrap());
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn expire_on_missing_key_is_false() {
        let store = InMemoryStore::new();
        assert!(!store.expire("k", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let store = InMemoryStore::new();
        assert_eq!(store.publish("ch", "hello").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn subscriber_sees_messages_in_publish_order() {
        let store = InMemoryStore::new();
        let mut sub = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", "1").await.unwrap(), 1);
        assert_eq!(store.publish("ch", "2").await.unwrap(), 1);
        assert_eq!(sub.next().await.unwrap().unwrap(), "1");
        assert_eq!(sub.next().await.unwrap().unwrap(), "2");
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let store = InMemoryStore::new();
        let mut early = store.subscribe("ch").await.unwrap();
        store.publish("ch", "before").await.unwrap();
        let mut late = store.subscribe("ch").await.unwrap();
        store.publish("ch", "after").await.unwrap();

        assert_eq!(early.next().await.unwrap().unwrap(), "before");
        assert_eq!(late.next().await.unwrap().unwrap(), "after");
    }

    #[tokio::test]
    async fn dropped_subscription_stops_counting() {
        let store = InMemoryStore::new();
        let sub = store.subscribe("ch").await.unwrap();
        drop(sub);
        assert_eq!(store.publish("ch", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disconnect_fails_calls_and_ends_subscriptions() {
        let store = InMemoryStore::new();
        let mut sub = store.subscribe("ch").await.unwrap();
        store.disconnect();

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_connection());
        assert!(sub.next().await.is_none());

        store.reconnect();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cleanup_expired_counts_removed_keys() {
        let store = InMemoryStore::new();
        store
            .set("a", "1", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        store.set("b", "2", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
