//! Key-value store client trait and supporting types.
//!
//! The [`KvStore`] trait is the only contract the coordination layer has
//! with the shared store. It exposes single-key atomics
//! ([`get`](KvStore::get), [`set`](KvStore::set), [`delete`](KvStore::delete),
//! [`increment`](KvStore::increment), [`decrement`](KvStore::decrement),
//! [`set_if_absent`](KvStore::set_if_absent), plus the compare-and-delete,
//! compare-and-expire and compare-and-set operations that leases need) and
//! named-channel publish/subscribe.
//!
//! Backends are dumb: no lock protocol, no state machine, no retries. A
//! store that cannot be reached reports [`StoreError::Connection`] and the
//! caller decides whether retrying makes sense (the lock manager does; the
//! registry does not).
//!
//! # Keys and TTL
//!
//! Keys are used verbatim. Callers build them with a configured prefix
//! (see [`StoreSettings::key_prefix`](crate::config::StoreSettings)). A
//! `ttl` of `None` means the key does not expire; an expired key is
//! indistinguishable from an absent one.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::Stream;

/// Errors that can occur during raw store operations.
///
/// # Examples
///
/// ```
/// use taskcast::store::StoreError;
///
/// let err = StoreError::Connection {
///     message: "connection refused".to_string(),
///     source: None,
/// };
/// assert!(err.is_connection());
/// assert_eq!(err.to_string(), "store unreachable: connection refused");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connect, I/O, closed connection).
    #[error("store unreachable: {message}")]
    Connection {
        /// Human-readable description.
        message: String,
        /// Underlying transport error, when available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A stored value had the wrong shape for the operation (for example
    /// `increment` on a non-integer).
    #[error("invalid value at key {key}: {message}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// Any other backend-reported failure.
    #[error("backend error: {message}")]
    Backend {
        /// Human-readable description.
        message: String,
        /// Underlying error, when available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    /// Returns `true` for [`StoreError::Connection`].
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Key-value store client with publish/subscribe.
///
/// Every operation is atomic at single-key granularity and every call is a
/// suspension point. Implementations must be `Send + Sync`; the crate
/// shares one handle as `Arc<dyn KvStore>`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` unconditionally, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Removes `key`. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically adds one to the integer at `key` (missing counts as 0)
    /// and returns the new value. An existing TTL is kept.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidValue`] if the stored value is not an integer.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically subtracts one from the integer at `key` (missing counts
    /// as 0) and returns the new value. An existing TTL is kept.
    async fn decrement(&self, key: &str) -> Result<i64, StoreError>;

    /// Stores `value` only if `key` is absent. Returns `true` if written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Removes `key` only if it currently holds `expected`.
    /// Returns `true` if removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Re-arms the TTL of `key` only if it currently holds `expected`.
    /// Returns `true` if renewed.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Replaces the value (and TTL) of `key` only if it currently holds
    /// `expected`. Returns `true` if replaced.
    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Sets the TTL of an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delivers `payload` to every listener currently subscribed to
    /// `channel`. At-most-once, no buffering: listeners that subscribe
    /// later never see it. Returns the number of listeners reached.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    /// Subscribes to `channel`.
    ///
    /// The returned [`Subscription`] is lazy and non-restartable; it yields
    /// messages published after this call returns, until
    /// [`Subscription::unsubscribe`] is called, it is dropped, or the
    /// transport closes.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Backend hook run when a subscription is explicitly closed.
#[async_trait]
pub trait Unsubscribe: Send {
    /// Detaches from the channel on the store side.
    async fn unsubscribe(self: Box<Self>, channel: &str) -> Result<(), StoreError>;
}

/// A live subscription to one channel.
///
/// Implements [`Stream`] of raw payloads. Call
/// [`unsubscribe`](Self::unsubscribe) for an orderly detach that reports
/// errors; dropping the subscription detaches silently.
pub struct Subscription {
    channel: String,
    messages: BoxStream<'static, Result<String, StoreError>>,
    closer: Option<Box<dyn Unsubscribe>>,
}

impl Subscription {
    /// Wraps a backend message stream.
    ///
    /// `closer` is `None` for backends where dropping the stream is a
    /// complete detach.
    pub fn new(
        channel: impl Into<String>,
        messages: BoxStream<'static, Result<String, StoreError>>,
        closer: Option<Box<dyn Unsubscribe>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            messages,
            closer,
        }
    }

    /// The subscribed channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Detaches from the channel.
    ///
    /// # Errors
    ///
    /// Whatever the backend reports while detaching. The subscription is
    /// consumed either way.
    pub async fn unsubscribe(mut self) -> Result<(), StoreError> {
        match self.closer.take() {
            Some(closer) => closer.unsubscribe(&self.channel).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("has_closer", &self.closer.is_some())
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = Result<String, StoreError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagCloser(Arc<AtomicBool>);

    #[async_trait]
    impl Unsubscribe for FlagCloser {
        async fn unsubscribe(self: Box<Self>, _channel: &str) -> Result<(), StoreError> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn store_error_display() {
        let err = StoreError::InvalidValue {
            key: "k".to_string(),
            message: "not an integer".to_string(),
        };
        assert_eq!(err.to_string(), "invalid value at key k: not an integer");
        assert!(!err.is_connection());

        let err = StoreError::Backend {
            message: "script failed".to_string(),
            source: None,
        };
        assert_eq!(err.to_string(), "backend error: script failed");
    }

    #[test]
    fn store_error_exposes_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = StoreError::Connection {
            message: "lost".to_string(),
            source: Some(Box::new(inner)),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("reset"));
    }

    #[tokio::test]
    async fn subscription_yields_backend_messages() {
        let messages = futures::stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]);
        let mut sub = Subscription::new("ch", messages.boxed(), None);
        assert_eq!(sub.channel(), "ch");
        assert_eq!(sub.next().await.unwrap().unwrap(), "a");
        assert_eq!(sub.next().await.unwrap().unwrap(), "b");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_runs_closer() {
        let closed = Arc::new(AtomicBool::new(false));
        let sub = Subscription::new(
            "ch",
            futures::stream::empty().boxed(),
            Some(Box::new(FlagCloser(closed.clone()))),
        );
        sub.unsubscribe().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }
}
