//! Shared key-value store: the trait and its backends.
//!
//! Everything above this layer talks to the store through
//! `Arc<dyn KvStore>`. Pick a backend:
//!
//! - [`InMemoryStore`]: one process, tests.
//! - [`RedisStore`] (feature `redis`): shared across processes.

pub mod backend;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use backend::{KvStore, StoreError, Subscription, Unsubscribe};
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
