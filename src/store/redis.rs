//! Redis key-value backend.
//!
//! [`RedisStore`] implements [`KvStore`] over one
//! [`MultiplexedConnection`] for commands and a dedicated
//! [`aio::PubSub`](::redis::aio::PubSub) connection per subscription.
//!
//! | Operation | Redis |
//! |-----------|-------|
//! | `get` | `GET` |
//! | `set` | `SET` / `SET .. PX` |
//! | `set_if_absent` | `SET .. NX [PX]` |
//! | `delete` | `DEL` |
//! | `increment` / `decrement` | `INCR` / `DECR` |
//! | `delete_if_equals` | Lua: `GET` + `DEL` |
//! | `expire_if_equals` | Lua: `GET` + `PEXPIRE` |
//! | `set_if_equals` | Lua: `GET` + `SET [PX]` |
//! | `expire` | `PEXPIRE` |
//! | `publish` | `PUBLISH` |
//! | `subscribe` | `SUBSCRIBE` on a new connection |
//!
//! Keys are used verbatim; callers apply the configured prefix.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskcast::store::{KvStore, RedisStore};
//!
//! # async fn example() {
//! let store: Arc<dyn KvStore> = Arc::new(
//!     RedisStore::connect("redis://127.0.0.1:6379").await.unwrap(),
//! );
//! # }
//! ```

use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSubSink};
use ::redis::{AsyncCommands, Client, ErrorKind, RedisError, Script, ServerErrorKind};
use async_trait::async_trait;
use futures::StreamExt;

use super::backend::{KvStore, StoreError, Subscription, Unsubscribe};

/// Compare-and-delete.
///
/// KEYS[1] = key, ARGV[1] = expected value. Returns 1 if deleted.
const LUA_DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Compare-and-expire.
///
/// KEYS[1] = key, ARGV[1] = expected value, ARGV[2] = TTL in milliseconds.
/// Returns 1 if the TTL was re-armed.
const LUA_EXPIRE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Compare-and-set.
///
/// KEYS[1] = key, ARGV[1] = expected value, ARGV[2] = new value,
/// ARGV[3] = TTL in milliseconds (0 for none). Returns 1 if replaced.
const LUA_SET_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    if tonumber(ARGV[3]) > 0 then
        redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    else
        redis.call('SET', KEYS[1], ARGV[2])
    end
    return 1
end
return 0
"#;

/// Largest TTL sent to the server; Redis rejects expiries that overflow
/// its clock.
const MAX_TTL_MS: u64 = (i64::MAX / 2) as u64;

/// Redis-backed [`KvStore`].
///
/// Cloning is cheap: clones share the multiplexed connection.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connects to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    ///
    /// # Errors
    ///
    /// [`StoreError::Connection`] if the URL is invalid or the server cannot
    /// be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Connection {
            message: format!("invalid Redis URL: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self { client, conn })
    }

    /// Wraps an existing client and connection.
    pub fn with_connection(client: Client, conn: MultiplexedConnection) -> Self {
        Self { client, conn }
    }
}

fn map_redis_error(err: RedisError, what: &str) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Connection {
            message: format!("{what}: {err}"),
            source: Some(Box::new(err)),
        }
    } else {
        StoreError::Backend {
            message: format!("{what}: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

/// `ERR` replies, such as `INCR` on a value that is not an integer.
fn is_response_error(err: &RedisError) -> bool {
    err.kind() == ErrorKind::Server(ServerErrorKind::ResponseError)
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(MAX_TTL_MS)
        .clamp(1, MAX_TTL_MS)
}

/// Holds the write half of a subscription's connection so it can send
/// `UNSUBSCRIBE`.
struct RedisUnsubscribe {
    sink: PubSubSink,
}

#[async_trait]
impl Unsubscribe for RedisUnsubscribe {
    async fn unsubscribe(mut self: Box<Self>, channel: &str) -> Result<(), StoreError> {
        self.sink
            .unsubscribe(channel)
            .await
            .map_err(|e| map_redis_error(e, &format!("UNSUBSCRIBE {channel}")))
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| map_redis_error(e, &format!("GET {key}")))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, &format!("SET {key}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| map_redis_error(e, &format!("DEL {key}")))?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1_i64).await.map_err(|e| {
            if is_response_error(&e) {
                StoreError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                }
            } else {
                map_redis_error(e, &format!("INCR {key}"))
            }
        })
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.decr(key, 1_i64).await.map_err(|e| {
            if is_response_error(&e) {
                StoreError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                }
            } else {
                map_redis_error(e, &format!("DECR {key}"))
            }
        })
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, &format!("SET NX {key}")))?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let removed: i64 = Script::new(LUA_DELETE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &format!("compare-and-delete {key}")))?;
        Ok(removed == 1)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let renewed: i64 = Script::new(LUA_EXPIRE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &format!("compare-and-expire {key}")))?;
        Ok(renewed == 1)
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let replaced: i64 = Script::new(LUA_SET_IF_EQUALS)
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl.map_or(0, millis))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &format!("compare-and-set {key}")))?;
        Ok(replaced == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ms = i64::try_from(millis(ttl)).unwrap_or(i64::MAX);
        let applied: bool = conn
            .pexpire(key, ms)
            .await
            .map_err(|e| map_redis_error(e, &format!("PEXPIRE {key}")))?;
        Ok(applied)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn
            .publish(channel, payload)
            .await
            .map_err(|e| map_redis_error(e, &format!("PUBLISH {channel}")))?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| map_redis_error(e, "open pub/sub connection"))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| map_redis_error(e, &format!("SUBSCRIBE {channel}")))?;

        let (sink, stream) = pubsub.split();
        let name = channel.to_string();
        let messages = stream.map(move |msg| {
            msg.get_payload::<String>().map_err(|e| StoreError::InvalidValue {
                key: name.clone(),
                message: format!("undecodable payload: {e}"),
            })
        });

        Ok(Subscription::new(
            channel,
            messages.boxed(),
            Some(Box::new(RedisUnsubscribe { sink })),
        ))
    }
}
