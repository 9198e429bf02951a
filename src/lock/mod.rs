//! Distributed readers/writer lock over the shared store.
//!
//! A named resource is guarded by four keys under the configured prefix:
//!
//! | Key | Value | Lease |
//! |-----|-------|-------|
//! | `{prefix}:lock:write:{resource}` | `w:{token}` for a writer, `readers` for the reader group | write or read lease |
//! | `{prefix}:lock:readers:{resource}` | active reader count | read lease |
//! | `{prefix}:lock:op:{resource}` | random holder id | op lease |
//! | `{prefix}:lock:fence:{resource}` | last fencing token issued | none |
//!
//! The write-flag is held for the whole interval in which the reader count
//! is positive, so a writer can only get in once the last reader leaves.
//! Reader-count mutations are serialized by the store-resident
//! operation-lock, never an in-process mutex, so the invariant holds across
//! processes.
//!
//! # Protocol
//!
//! - **Read acquire**: take the operation-lock, increment the count, claim
//!   the write-flag for the reader group (or refresh it if the group already
//!   holds it), release the operation-lock. If the claim times out the
//!   increment is rolled back first.
//! - **Read release**: take the operation-lock, decrement the count; at zero
//!   delete the count and delete the write-flag if it still says `readers`;
//!   release the operation-lock.
//! - **Write acquire**: claim the write-flag, then take the next fencing
//!   token and stamp it into the flag as `w:{token}` with a compare-and-set
//!   on the claim. Tokens therefore grow in grant order.
//! - **Write release**: compare-and-delete of `w:{token}`.
//!
//! Every wait is bounded by [`LockConfig::acquire_timeout`] with
//! exponential backoff and jitter between attempts. Crashed holders are
//! bounded by leases; live holders keep theirs with `renew`.
//!
//! # Fairness
//!
//! None. Readers are favoured: while at least one reader is active the
//! write-flag stays with the group, so a steady stream of overlapping
//! readers can starve a writer until its acquire times out.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use taskcast::lock::{LockConfig, LockManager};
//! use taskcast::store::InMemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let locks = LockManager::new(Arc::new(InMemoryStore::new()), "app", LockConfig::default());
//!
//! let a = locks.acquire_read("index").await.unwrap();
//! let b = locks.acquire_read("index").await.unwrap();
//! a.release().await.unwrap();
//! b.release().await.unwrap();
//!
//! let w = locks.acquire_write("index").await.unwrap();
//! locks.check_fence("index", w.token()).await.unwrap();
//! w.release().await.unwrap();
//! # }
//! ```

pub mod backoff;
pub mod guard;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{LockError, LockStage};
use crate::store::{KvStore, StoreError};

pub use backoff::{Backoff, Jitter};
pub use guard::{ReadGuard, WriteGuard};

/// Write-flag value while the reader group holds it.
pub const READERS_MARKER: &str = "readers";

/// Lock timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Upper bound on each acquire loop.
    pub acquire_timeout: Duration,
    /// Lease on a writer's hold.
    pub write_lease: Duration,
    /// Lease on the reader group's keys.
    pub read_lease: Duration,
    /// Lease on the operation-lock. Must exceed `acquire_timeout`: a first
    /// reader keeps the operation-lock while it waits on the write-flag.
    pub op_lease: Duration,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Retry delay cap.
    pub backoff_max: Duration,
    /// Retry delay randomization.
    pub jitter: Jitter,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            write_lease: Duration::from_secs(30),
            read_lease: Duration::from_secs(30),
            op_lease: Duration::from_secs(15),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(500),
            jitter: Jitter::Equal,
        }
    }
}

/// The store keys backing one resource's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    /// Exclusive write-flag.
    pub write: String,
    /// Reader count.
    pub readers: String,
    /// Operation-lock.
    pub op: String,
    /// Fencing counter.
    pub fence: String,
}

impl LockKeys {
    fn new(prefix: &str, resource: &str) -> Self {
        Self {
            write: format!("{prefix}:lock:write:{resource}"),
            readers: format!("{prefix}:lock:readers:{resource}"),
            op: format!("{prefix}:lock:op:{resource}"),
            fence: format!("{prefix}:lock:fence:{resource}"),
        }
    }
}

pub(crate) fn writer_value(token: u64) -> String {
    format!("w:{token}")
}

/// Hands out read and write holds on named resources.
///
/// Cheap to clone; clones share the store handle.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    prefix: String,
    config: LockConfig,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("prefix", &self.prefix)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// Creates a manager over `store`, namespacing keys with `prefix`.
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, config: LockConfig) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            config,
        }
    }

    /// The active timing configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// The store keys used for `resource`.
    pub fn keys(&self, resource: &str) -> LockKeys {
        LockKeys::new(&self.prefix, resource)
    }

    /// Acquires a shared hold on `resource`.
    ///
    /// # Errors
    ///
    /// - [`LockError::Timeout`] if the operation-lock or the write-flag
    ///   could not be taken in time. The reader count is left as it was.
    /// - [`LockError::Store`] if the store fails.
    pub async fn acquire_read(&self, resource: &str) -> Result<ReadGuard, LockError> {
        let keys = self.keys(resource);
        let holder = uuid::Uuid::new_v4().to_string();

        self.acquire_op(resource, &keys, &holder).await?;
        let entered = self.enter_reader(resource, &keys).await;
        let released = self.release_op(resource, &keys, &holder).await;

        let readers = entered?;
        if let Err(e) = released {
            warn!(resource, error = %e, "failed to release operation lock after read acquire");
        }
        debug!(resource, readers, "read lock acquired");
        Ok(ReadGuard::new(self.clone(), resource))
    }

    /// Acquires an exclusive hold on `resource` and issues its fencing
    /// token.
    ///
    /// # Errors
    ///
    /// - [`LockError::Timeout`] if the write-flag stayed held past the
    ///   acquire bound.
    /// - [`LockError::Corrupt`] if the fencing counter is not a positive
    ///   integer.
    /// - [`LockError::Store`] if the store fails.
    pub async fn acquire_write(&self, resource: &str) -> Result<WriteGuard, LockError> {
        let keys = self.keys(resource);
        let claim = format!("claim:{}", uuid::Uuid::new_v4());
        let lease = self.config.write_lease;

        self.spin(resource, LockStage::WriteFlag, || {
            self.store.set_if_absent(&keys.write, &claim, Some(lease))
        })
        .await?;

        match self.stamp_token(resource, &keys, &claim).await {
            Ok(token) => {
                debug!(resource, token, "write lock acquired");
                Ok(WriteGuard::new(self.clone(), resource, token))
            },
            Err(e) => {
                if let Err(cleanup) = self.store.delete_if_equals(&keys.write, &claim).await {
                    warn!(resource, error = %cleanup, "failed to drop write claim");
                }
                Err(e)
            },
        }
    }

    /// Verifies that `token` belongs to the current write holder.
    ///
    /// Protected resources call this before applying a write so that a
    /// holder whose lease already expired cannot clobber its successor.
    ///
    /// # Errors
    ///
    /// [`LockError::StaleFence`] if the write-flag is absent or carries
    /// another token.
    pub async fn check_fence(&self, resource: &str, token: u64) -> Result<(), LockError> {
        let keys = self.keys(resource);
        let current = self.store.get(&keys.write).await?;
        if current.as_deref() == Some(writer_value(token).as_str()) {
            Ok(())
        } else {
            Err(LockError::StaleFence {
                resource: resource.to_string(),
                token,
            })
        }
    }

    /// Runs `fut` under a shared hold, releasing it afterwards.
    ///
    /// # Errors
    ///
    /// Acquire errors, or the release error if the hold was lost while
    /// `fut` ran (the output is discarded in that case).
    pub async fn with_read<Fut, T>(&self, resource: &str, fut: Fut) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_read(resource).await?;
        let output = fut.await;
        guard.release().await?;
        Ok(output)
    }

    /// Runs `f(token)` under an exclusive hold, releasing it afterwards.
    ///
    /// # Errors
    ///
    /// As [`with_read`](Self::with_read); a lost lease surfaces as
    /// [`LockError::LeaseLost`].
    pub async fn with_write<F, Fut, T>(&self, resource: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_write(resource).await?;
        let output = f(guard.token()).await;
        guard.release().await?;
        Ok(output)
    }

    pub(crate) async fn release_read(&self, resource: &str) -> Result<(), LockError> {
        let keys = self.keys(resource);
        let holder = uuid::Uuid::new_v4().to_string();

        self.acquire_op(resource, &keys, &holder).await?;
        let left = self.leave_reader(resource, &keys).await;
        if let Err(e) = self.release_op(resource, &keys, &holder).await {
            warn!(resource, error = %e, "failed to release operation lock after read release");
        }

        let remaining = left?;
        debug!(resource, remaining, "read lock released");
        Ok(())
    }

    pub(crate) async fn renew_read(&self, resource: &str) -> Result<(), LockError> {
        let keys = self.keys(resource);
        let lease = self.config.read_lease;
        if !self
            .store
            .expire_if_equals(&keys.write, READERS_MARKER, lease)
            .await?
        {
            return Err(self.lease_lost(resource, LockStage::WriteFlag, None));
        }
        if !self.store.expire(&keys.readers, lease).await? {
            return Err(self.lease_lost(resource, LockStage::ReadCount, None));
        }
        Ok(())
    }

    pub(crate) async fn release_write(&self, resource: &str, token: u64) -> Result<(), LockError> {
        let keys = self.keys(resource);
        if self
            .store
            .delete_if_equals(&keys.write, &writer_value(token))
            .await?
        {
            debug!(resource, token, "write lock released");
            Ok(())
        } else {
            Err(self.lease_lost(resource, LockStage::WriteFlag, Some(token)))
        }
    }

    pub(crate) async fn renew_write(&self, resource: &str, token: u64) -> Result<(), LockError> {
        let keys = self.keys(resource);
        if self
            .store
            .expire_if_equals(&keys.write, &writer_value(token), self.config.write_lease)
            .await?
        {
            Ok(())
        } else {
            Err(self.lease_lost(resource, LockStage::WriteFlag, Some(token)))
        }
    }

    fn lease_lost(&self, resource: &str, stage: LockStage, token: Option<u64>) -> LockError {
        warn!(resource, %stage, ?token, "lock lease lost");
        LockError::LeaseLost {
            resource: resource.to_string(),
            stage,
            token,
        }
    }

    /// Retries `attempt` with backoff until it reports success or the
    /// acquire bound passes.
    async fn spin<F, Fut>(&self, resource: &str, stage: LockStage, mut attempt: F) -> Result<(), LockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, StoreError>>,
    {
        let started = Instant::now();
        // An unrepresentable deadline means waiting without bound.
        let deadline = started.checked_add(self.config.acquire_timeout);
        let mut backoff = Backoff::new(
            self.config.backoff_base,
            self.config.backoff_max,
            self.config.jitter,
        );

        loop {
            if attempt().await? {
                return Ok(());
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                debug!(resource, %stage, attempts = backoff.attempts(), "lock acquire timed out");
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    stage,
                    waited: now - started,
                });
            }
            let delay = backoff.next_delay();
            let delay = deadline.map_or(delay, |deadline| delay.min(deadline - now));
            tokio::time::sleep(delay).await;
        }
    }

    async fn acquire_op(&self, resource: &str, keys: &LockKeys, holder: &str) -> Result<(), LockError> {
        let lease = self.config.op_lease;
        self.spin(resource, LockStage::OperationLock, || {
            self.store.set_if_absent(&keys.op, holder, Some(lease))
        })
        .await
    }

    async fn release_op(&self, resource: &str, keys: &LockKeys, holder: &str) -> Result<(), LockError> {
        if !self.store.delete_if_equals(&keys.op, holder).await? {
            warn!(resource, "operation lock expired before release");
        }
        Ok(())
    }

    /// Claims the write-flag for the reader group, or refreshes it if the
    /// group already holds it.
    async fn claim_for_readers(&self, keys: &LockKeys) -> Result<bool, StoreError> {
        let lease = self.config.read_lease;
        if self
            .store
            .set_if_absent(&keys.write, READERS_MARKER, Some(lease))
            .await?
        {
            return Ok(true);
        }
        self.store
            .expire_if_equals(&keys.write, READERS_MARKER, lease)
            .await
    }

    /// Counts this reader in. Caller holds the operation-lock.
    async fn enter_reader(&self, resource: &str, keys: &LockKeys) -> Result<i64, LockError> {
        let count = self.store.increment(&keys.readers).await?;
        let claimed = match self.store.expire(&keys.readers, self.config.read_lease).await {
            Ok(_) => {
                self.spin(resource, LockStage::WriteFlag, || self.claim_for_readers(keys))
                    .await
            },
            Err(e) => Err(LockError::from(e)),
        };

        match claimed {
            Ok(()) => Ok(count),
            Err(e) => {
                if let Err(rollback) = self.uncount_reader(keys).await {
                    warn!(resource, error = %rollback, "failed to roll back reader count");
                }
                Err(e)
            },
        }
    }

    /// Counts this reader out. Caller holds the operation-lock.
    async fn leave_reader(&self, resource: &str, keys: &LockKeys) -> Result<i64, LockError> {
        let remaining = self.store.decrement(&keys.readers).await?;
        if remaining <= 0 {
            if remaining < 0 {
                warn!(resource, remaining, "reader count went negative, lease likely expired");
            }
            self.store.delete(&keys.readers).await?;
            self.store
                .delete_if_equals(&keys.write, READERS_MARKER)
                .await?;
        } else {
            self.store.expire(&keys.readers, self.config.read_lease).await?;
        }
        Ok(remaining)
    }

    async fn uncount_reader(&self, keys: &LockKeys) -> Result<(), StoreError> {
        if self.store.decrement(&keys.readers).await? <= 0 {
            self.store.delete(&keys.readers).await?;
        }
        Ok(())
    }

    /// Issues the next fencing token and stamps it into a claimed flag.
    async fn stamp_token(&self, resource: &str, keys: &LockKeys, claim: &str) -> Result<u64, LockError> {
        let raw = self.store.increment(&keys.fence).await?;
        let token = u64::try_from(raw)
            .ok()
            .filter(|t| *t > 0)
            .ok_or_else(|| LockError::Corrupt {
                resource: resource.to_string(),
                stage: LockStage::WriteFlag,
                value: raw.to_string(),
            })?;

        let stamped = self
            .store
            .set_if_equals(&keys.write, claim, &writer_value(token), Some(self.config.write_lease))
            .await?;
        if !stamped {
            return Err(self.lease_lost(resource, LockStage::WriteFlag, Some(token)));
        }
        Ok(token)
    }
}
