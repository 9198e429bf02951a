//! Hold handles returned by [`LockManager`].
//!
//! Release is async, so it cannot run in `Drop`. Call `release().await`.
//! A guard dropped without it logs a warning and spawns a best-effort
//! release on the current runtime; if there is none the lease cleans up.

use tracing::warn;

use super::LockManager;
use crate::error::LockError;

/// A shared hold on a resource.
#[derive(Debug)]
#[must_use = "release the guard with `release().await`"]
pub struct ReadGuard {
    manager: LockManager,
    resource: String,
    released: bool,
}

impl ReadGuard {
    pub(crate) fn new(manager: LockManager, resource: &str) -> Self {
        Self {
            manager,
            resource: resource.to_string(),
            released: false,
        }
    }

    /// The locked resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Re-arms the reader group's leases.
    ///
    /// # Errors
    ///
    /// [`LockError::LeaseLost`] if the group's write-flag or count expired.
    pub async fn renew(&self) -> Result<(), LockError> {
        self.manager.renew_read(&self.resource).await
    }

    /// Leaves the reader group, re-admitting writers if this was the last
    /// reader.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if the operation-lock could not be taken, or
    /// a store failure.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.manager.release_read(&self.resource).await
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(resource = %self.resource, "read guard dropped without release");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let resource = std::mem::take(&mut self.resource);
            handle.spawn(async move {
                if let Err(e) = manager.release_read(&resource).await {
                    warn!(resource = %resource, error = %e, "background read release failed");
                }
            });
        }
    }
}

/// An exclusive hold on a resource, carrying its fencing token.
#[derive(Debug)]
#[must_use = "release the guard with `release().await`"]
pub struct WriteGuard {
    manager: LockManager,
    resource: String,
    token: u64,
    released: bool,
}

impl WriteGuard {
    pub(crate) fn new(manager: LockManager, resource: &str, token: u64) -> Self {
        Self {
            manager,
            resource: resource.to_string(),
            token,
            released: false,
        }
    }

    /// The locked resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Fencing token issued with this hold. Strictly greater than every
    /// token issued before it for the same resource.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Re-arms the write lease.
    ///
    /// # Errors
    ///
    /// [`LockError::LeaseLost`] if the flag no longer carries this token.
    pub async fn renew(&self) -> Result<(), LockError> {
        self.manager.renew_write(&self.resource, self.token).await
    }

    /// Releases the hold.
    ///
    /// # Errors
    ///
    /// [`LockError::LeaseLost`] if the lease expired and the flag was
    /// removed or taken over; anything written under this hold since then
    /// may have raced another writer.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.manager.release_write(&self.resource, self.token).await
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(resource = %self.resource, token = self.token, "write guard dropped without release");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let resource = std::mem::take(&mut self.resource);
            let token = self.token;
            handle.spawn(async move {
                if let Err(e) = manager.release_write(&resource, token).await {
                    warn!(resource = %resource, token, error = %e, "background write release failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::lock::{Jitter, LockConfig, LockManager};
    use crate::store::{InMemoryStore, KvStore};

    fn locks(store: Arc<InMemoryStore>) -> LockManager {
        LockManager::new(
            store,
            "g",
            LockConfig {
                acquire_timeout: Duration::from_millis(500),
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(10),
                jitter: Jitter::None,
                ..LockConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn dropped_write_guard_is_released_in_background() {
        let store = Arc::new(InMemoryStore::new());
        let locks = locks(store.clone());
        let guard = locks.acquire_write("res").await.unwrap();
        drop(guard);

        let next = locks.acquire_write("res").await.unwrap();
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_read_guard_is_released_in_background() {
        let store = Arc::new(InMemoryStore::new());
        let locks = locks(store.clone());
        drop(locks.acquire_read("res").await.unwrap());

        for _ in 0..50 {
            if store.get(&locks.keys("res").write).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("write flag still held after dropped reader");
    }

    #[tokio::test]
    async fn read_renew_fails_once_group_flag_is_gone() {
        let store = Arc::new(InMemoryStore::new());
        let locks = locks(store.clone());
        let guard = locks.acquire_read("res").await.unwrap();
        guard.renew().await.unwrap();

        store.delete(&locks.keys("res").write).await.unwrap();
        assert!(guard.renew().await.is_err());
        guard.release().await.unwrap();
    }
}
