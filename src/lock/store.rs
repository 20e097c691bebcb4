//! Lock store abstraction
//!
//! The lock table lives in a process-external shared store so multiple hub
//! instances coordinate correctly. The trait mandates one primitive: an
//! atomic compare-and-set acquire that treats an expired holder as free.
//! Without that a lock could be granted to two callers racing on an expired
//! entry. The in-memory backend serves single-instance deployments and
//! tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Result of a conditional release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Token matched the current holder; lock removed.
    Released,
    /// A different token holds the lock now (the caller's lease expired and
    /// was re-granted).
    NotHolder,
    /// No holder recorded for the resource.
    NoHolder,
}

/// Shared lock-table operations.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempt to become the holder of `resource` with the given lease.
    /// Succeeds iff no live holder exists; an expired entry counts as free.
    /// Check and grant are a single atomic operation.
    async fn try_acquire(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool>;

    /// Release `resource` iff `token` still matches the current holder.
    async fn release(&self, resource: &str, token: &str) -> anyhow::Result<ReleaseOutcome>;
}

#[derive(Debug, Clone)]
struct StoredLock {
    token: String,
    expires_at: Instant,
}

/// In-memory lock table. A single mutex section per operation gives the
/// compare-and-set semantics the trait requires.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, StoredLock>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(resource) {
            Some(held) if held.expires_at > now => Ok(false),
            _ => {
                // free, or held by an expired lease
                entries.insert(
                    resource.to_string(),
                    StoredLock {
                        token: token.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, resource: &str, token: &str) -> anyhow::Result<ReleaseOutcome> {
        let mut entries = self.entries.lock().await;
        match entries.get(resource) {
            None => Ok(ReleaseOutcome::NoHolder),
            Some(held) if held.token == token => {
                entries.remove(resource);
                Ok(ReleaseOutcome::Released)
            }
            Some(held) if held.expires_at <= Instant::now() => {
                // expired lease from someone else; drop it while we're here
                entries.remove(resource);
                Ok(ReleaseOutcome::NoHolder)
            }
            Some(_) => Ok(ReleaseOutcome::NotHolder),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let store = MemoryLockStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.try_acquire("chanA", "t1", ttl).await.unwrap());
        assert!(!store.try_acquire("chanA", "t2", ttl).await.unwrap());
        // unrelated resource is unaffected
        assert!(store.try_acquire("chanB", "t3", ttl).await.unwrap());

        assert_eq!(
            store.release("chanA", "t1").await.unwrap(),
            ReleaseOutcome::Released
        );
        assert!(store.try_acquire("chanA", "t2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_holder_is_treated_as_free() {
        let store = MemoryLockStore::new();
        assert!(store
            .try_acquire("chanA", "t1", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store
            .try_acquire("chanA", "t2", Duration::from_secs(10))
            .await
            .unwrap());
        // original holder's release no longer matches
        assert_eq!(
            store.release("chanA", "t1").await.unwrap(),
            ReleaseOutcome::NotHolder
        );
    }

    #[tokio::test]
    async fn release_without_holder_is_reported() {
        let store = MemoryLockStore::new();
        assert_eq!(
            store.release("chanA", "t1").await.unwrap(),
            ReleaseOutcome::NoHolder
        );
    }
}
