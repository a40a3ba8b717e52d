//! Per-instance update serialization.
//!
//! At most one recovery operation may touch an instance at a time. Callers
//! take an [`InstanceUpdateLease`] keyed by the instance uuid; the lease is
//! released when dropped, on every exit path. Leases on different instances
//! never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Lock table shared by every task that may update instances.
#[derive(Default)]
pub struct InstanceUpdateLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl InstanceUpdateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive update access to an instance.
    pub async fn acquire(self: &Arc<Self>, instance: Uuid) -> InstanceUpdateLease {
        let lock = self
            .table()
            .entry(instance)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        debug!(instance = %instance, "Acquired instance update lease");

        InstanceUpdateLease {
            instance,
            guard: Some(guard),
            locks: Arc::clone(self),
        }
    }

    /// Whether someone currently holds or waits for the instance's lease.
    pub fn is_tracked(&self, instance: Uuid) -> bool {
        self.table().contains_key(&instance)
    }

    /// Number of instances with a held or awaited lease.
    pub fn tracked(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, instance: Uuid) {
        let mut table = self.table();
        // Only the table's own reference left: no holder, no waiter.
        if table
            .get(&instance)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&instance);
        }
    }
}

/// Exclusive update access to one instance.
pub struct InstanceUpdateLease {
    instance: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<InstanceUpdateLocks>,
}

impl InstanceUpdateLease {
    pub fn instance(&self) -> Uuid {
        self.instance
    }
}

impl Drop for InstanceUpdateLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(self.instance);
        debug!(instance = %self.instance, "Released instance update lease");
    }
}

impl std::fmt::Debug for InstanceUpdateLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceUpdateLease")
            .field("instance", &self.instance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_same_instance_waits() {
        let locks = Arc::new(InstanceUpdateLocks::new());
        let instance = Uuid::new_v4();

        let lease = locks.acquire(instance).await;
        let second = tokio::time::timeout(Duration::from_secs(5), locks.acquire(instance)).await;
        assert!(second.is_err());

        drop(lease);
        let second = tokio::time::timeout(Duration::from_secs(5), locks.acquire(instance)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_instances_do_not_contend() {
        let locks = Arc::new(InstanceUpdateLocks::new());
        let _a = locks.acquire(Uuid::new_v4()).await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.acquire(Uuid::new_v4()))
            .await
            .expect("distinct instance should not block");
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn test_entry_pruned_after_release() {
        let locks = Arc::new(InstanceUpdateLocks::new());
        let instance = Uuid::new_v4();

        let lease = locks.acquire(instance).await;
        assert!(locks.is_tracked(instance));
        drop(lease);
        assert!(!locks.is_tracked(instance));
    }

    #[tokio::test]
    async fn test_entry_kept_while_waiter_queued() {
        let locks = Arc::new(InstanceUpdateLocks::new());
        let instance = Uuid::new_v4();

        let lease = locks.acquire(instance).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _lease = locks.acquire(instance).await;
            })
        };
        tokio::task::yield_now().await;

        drop(lease);
        waiter.await.unwrap();
        assert!(!locks.is_tracked(instance));
    }

    #[tokio::test]
    async fn test_released_on_panic() {
        let locks = Arc::new(InstanceUpdateLocks::new());
        let instance = Uuid::new_v4();

        let task = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _lease = locks.acquire(instance).await;
                panic!("recovery blew up");
            })
        };
        assert!(task.await.is_err());

        assert!(!locks.is_tracked(instance));
        tokio::time::timeout(Duration::from_secs(1), locks.acquire(instance))
            .await
            .expect("lease should be free again");
    }
}
