//! Per-node metadata locks.
//!
//! Metadata mutations against the same table node are serialized; nodes
//! never share a lock, so different nodes proceed in parallel. The guard
//! is released on drop, including on error paths and task abort.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Lazily created lock per node id.
#[derive(Clone, Default)]
pub struct NodeLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the metadata lock for `node_id`, waiting if it is held.
    pub async fn lock(&self, node_id: &str) -> OwnedMutexGuard<()> {
        let node_lock = {
            let mut locks = self.inner.lock().await;
            Arc::clone(locks.entry(node_id.to_string()).or_default())
        };
        let guard = node_lock.lock_owned().await;
        trace!(node = %node_id, "node lock acquired");
        guard
    }

    /// Drop the lock entry of a node that no longer exists.
    pub async fn forget(&self, node_id: &str) {
        self.inner.lock().await.remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_node_is_serialized() {
        let locks = NodeLocks::new();
        let guard = locks.lock("events").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("events").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_nodes_do_not_block() {
        let locks = NodeLocks::new();
        let _a = locks.lock("p_a").await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("p_b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_on_error_path() {
        async fn failing(locks: &NodeLocks) -> Result<(), &'static str> {
            let _guard = locks.lock("events").await;
            Err("apply failed")
        }

        let locks = NodeLocks::new();
        assert!(failing(&locks).await.is_err());

        let again = tokio::time::timeout(Duration::from_millis(100), locks.lock("events")).await;
        assert!(again.is_ok());
    }
}
