//! Per-node serialization of allocation changes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use warden_id::NodeId;

/// One async mutex per node. Reserve, bind and release on the same node
/// run one at a time; different nodes proceed in parallel.
///
/// A node lock is always taken before a store connection, never while
/// holding one.
#[derive(Clone, Default)]
pub struct NodeLocks {
    locks: Arc<Mutex<HashMap<NodeId, Arc<Mutex<()>>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `node_id`'s allocations.
    pub async fn lock(&self, node_id: NodeId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(node_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
