//! Per-instance critical sections.
//!
//! Every mutation of an instance or one of its tasks runs load, check,
//! mutate, save while holding that instance's mutex, so parallel branches
//! appending path entries and API calls racing a terminate are serialized.
//! The same registry counts outstanding work per instance so a branch
//! reaching an end can tell whether siblings are still queued or walking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    work: Arc<Mutex<HashMap<String, usize>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive section for an instance.
    pub async fn lock(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Drop the mutex of a finished instance if nobody holds or awaits it.
    pub fn forget(&self, instance_id: &str) {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(instance_id)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            map.remove(instance_id);
        }
    }

    /// Number of instances with a live mutex.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Count one more unit of outstanding work (queued or walking).
    pub fn track(&self, instance_id: &str) {
        let mut work = self.work.lock().unwrap_or_else(|e| e.into_inner());
        *work.entry(instance_id.to_string()).or_insert(0) += 1;
    }

    /// Take responsibility for one tracked unit; it is released when the
    /// guard drops.
    pub fn adopt(&self, instance_id: &str) -> WorkGuard {
        WorkGuard {
            instance_id: instance_id.to_string(),
            work: self.work.clone(),
        }
    }

    /// Queued plus running work for an instance.
    pub fn outstanding(&self, instance_id: &str) -> usize {
        let work = self.work.lock().unwrap_or_else(|e| e.into_inner());
        work.get(instance_id).copied().unwrap_or(0)
    }
}

pub struct WorkGuard {
    instance_id: String,
    work: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let mut work = self.work.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = work.get_mut(&self.instance_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                work.remove(&self.instance_id);
            }
        }
    }
}
