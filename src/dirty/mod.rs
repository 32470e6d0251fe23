//! # Dirty-memory manager
//!
//! Per-shard accountant over a region group. Three instances exist: user,
//! system (with extra headroom so system queries survive a user-write
//! throttle), and streaming. Writes above the group's hard limit block until
//! a flush releases memory; crossing the soft limit wakes the reactive
//! flusher, which picks the memtable list with the largest active region and
//! seals it. Explicit flushes take precedence over the reactive loop.

use crate::consts::DEFAULT_FLUSH_PERMITS;
use crate::memtable::{FlushBehavior, MemtableList};
use crate::region::RegionGroup;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

pub struct DirtyMemoryManager {
    group: Arc<RegionGroup>,

    /// Bounds concurrent sstable writes driven from this manager
    flush_permits: Arc<Semaphore>,

    /// Explicit flushers waiting on a permit; the reactive loop yields to them
    explicit_waiters: AtomicUsize,

    /// Memtable lists charged against this manager's group
    lists: Mutex<Vec<Weak<MemtableList>>>,

    shutting_down: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl DirtyMemoryManager {
    pub fn new(name: &'static str, soft_limit: usize, hard_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            group: RegionGroup::new(name, soft_limit, hard_limit),
            flush_permits: Arc::new(Semaphore::new(DEFAULT_FLUSH_PERMITS)),
            explicit_waiters: AtomicUsize::new(0),
            lists: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            flusher: Mutex::new(None),
        })
    }

    pub fn region_group(&self) -> &Arc<RegionGroup> {
        &self.group
    }

    /// Registers a memtable list as a reactive flush candidate.
    pub fn register(&self, list: &Arc<MemtableList>) {
        self.lists
            .lock()
            .expect("dirty manager lists poisoned")
            .push(Arc::downgrade(list));
    }

    /// Takes a flush permit. Explicit requests (user flush, drop, commit-log
    /// pressure) are counted so the reactive loop can yield to them.
    pub async fn acquire_flush_permit(&self, explicit: bool) -> OwnedSemaphorePermit {
        if explicit {
            self.explicit_waiters.fetch_add(1, Ordering::AcqRel);
        }
        let permit = Arc::clone(&self.flush_permits)
            .acquire_owned()
            .await
            .expect("flush permit semaphore closed");
        if explicit {
            self.explicit_waiters.fetch_sub(1, Ordering::AcqRel);
        }
        permit
    }

    fn explicit_flushers_queued(&self) -> bool {
        self.explicit_waiters.load(Ordering::Acquire) > 0
    }

    /// The registered list with the largest active region, pruning lists
    /// whose owner has gone away.
    fn largest_list(&self) -> Option<Arc<MemtableList>> {
        let mut lists = self.lists.lock().expect("dirty manager lists poisoned");
        lists.retain(|weak| weak.strong_count() > 0);
        lists
            .iter()
            .filter_map(Weak::upgrade)
            .max_by_key(|list| list.active_occupancy())
    }

    /// Starts the reactive flusher: wait for the over-soft signal, take a
    /// permit, flush the largest region's memtable list, repeat.
    pub fn start_flusher(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.flush_when_needed().await;
        });
        *self.flusher.lock().expect("dirty manager flusher poisoned") = Some(handle);
    }

    async fn flush_when_needed(self: Arc<Self>) {
        loop {
            self.group.start_reclaiming().await;
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            if self.explicit_flushers_queued() {
                // Explicit flushers free memory too; let them run first.
                tokio::task::yield_now().await;
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                continue;
            }
            let permit = self.acquire_flush_permit(false).await;
            if let Some(list) = self.largest_list() {
                if let Err(err) = list.seal_active(FlushBehavior::Immediate).await {
                    log::error!(
                        "reactive flush on group `{}` failed: {err}",
                        self.group.name()
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            } else {
                // Nothing to flush; wait for occupancy changes.
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            drop(permit);
            if self.group.over_soft_limit() {
                // Sealed memtables keep their charge until their flush
                // lands; give the in-flight work a moment.
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }

    /// Stops the reactive loop and drains every in-flight flush.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.group.close();
        let handle = self
            .flusher
            .lock()
            .expect("dirty manager flusher poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // Holding every permit proves no flush is still running.
        let _all = Arc::clone(&self.flush_permits)
            .acquire_many_owned(DEFAULT_FLUSH_PERMITS as u32)
            .await
            .expect("flush permit semaphore closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn permits_bound_concurrent_flushes() {
        let manager = DirtyMemoryManager::new("user", 1 << 20, 1 << 21);
        let a = manager.acquire_flush_permit(true).await;
        let b = manager.acquire_flush_permit(false).await;
        let third = tokio::time::timeout(
            Duration::from_millis(50),
            manager.acquire_flush_permit(false),
        )
        .await;
        assert!(third.is_err(), "third permit must wait");
        drop(a);
        drop(b);
        let _ = manager.acquire_flush_permit(false).await;
    }

    #[tokio::test]
    async fn explicit_waiters_are_visible() {
        let manager = DirtyMemoryManager::new("user", 1 << 20, 1 << 21);
        let _a = manager.acquire_flush_permit(false).await;
        let _b = manager.acquire_flush_permit(false).await;
        let inner = Arc::clone(&manager);
        let waiter = tokio::spawn(async move {
            let _p = inner.acquire_flush_permit(true).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.explicit_flushers_queued());
        drop(_a);
        waiter.await.unwrap();
        assert!(!manager.explicit_flushers_queued());
    }

    #[tokio::test]
    async fn shutdown_drains_and_stops() {
        let manager = DirtyMemoryManager::new("user", 1 << 20, 1 << 21);
        manager.start_flusher();
        manager.shutdown().await;
    }
}
