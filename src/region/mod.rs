//! # Memory regions
//!
//! Memtables own accounted arenas ("regions") whose occupancy is summed into
//! a region group. A group carries a soft and a hard limit: crossing the soft
//! limit signals the reactive flusher, and allocations above the hard limit
//! suspend the writer until a flush releases memory.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Summed occupancy of a set of regions, with backpressure limits.
#[derive(Debug)]
pub struct RegionGroup {
    name: &'static str,
    total: AtomicUsize,
    soft_limit: usize,
    hard_limit: usize,
    blocked_requests: AtomicU64,
    closed: AtomicBool,
    /// Woken whenever memory is released below the hard limit
    memory_freed: Notify,
    /// Woken whenever occupancy crosses the soft limit upward
    reclaim_needed: Notify,
}

impl RegionGroup {
    pub fn new(name: &'static str, soft_limit: usize, hard_limit: usize) -> Arc<Self> {
        assert!(soft_limit <= hard_limit, "soft limit above hard limit");
        Arc::new(Self {
            name,
            total: AtomicUsize::new(0),
            soft_limit,
            hard_limit,
            blocked_requests: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            memory_freed: Notify::new(),
            reclaim_needed: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    pub fn over_soft_limit(&self) -> bool {
        self.total() > self.soft_limit
    }

    /// Writers observed waiting on the hard limit so far.
    pub fn blocked_requests(&self) -> u64 {
        self.blocked_requests.load(Ordering::Relaxed)
    }

    /// Reserves `bytes`, suspending while the group sits above its hard
    /// limit. Below the soft limit writes proceed without waiting.
    pub async fn allocate(&self, bytes: usize) {
        let mut counted_as_blocked = false;
        loop {
            let current = self.total.load(Ordering::Acquire);
            if current + bytes <= self.hard_limit || self.closed.load(Ordering::Acquire) {
                if self
                    .total
                    .compare_exchange(
                        current,
                        current + bytes,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    if current + bytes > self.soft_limit {
                        self.reclaim_needed.notify_waiters();
                    }
                    return;
                }
                continue;
            }
            if !counted_as_blocked {
                counted_as_blocked = true;
                self.blocked_requests.fetch_add(1, Ordering::Relaxed);
            }
            self.reclaim_needed.notify_waiters();
            let freed = self.memory_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if self.total.load(Ordering::Acquire) + bytes <= self.hard_limit {
                continue;
            }
            freed.await;
        }
    }

    /// Returns `bytes` to the group and wakes blocked writers.
    pub fn release(&self, bytes: usize) {
        let mut current = self.total.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self
                .total
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.memory_freed.notify_waiters();
    }

    /// Completes once the group needs reclaiming (occupancy above the soft
    /// limit) or has been shut down.
    pub async fn start_reclaiming(&self) {
        loop {
            if self.over_soft_limit() || self.closed.load(Ordering::Acquire) {
                return;
            }
            let signal = self.reclaim_needed.notified();
            tokio::pin!(signal);
            signal.as_mut().enable();
            if self.over_soft_limit() || self.closed.load(Ordering::Acquire) {
                return;
            }
            signal.await;
        }
    }

    /// Unblocks every waiter; allocations are admitted unconditionally from
    /// here on so shutdown can drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.memory_freed.notify_waiters();
        self.reclaim_needed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The accounted arena owned by one memtable.
#[derive(Debug)]
pub struct Region {
    group: Arc<RegionGroup>,
    size: AtomicUsize,
}

impl Region {
    pub fn new(group: Arc<RegionGroup>) -> Self {
        Self {
            group,
            size: AtomicUsize::new(0),
        }
    }

    pub fn group(&self) -> &Arc<RegionGroup> {
        &self.group
    }

    pub fn occupancy(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Charges `bytes` against the group; may suspend on the hard limit.
    pub async fn charge(&self, bytes: usize) {
        self.group.allocate(bytes).await;
        self.size.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Releases the whole charge, typically once the memtable's contents are
    /// durable in an sstable. Idempotent.
    pub fn release_all(&self) {
        let held = self.size.swap(0, Ordering::AcqRel);
        if held > 0 {
            self.group.release(held);
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.release_all();
    }
}
