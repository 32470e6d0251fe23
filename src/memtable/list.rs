//! # Memtable list
//!
//! Small ordered sequence of memtables for one column family. Exactly one is
//! active and mutable; the rest are sealed and awaiting flush. The list does
//! not flush by itself: sealing delegates to the owning column family through
//! the seal function it was constructed with, so regular, streaming, and
//! per-plan big lists each get their own flush semantics.

use crate::commitlog::ReplayPosition;
use crate::consts::STREAMING_FLUSH_DELAY;
use crate::dirty::DirtyMemoryManager;
use crate::err::Error;
use crate::memtable::Memtable;
use crate::mutation::Mutation;
use crate::region::RegionGroup;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// How urgently `seal_active` must start the flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushBehavior {
    /// Guaranteed to start now.
    Immediate,
    /// May coalesce with a short timer to batch many small mutations, as
    /// during streaming ingest.
    Delayed,
}

/// Seal callback installed by the column family; performs the actual
/// rotate-write-publish flush sequence for this list.
pub type SealFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

type SharedFlush = Shared<BoxFuture<'static, Result<(), String>>>;

pub struct MemtableList {
    group: Arc<RegionGroup>,
    dirty: Arc<DirtyMemoryManager>,
    memtables: RwLock<Vec<Arc<Memtable>>>,
    seal: SealFn,
    flush_request: Mutex<Option<SharedFlush>>,
    delayed_seal_scheduled: AtomicBool,
    write_buffer_size: usize,
}

impl MemtableList {
    pub fn new(
        dirty: Arc<DirtyMemoryManager>,
        seal: SealFn,
        write_buffer_size: usize,
    ) -> Arc<Self> {
        let group = Arc::clone(dirty.region_group());
        let active = Arc::new(Memtable::new(Arc::clone(&group)));
        Arc::new(Self {
            group,
            dirty,
            memtables: RwLock::new(vec![active]),
            seal,
            flush_request: Mutex::new(None),
            delayed_seal_scheduled: AtomicBool::new(false),
            write_buffer_size,
        })
    }

    /// The active memtable.
    pub fn back(&self) -> Arc<Memtable> {
        self.memtables
            .read()
            .expect("memtable list poisoned")
            .last()
            .cloned()
            .expect("memtable list always holds an active memtable")
    }

    /// Every memtable, oldest first; sealed ones precede the active one.
    pub fn all(&self) -> Vec<Arc<Memtable>> {
        self.memtables.read().expect("memtable list poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.memtables.read().expect("memtable list poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        // The list always holds an active memtable; emptiness is about data.
        self.all().iter().all(|m| m.is_empty())
    }

    /// Writes into the active memtable's region.
    pub async fn apply(&self, m: &Mutation, rp: ReplayPosition) {
        let active = self.back();
        active.apply(m, rp).await;
        if active.is_sealed() {
            // A seal raced the write. Reapplying into the new active is safe:
            // reconciliation absorbs the duplicate.
            let current = self.back();
            if !Arc::ptr_eq(&active, &current) {
                current.apply(m, rp).await;
            }
        }
    }

    /// Seals the current active memtable and pushes a fresh one; returns the
    /// sealed memtable, or `None` when it held no data.
    pub fn seal_and_rotate(&self) -> Option<Arc<Memtable>> {
        let mut guard = self.memtables.write().expect("memtable list poisoned");
        let old = guard.last().cloned()?;
        if old.is_empty() {
            return None;
        }
        old.mark_sealed();
        guard.push(Arc::new(Memtable::new(Arc::clone(&self.group))));
        Some(old)
    }

    /// Removes a flushed memtable from the list.
    pub fn erase(&self, memtable: &Arc<Memtable>) {
        self.memtables
            .write()
            .expect("memtable list poisoned")
            .retain(|m| !Arc::ptr_eq(m, memtable));
    }

    /// Drops every memtable and its data, releasing all charges; a fresh
    /// active memtable takes over. Used by truncate.
    pub fn discard_all(&self) {
        let mut guard = self.memtables.write().expect("memtable list poisoned");
        for memtable in guard.drain(..) {
            memtable.release_memory();
        }
        guard.push(Arc::new(Memtable::new(Arc::clone(&self.group))));
    }

    /// Whether the active memtable has outgrown its write buffer.
    pub fn should_flush(&self) -> bool {
        self.back().occupancy() >= self.write_buffer_size
    }

    /// Occupancy of the active memtable; the reactive flusher picks the
    /// largest region across lists.
    pub fn active_occupancy(&self) -> usize {
        self.back().occupancy()
    }

    /// Seals the active memtable. `Immediate` starts the flush now;
    /// `Delayed` arms a coalescing timer and returns.
    pub async fn seal_active(self: &Arc<Self>, behavior: FlushBehavior) -> Result<(), Error> {
        match behavior {
            FlushBehavior::Immediate => (self.seal)().await,
            FlushBehavior::Delayed => {
                if self
                    .delayed_seal_scheduled
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // A timer is already armed; this seal coalesces with it.
                    return Ok(());
                }
                let list = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(STREAMING_FLUSH_DELAY).await;
                    list.delayed_seal_scheduled.store(false, Ordering::Release);
                    if let Err(err) = (list.seal)().await {
                        log::error!("delayed seal failed: {err}");
                    }
                });
                Ok(())
            }
        }
    }

    /// Requests a flush of this list. Idempotent: concurrent callers share
    /// one in-flight future. The request takes a flush permit from the
    /// dirty-memory manager, then seals immediately.
    pub async fn request_flush(self: &Arc<Self>) -> Result<(), Error> {
        let shared = {
            let mut guard = self.flush_request.lock().expect("flush request poisoned");
            match guard.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let list = Arc::clone(self);
                    let fut: SharedFlush = async move {
                        let _permit = list.dirty.acquire_flush_permit(true).await;
                        let result = list
                            .seal_active(FlushBehavior::Immediate)
                            .await
                            .map_err(|e| e.to_string());
                        *list.flush_request.lock().expect("flush request poisoned") = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *guard = Some(fut.clone());
                    fut
                }
            }
        };
        shared.await.map_err(Error::FlushRequestFailed)
    }
}
