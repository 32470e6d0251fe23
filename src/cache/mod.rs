//! # Row cache
//!
//! Partition-indexed cache fed by sstables and kept in lockstep with flushes.
//! After a flush, `update` applies the flushed memtable's mutations to every
//! already-cached partition, and may populate fresh entries when the presence
//! checker proves the key cannot exist in any other sstable (so the entry is
//! complete). Streaming ingest bypasses the cache entirely and invalidates
//! the ranges it touched.

use crate::commitlog::ReplayPosition;
use crate::memtable::Memtable;
use crate::mutation::Partition;
use crate::partitioner::{DecoratedKey, PartitionRange};
use crate::types::PresenceChecker;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub struct RowCache {
    entries: SkipMap<DecoratedKey, Mutex<Partition>>,

    /// Partitions larger than this never enter the cache
    max_partition_size: usize,

    enabled: AtomicBool,

    hits: AtomicU64,
    misses: AtomicU64,

    /// Replay position below which every cached partition is complete;
    /// raised by each flush-lockstep update
    high_water_rp: Mutex<ReplayPosition>,
}

impl RowCache {
    pub fn new(max_partition_size: usize, enabled: bool) -> Self {
        Self {
            entries: SkipMap::new(),
            max_partition_size,
            enabled: AtomicBool::new(enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            high_water_rp: Mutex::new(ReplayPosition::ZERO),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &DecoratedKey) -> Option<Partition> {
        if !self.is_enabled() {
            return None;
        }
        match self.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value().lock().expect("cache entry poisoned").clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read-through population, bounded by the partition size cap.
    pub fn populate(&self, key: &DecoratedKey, partition: &Partition) {
        if !self.is_enabled() || partition.size_in_bytes() > self.max_partition_size {
            return;
        }
        self.entries
            .insert(key.clone(), Mutex::new(partition.clone()));
    }

    /// Flush-lockstep update. Applies every partition of the flushed
    /// memtable to its cached entry; keys not yet cached are admitted only
    /// when `may_exist_elsewhere` says no other sstable can hold them, since
    /// a partial entry would serve wrong reads.
    pub fn update(&self, memtable: &Memtable, may_exist_elsewhere: PresenceChecker) {
        if !self.is_enabled() {
            return;
        }
        for (key, partition) in memtable.entries_for_flush() {
            match self.entries.get(&key) {
                Some(entry) => {
                    let mut cached = entry.value().lock().expect("cache entry poisoned");
                    cached.apply(&partition);
                    if cached.size_in_bytes() > self.max_partition_size {
                        drop(cached);
                        self.entries.remove(&key);
                    }
                }
                None => {
                    if !may_exist_elsewhere(&key) {
                        self.populate(&key, &partition);
                    }
                }
            }
        }
        let mut high_water = self.high_water_rp.lock().expect("cache high water poisoned");
        let flushed = memtable.replay_position();
        if flushed > *high_water {
            *high_water = flushed;
        }
    }

    /// Drops every cached partition inside the range; used by streaming
    /// ingest, which never updates the cache in lockstep.
    pub fn invalidate(&self, range: &PartitionRange) {
        let keys: Vec<DecoratedKey> = self
            .entries
            .range((range.start.clone(), range.end.clone()))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.entries.remove(&key);
        }
    }

    pub fn invalidate_key(&self, key: &DecoratedKey) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
        *self.high_water_rp.lock().expect("cache high water poisoned") = ReplayPosition::ZERO;
    }

    pub fn contains(&self, key: &DecoratedKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn high_water_replay_position(&self) -> ReplayPosition {
        *self.high_water_rp.lock().expect("cache high water poisoned")
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
