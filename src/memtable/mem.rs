//! # Memtable
//!
//! A memtable buffers writes in RAM as a partition-ordered map of decorated
//! key to merged partition. Entries live in a lock-free SkipMap so reads never
//! block writers. A memtable is either active (the single mutable head of its
//! list) or sealed: immutable and queued for flush. Its memory is an accounted
//! region charged against the owning dirty-memory group, and it remembers the
//! highest replay position applied so the flush pipeline can order itself.

use crate::commitlog::ReplayPosition;
use crate::mutation::{Mutation, Partition};
use crate::partitioner::{DecoratedKey, PartitionRange};
use crate::region::{Region, RegionGroup};
use chrono::{DateTime, Utc};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct Memtable {
    /// Lock-free skipmap from crossbeam, ordered by decorated key
    partitions: SkipMap<DecoratedKey, Mutex<Partition>>,

    /// Accounted arena backing this memtable
    region: Region,

    /// Highest replay position of any contained mutation
    replay_position: Mutex<ReplayPosition>,

    /// Sealed memtables are immutable and await flush
    sealed: AtomicBool,

    /// Date created
    pub created_at: DateTime<Utc>,
}

impl Memtable {
    pub fn new(group: Arc<RegionGroup>) -> Self {
        Self {
            partitions: SkipMap::new(),
            region: Region::new(group),
            replay_position: Mutex::new(ReplayPosition::ZERO),
            sealed: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    /// Merges a mutation into the memtable, charging its footprint against
    /// the region group first; the charge may suspend on the hard limit.
    pub async fn apply(&self, m: &Mutation, rp: ReplayPosition) {
        let footprint = m.key.key.len() + m.partition.size_in_bytes() + 32;
        self.region.charge(footprint).await;

        let entry = self
            .partitions
            .get_or_insert_with(m.key.clone(), || Mutex::new(Partition::new()));
        entry
            .value()
            .lock()
            .expect("memtable partition poisoned")
            .apply(&m.partition);

        if !rp.is_zero() {
            let mut highest = self.replay_position.lock().expect("replay position poisoned");
            if rp > *highest {
                *highest = rp;
            }
        }
    }

    /// Point lookup; clones the merged partition out of the map.
    pub fn get(&self, key: &DecoratedKey) -> Option<Partition> {
        self.partitions
            .get(key)
            .map(|e| e.value().lock().expect("memtable partition poisoned").clone())
    }

    /// Ordered snapshot of every partition overlapping `range`.
    pub fn snapshot(&self, range: &PartitionRange) -> Vec<(DecoratedKey, Partition)> {
        self.partitions
            .range((range.start.clone(), range.end.clone()))
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().lock().expect("memtable partition poisoned").clone(),
                )
            })
            .collect()
    }

    /// Every partition in order, as consumed by the sstable writer.
    pub fn entries_for_flush(&self) -> Vec<(DecoratedKey, Partition)> {
        self.snapshot(&PartitionRange::full())
    }

    pub fn first_key(&self) -> Option<DecoratedKey> {
        self.partitions.front().map(|e| e.key().clone())
    }

    pub fn last_key(&self) -> Option<DecoratedKey> {
        self.partitions.back().map(|e| e.key().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn occupancy(&self) -> usize {
        self.region.occupancy()
    }

    pub fn region_group(&self) -> &Arc<RegionGroup> {
        self.region.group()
    }

    pub fn replay_position(&self) -> ReplayPosition {
        *self.replay_position.lock().expect("replay position poisoned")
    }

    /// Seals the memtable; it becomes read-only
    pub fn mark_sealed(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Returns the dirty-memory charge once the contents are durable.
    pub fn release_memory(&self) {
        self.region.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::decorate;
    use uuid::Uuid;

    fn memtable() -> Memtable {
        Memtable::new(RegionGroup::new("test", 1 << 20, 1 << 21))
    }

    fn mutation(key: &[u8], column: &str, value: &[u8], ts: i64) -> Mutation {
        let mut m = Mutation::new(Uuid::new_v4(), decorate(key));
        m.set_cell(&[], column, value.to_vec(), ts);
        m
    }

    #[tokio::test]
    async fn apply_then_get() {
        let mt = memtable();
        mt.apply(&mutation(b"k1", "v", b"a", 10), ReplayPosition::new(1, 1))
            .await;
        let partition = mt.get(&decorate(b"k1")).unwrap();
        assert_eq!(
            partition.live_cell(&vec![], "v", u32::MAX - 1).unwrap().value(),
            Some(&b"a"[..])
        );
        assert!(mt.get(&decorate(b"missing")).is_none());
    }

    #[tokio::test]
    async fn same_key_mutations_are_merged() {
        let mt = memtable();
        mt.apply(&mutation(b"k1", "v", b"old", 5), ReplayPosition::new(1, 1))
            .await;
        mt.apply(&mutation(b"k1", "v", b"new", 10), ReplayPosition::new(1, 2))
            .await;
        assert_eq!(mt.len(), 1);
        let partition = mt.get(&decorate(b"k1")).unwrap();
        assert_eq!(
            partition.live_cell(&vec![], "v", u32::MAX - 1).unwrap().value(),
            Some(&b"new"[..])
        );
    }

    #[tokio::test]
    async fn replay_position_tracks_the_highest_applied() {
        let mt = memtable();
        mt.apply(&mutation(b"a", "v", b"1", 1), ReplayPosition::new(1, 10))
            .await;
        mt.apply(&mutation(b"b", "v", b"2", 2), ReplayPosition::new(1, 5))
            .await;
        assert_eq!(mt.replay_position(), ReplayPosition::new(1, 10));
    }

    #[tokio::test]
    async fn zero_replay_position_is_ignored() {
        let mt = memtable();
        mt.apply(&mutation(b"a", "v", b"1", 1), ReplayPosition::ZERO)
            .await;
        assert_eq!(mt.replay_position(), ReplayPosition::ZERO);
    }

    #[tokio::test]
    async fn snapshot_is_ordered_by_decorated_key() {
        let mt = memtable();
        for key in [&b"c"[..], b"a", b"b", b"d"] {
            mt.apply(&mutation(key, "v", b"x", 1), ReplayPosition::ZERO)
                .await;
        }
        let snapshot = mt.entries_for_flush();
        assert_eq!(snapshot.len(), 4);
        for pair in snapshot.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[tokio::test]
    async fn occupancy_grows_with_writes_and_releases() {
        let mt = memtable();
        mt.apply(&mutation(b"k", "v", b"payload", 1), ReplayPosition::ZERO)
            .await;
        assert!(mt.occupancy() > 0);
        assert_eq!(mt.region_group().total(), mt.occupancy());
        mt.release_memory();
        assert_eq!(mt.occupancy(), 0);
        assert_eq!(mt.region_group().total(), 0);
    }
}
