//! # Mutation readers
//!
//! A mutation reader yields the merged mutations of a key range in decorated
//! key order. The read path builds one reader per memtable plus a cache or
//! sstable reader and fuses them with a combined reader that reconciles
//! equal-key mutations cell by cell, so callers observe one logically merged
//! partition regardless of where the data currently lives. Reader admission
//! can be restricted by a semaphore with a bounded wait queue.

use crate::cache::RowCache;
use crate::err::Error;
use crate::mutation::{Mutation, Partition};
use crate::partitioner::{DecoratedKey, PartitionRange};
use crate::sstable::Sstable;
use crate::types::ShardId;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Yields merged mutations in decorated-key order.
#[async_trait]
pub trait MutationReader: Send {
    async fn next(&mut self) -> Result<Option<Mutation>, Error>;
}

pub type MutationReaderBox = Box<dyn MutationReader>;

/// A reader over nothing; the single-key fast path for foreign shards.
pub struct EmptyReader;

#[async_trait]
impl MutationReader for EmptyReader {
    async fn next(&mut self) -> Result<Option<Mutation>, Error> {
        Ok(None)
    }
}

/// Reader over a memtable snapshot taken at construction.
pub struct MemtableReader {
    cf_id: Uuid,
    entries: VecDeque<(DecoratedKey, Partition)>,
}

impl MemtableReader {
    pub fn new(cf_id: Uuid, entries: Vec<(DecoratedKey, Partition)>) -> Self {
        Self {
            cf_id,
            entries: entries.into(),
        }
    }
}

#[async_trait]
impl MutationReader for MemtableReader {
    async fn next(&mut self) -> Result<Option<Mutation>, Error> {
        Ok(self.entries.pop_front().map(|(key, partition)| Mutation {
            cf_id: self.cf_id,
            key,
            partition,
        }))
    }
}

/// Reader over one sstable. Rows are loaded lazily on the first pull; a
/// shared sstable emits only keys owned by the current shard.
pub struct SstableReader {
    cf_id: Uuid,
    sstable: Arc<Sstable>,
    range: PartitionRange,
    current_shard: Option<ShardId>,
    loaded: Option<VecDeque<(DecoratedKey, Partition)>>,
}

impl SstableReader {
    pub fn new(
        cf_id: Uuid,
        sstable: Arc<Sstable>,
        range: PartitionRange,
        current_shard: Option<ShardId>,
    ) -> Self {
        Self {
            cf_id,
            sstable,
            range,
            current_shard,
            loaded: None,
        }
    }
}

#[async_trait]
impl MutationReader for SstableReader {
    async fn next(&mut self) -> Result<Option<Mutation>, Error> {
        if self.loaded.is_none() {
            let rows = self
                .sstable
                .read_range(&self.range, self.current_shard)
                .await?;
            self.loaded = Some(rows.into());
        }
        Ok(self
            .loaded
            .as_mut()
            .and_then(VecDeque::pop_front)
            .map(|(key, partition)| Mutation {
                cf_id: self.cf_id,
                key,
                partition,
            }))
    }
}

struct PeekedReader {
    inner: MutationReaderBox,
    peeked: Option<Mutation>,
    exhausted: bool,
}

impl PeekedReader {
    async fn fill(&mut self) -> Result<(), Error> {
        if self.peeked.is_none() && !self.exhausted {
            match self.inner.next().await? {
                Some(m) => self.peeked = Some(m),
                None => self.exhausted = true,
            }
        }
        Ok(())
    }
}

/// Merges sub-readers by decorated key, reconciling per-key mutations
/// cell-wise: the fused view of memtables, cache, and sstables.
pub struct CombinedReader {
    readers: Vec<PeekedReader>,
}

impl CombinedReader {
    pub fn new(readers: Vec<MutationReaderBox>) -> Self {
        Self {
            readers: readers
                .into_iter()
                .map(|inner| PeekedReader {
                    inner,
                    peeked: None,
                    exhausted: false,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl MutationReader for CombinedReader {
    async fn next(&mut self) -> Result<Option<Mutation>, Error> {
        for reader in &mut self.readers {
            reader.fill().await?;
        }
        let smallest = self
            .readers
            .iter()
            .filter_map(|r| r.peeked.as_ref().map(|m| m.key.clone()))
            .min();
        let Some(key) = smallest else {
            return Ok(None);
        };
        let mut merged: Option<Mutation> = None;
        for reader in &mut self.readers {
            let matches = reader
                .peeked
                .as_ref()
                .map(|m| m.key == key)
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let m = reader.peeked.take().expect("peeked mutation present");
            match merged.as_mut() {
                Some(acc) => acc.partition.apply(&m.partition),
                None => merged = Some(m),
            }
        }
        Ok(merged)
    }
}

/// Read-through reader in front of the sstable side. Hits serve straight
/// from the cache; misses pull from the underlying reader and populate
/// entries bounded by the configured partition size cap.
pub struct CacheReader {
    cache: Arc<RowCache>,
    range: PartitionRange,
    fallback: MutationReaderBox,
    cf_id: Uuid,
    served_hit: bool,
    done: bool,
}

impl CacheReader {
    pub fn new(
        cache: Arc<RowCache>,
        cf_id: Uuid,
        range: PartitionRange,
        fallback: MutationReaderBox,
    ) -> Self {
        Self {
            cache,
            range,
            fallback,
            cf_id,
            served_hit: false,
            done: false,
        }
    }
}

#[async_trait]
impl MutationReader for CacheReader {
    async fn next(&mut self) -> Result<Option<Mutation>, Error> {
        if self.done {
            return Ok(None);
        }
        if let Some(key) = self.range.singular_key() {
            self.done = true;
            if !self.served_hit {
                if let Some(partition) = self.cache.get(key) {
                    self.served_hit = true;
                    return Ok(Some(Mutation {
                        cf_id: self.cf_id,
                        key: key.clone(),
                        partition,
                    }));
                }
            }
            let from_disk = self.fallback.next().await?;
            if let Some(m) = &from_disk {
                self.cache.populate(&m.key, &m.partition);
            }
            return Ok(from_disk);
        }

        // Range reads go to the sstables and populate opportunistically.
        let from_disk = self.fallback.next().await?;
        match from_disk {
            Some(m) => {
                self.cache.populate(&m.key, &m.partition);
                Ok(Some(m))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

/// Admission gate for reads: a semaphore with a bounded wait queue and a
/// per-acquisition timeout. Queue overflow raises a dedicated overload
/// error rather than waiting.
pub struct ReadGate {
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    max_queue_length: usize,
    timeout: Duration,
}

impl ReadGate {
    pub fn new(max_concurrent: usize, max_queue_length: usize, timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queued: AtomicUsize::new(0),
            max_queue_length,
            timeout,
        }
    }

    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, Error> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }
        let queued = self.queued.fetch_add(1, Ordering::AcqRel);
        if queued >= self.max_queue_length {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::RequestThrottled {
                max_queue_length: self.max_queue_length,
            });
        }
        let acquired = tokio::time::timeout(
            self.timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => Err(Error::ReadTimeout),
        }
    }
}

/// A reader holding its admission permit for its whole lifetime.
pub struct RestrictedReader {
    _permit: OwnedSemaphorePermit,
    inner: MutationReaderBox,
}

impl RestrictedReader {
    pub fn new(permit: OwnedSemaphorePermit, inner: MutationReaderBox) -> Self {
        Self {
            _permit: permit,
            inner,
        }
    }
}

#[async_trait]
impl MutationReader for RestrictedReader {
    async fn next(&mut self) -> Result<Option<Mutation>, Error> {
        self.inner.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::decorate;

    fn mutation(cf_id: Uuid, key: &[u8], column: &str, value: &[u8], ts: i64) -> Mutation {
        let mut m = Mutation::new(cf_id, decorate(key));
        m.set_cell(&[], column, value.to_vec(), ts);
        m
    }

    #[tokio::test]
    async fn combined_reader_merges_by_key() {
        let cf_id = Uuid::new_v4();
        let old = mutation(cf_id, b"k", "v", b"old", 5);
        let new = mutation(cf_id, b"k", "v", b"new", 10);
        let other = mutation(cf_id, b"zz-other", "v", b"x", 1);

        let a = MemtableReader::new(
            cf_id,
            vec![(old.key.clone(), old.partition.clone())],
        );
        let mut entries = vec![
            (new.key.clone(), new.partition.clone()),
            (other.key.clone(), other.partition.clone()),
        ];
        entries.sort_by(|x, y| x.0.cmp(&y.0));
        let b = MemtableReader::new(cf_id, entries);

        let mut combined = CombinedReader::new(vec![Box::new(a), Box::new(b)]);
        let mut seen = Vec::new();
        while let Some(m) = combined.next().await.unwrap() {
            seen.push(m);
        }
        assert_eq!(seen.len(), 2);
        // Keys come out in decorated-key order and the duplicate key is
        // reconciled: ts 10 wins.
        assert!(seen.windows(2).all(|w| w[0].key < w[1].key));
        let merged = seen.iter().find(|m| m.key == new.key).unwrap();
        assert_eq!(
            merged
                .partition
                .live_cell(&vec![], "v", u32::MAX - 1)
                .unwrap()
                .value(),
            Some(&b"new"[..])
        );
    }

    #[tokio::test]
    async fn empty_reader_yields_nothing() {
        let mut reader = EmptyReader;
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_gate_rejects_overflow() {
        let gate = ReadGate::new(1, 0, Duration::from_millis(50));
        let held = gate.admit().await.unwrap();
        let err = gate.admit().await.unwrap_err();
        assert!(matches!(err, Error::RequestThrottled { .. }));
        drop(held);
        assert!(gate.admit().await.is_ok());
    }

    #[tokio::test]
    async fn read_gate_times_out() {
        let gate = ReadGate::new(1, 4, Duration::from_millis(30));
        let _held = gate.admit().await.unwrap();
        let err = gate.admit().await.unwrap_err();
        assert!(matches!(err, Error::ReadTimeout));
    }
}
