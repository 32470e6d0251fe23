//! The set of live sstables of one column family. The owning column family
//! publishes it copy-on-write: mutators clone the set, edit the clone, and
//! swap it in, so a reader holding a reference observes one stable set for
//! its whole lifetime regardless of concurrent flushes and compactions.

use crate::partitioner::PartitionRange;
use crate::sstable::Sstable;
use crate::types::Generation;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct SstableSet {
    /// Ordered by generation
    tables: Vec<Arc<Sstable>>,
}

impl SstableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(mut tables: Vec<Arc<Sstable>>) -> Self {
        tables.sort_by_key(|t| t.generation);
        Self { tables }
    }

    pub fn all(&self) -> &[Arc<Sstable>] {
        &self.tables
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Sstable>> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains_generation(&self, generation: Generation) -> bool {
        self.tables.iter().any(|t| t.generation == generation)
    }

    pub fn insert(&mut self, table: Arc<Sstable>) {
        match self
            .tables
            .binary_search_by_key(&table.generation, |t| t.generation)
        {
            Ok(slot) => self.tables[slot] = table,
            Err(slot) => self.tables.insert(slot, table),
        }
    }

    pub fn erase(&mut self, table: &Arc<Sstable>) {
        self.tables.retain(|t| t.generation != table.generation);
    }

    /// Candidate sstables whose key span intersects the range.
    pub fn select(&self, range: &PartitionRange) -> Vec<Arc<Sstable>> {
        self.tables
            .iter()
            .filter(|t| t.overlaps(range))
            .cloned()
            .collect()
    }

    /// Sum of live data bytes across the set.
    pub fn live_size_in_bytes(&self) -> u64 {
        self.tables.iter().map(|t| t.data_size()).sum()
    }
}
