//! Sized Tier Compaction Strategy (STCS)
//!
//! Groups sstables into buckets of similar size; once a bucket holds at
//! least the minimum threshold of tables, the smallest ones are merged into
//! one table at the next level. Tables below the minimum sstable size all
//! share one bucket.

use crate::compaction::{CompactionDescriptor, CompactionStrategy};
use crate::consts::{BUCKET_HIGH, BUCKET_LOW, MAX_THRESHOLD, MIN_SSTABLE_SIZE, MIN_THRESHOLD};
use crate::sstable::{Sstable, SstableSet};
use std::sync::Arc;

pub struct SizeTieredStrategy {
    pub min_threshold: usize,
    pub max_threshold: usize,
    pub bucket_low: f64,
    pub bucket_high: f64,
    pub min_sstable_size: u64,
}

impl Default for SizeTieredStrategy {
    fn default() -> Self {
        Self {
            min_threshold: MIN_THRESHOLD,
            max_threshold: MAX_THRESHOLD,
            bucket_low: BUCKET_LOW,
            bucket_high: BUCKET_HIGH,
            min_sstable_size: MIN_SSTABLE_SIZE,
        }
    }
}

struct Bucket {
    average_size: u64,
    tables: Vec<Arc<Sstable>>,
}

impl SizeTieredStrategy {
    fn bucket_tables(&self, set: &SstableSet) -> Vec<Bucket> {
        let mut sorted: Vec<Arc<Sstable>> = set.all().to_vec();
        sorted.sort_by_key(|t| t.data_size());

        let mut buckets: Vec<Bucket> = Vec::new();
        for table in sorted {
            let size = table.data_size();
            let slot = buckets.iter_mut().find(|bucket| {
                let low = (bucket.average_size as f64 * self.bucket_low) as u64;
                let high = (bucket.average_size as f64 * self.bucket_high) as u64;
                (size >= low && size <= high)
                    || (size < self.min_sstable_size
                        && bucket.average_size < self.min_sstable_size)
            });
            match slot {
                Some(bucket) => {
                    let total = bucket.average_size * bucket.tables.len() as u64 + size;
                    bucket.tables.push(table);
                    bucket.average_size = total / bucket.tables.len() as u64;
                }
                None => buckets.push(Bucket {
                    average_size: size,
                    tables: vec![table],
                }),
            }
        }
        buckets
    }
}

impl CompactionStrategy for SizeTieredStrategy {
    fn name(&self) -> &'static str {
        "SizeTieredCompactionStrategy"
    }

    fn select(&self, set: &SstableSet) -> Option<CompactionDescriptor> {
        for bucket in self.bucket_tables(set) {
            if bucket.tables.len() < self.min_threshold {
                continue;
            }
            let mut inputs = bucket.tables;
            inputs.truncate(self.max_threshold);
            let output_level = inputs.iter().map(|t| t.level()).max().unwrap_or(0) + 1;
            return Some(CompactionDescriptor {
                inputs,
                output_level,
            });
        }
        None
    }
}
