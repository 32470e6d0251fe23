//! # Compaction
//!
//! Strategies decide which sstables to merge and at what level; the column
//! family runs the merge and republishes its sstable set. The size-tiered
//! strategy buckets sstables of similar size and compacts any bucket that
//! crosses the threshold; the null strategy never compacts (tooling and
//! tests).

mod deletion;
mod sized;

pub use deletion::AtomicDeletionManager;
pub use sized::SizeTieredStrategy;

use crate::schema::CompactionStrategyKind;
use crate::sstable::{Sstable, SstableSet};
use std::sync::Arc;

/// One unit of compaction work: which inputs to merge and the output level.
#[derive(Clone, Debug)]
pub struct CompactionDescriptor {
    pub inputs: Vec<Arc<Sstable>>,
    pub output_level: u32,
}

/// Capability contract: picks compaction work off the live sstable set.
pub trait CompactionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The next merge worth doing, if any.
    fn select(&self, set: &SstableSet) -> Option<CompactionDescriptor>;
}

/// A strategy that never compacts.
pub struct NullStrategy;

impl CompactionStrategy for NullStrategy {
    fn name(&self) -> &'static str {
        "NullCompactionStrategy"
    }

    fn select(&self, _set: &SstableSet) -> Option<CompactionDescriptor> {
        None
    }
}

pub fn strategy_for(kind: CompactionStrategyKind) -> Arc<dyn CompactionStrategy> {
    match kind {
        CompactionStrategyKind::SizeTiered => Arc::new(SizeTieredStrategy::default()),
        CompactionStrategyKind::Null => Arc::new(NullStrategy),
    }
}
