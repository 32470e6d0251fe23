/// Contains type aliases shared across modules to prevent redeclaration and help with readability
use std::sync::Arc;

use crate::memtable::Memtable;
use crate::partitioner::DecoratedKey;
use crate::sstable::SstableSet;

pub type Key = Vec<u8>;

pub type Value = Vec<u8>;

/// Logical write timestamp, totally ordering cell versions.
pub type Timestamp = i64;

/// Wall-clock seconds of a deletion, compared as unsigned.
pub type DeletionTime = u32;

pub type TtlSeconds = u32;

pub type Generation = u64;

pub type ShardId = usize;

pub type FlushSignal = u8;

pub type FlushReceiver = async_broadcast::Receiver<FlushSignal>;

pub type MemtableHandle = Arc<Memtable>;

pub type SstableSetHandle = Arc<SstableSet>;

/// Answers whether a partition key may exist in sstables other than the one
/// just flushed; drives cache population decisions.
pub type PresenceChecker = Box<dyn Fn(&DecoratedKey) -> bool + Send + Sync>;
