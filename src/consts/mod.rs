pub const KB: usize = 1024;

pub const MB: usize = 1024 * KB;

/// Total memtable space used when the configuration leaves it at zero.
pub const DEFAULT_MEMTABLE_TOTAL_SPACE_IN_MB: usize = 64;

/// Extra room granted to the system dirty-memory manager so system queries
/// can still be served while user writes are throttled.
pub const SYSTEM_MEMORY_HEADROOM: usize = 10 * MB;

/// Share of the memtable space reserved for streaming ingest.
pub const STREAMING_SPACE_FRACTION: usize = 4;

/// Delayed streaming seals coalesce incoming mutations for up to this long.
pub const STREAMING_FLUSH_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// A failed sstable write is retried after this long; the data stays in the
/// sealed memtable until a write succeeds.
pub const FLUSH_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_secs(10);

/// Concurrent sstable writes allowed per dirty-memory manager.
pub const DEFAULT_FLUSH_PERMITS: usize = 2;

pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

pub const DEFAULT_READ_REQUEST_TIMEOUT_IN_MS: u64 = 5_000;

pub const DEFAULT_MAX_CONCURRENT_READS: usize = 128;

pub const DEFAULT_MAX_READ_QUEUE_LENGTH: usize = 1024;

pub const DEFAULT_BATCH_SIZE_WARN_THRESHOLD_IN_KB: usize = 5;

pub const DEFAULT_MAX_CACHED_PARTITION_SIZE_IN_KB: usize = 1024;

/// Default interval between strategy evaluations of the background compactor.
pub const DEFAULT_COMPACTION_INTERVAL_MILLIS: u64 = 60_000;

/// A memtable list asks for a seal once its active memtable crosses this size.
pub const WRITE_BUFFER_SIZE: usize = 50 * KB;

/// Tombstones may only be purged by compaction after the grace period, so
/// a dead replica cannot resurrect data it missed the deletion for.
pub const DEFAULT_GC_GRACE_SECONDS: u32 = 864_000;

pub const SYSTEM_KEYSPACE_NAME: &str = "system";

pub const SSTABLE_VERSION: &str = "la";

pub const SSTABLE_FILE_SUFFIX: &str = ".db";

pub const SNAPSHOTS_DIRECTORY_NAME: &str = "snapshots";

pub const UPLOAD_DIRECTORY_NAME: &str = "upload";

pub const SNAPSHOT_MANIFEST_NAME: &str = "manifest.json";

/// Segment capacity of the in-memory commit log implementation.
pub const COMMITLOG_SEGMENT_SIZE: usize = 32 * KB;

pub const FLUSH_SIGNAL: u8 = 1;

pub const DEFAULT_FLUSH_SIGNAL_CHANNEL_SIZE: usize = 32;

// Size-tiered compaction knobs.
pub const BUCKET_LOW: f64 = 0.5;

pub const BUCKET_HIGH: f64 = 1.5;

pub const MIN_SSTABLE_SIZE: u64 = 4 * KB as u64;

pub const MIN_THRESHOLD: usize = 4;

pub const MAX_THRESHOLD: usize = 32;

pub const SIZE_OF_U32: usize = std::mem::size_of::<u32>();

pub const SIZE_OF_U64: usize = std::mem::size_of::<u64>();
