use crate::consts::{
    DEFAULT_BATCH_SIZE_WARN_THRESHOLD_IN_KB, DEFAULT_COMPACTION_INTERVAL_MILLIS,
    DEFAULT_FALSE_POSITIVE_RATE, DEFAULT_MAX_CACHED_PARTITION_SIZE_IN_KB,
    DEFAULT_MAX_CONCURRENT_READS, DEFAULT_MAX_READ_QUEUE_LENGTH,
    DEFAULT_READ_REQUEST_TIMEOUT_IN_MS, SSTABLE_VERSION, WRITE_BUFFER_SIZE,
};
use std::path::PathBuf;

#[derive(Clone, Debug)]
/// Configuration options for the storage engine.
pub struct Config {
    /// Directories that hold keyspace data; the first one is used for
    /// newly created keyspaces.
    pub data_file_directories: Vec<PathBuf>,

    /// Total space granted to memtables across all column families, in MB.
    /// Zero picks the built-in default.
    pub memtable_total_space_in_mb: usize,

    /// Writes whose frozen size exceeds this threshold are logged as warnings.
    pub batch_size_warn_threshold_in_kb: usize,

    /// How long a read may wait for an admission slot before timing out.
    pub read_request_timeout_in_ms: u64,

    /// Journal writes to the commit log before applying them.
    pub enable_commitlog: bool,

    /// Serve reads through the row cache and keep it in lockstep with flushes.
    pub enable_cache: bool,

    /// Keep all data in memtables; sealing never writes sstables.
    pub enable_in_memory_data_store: bool,

    /// Hard-link each flushed sstable into the backups directory.
    pub incremental_backups: bool,

    /// Snapshot a column family before it is truncated or dropped.
    pub auto_snapshot: bool,

    /// Partitions larger than this are never admitted to the row cache.
    pub max_cached_partition_size_in_kb: usize,

    /// False positive rate for the sstable bloom filters. The lower the
    /// value, the more accurate, but it costs memory and CPU.
    pub false_positive_rate: f64,

    /// Concurrent reads admitted per column family; zero disables the gate.
    pub max_concurrent_reads: usize,

    /// Reads allowed to queue behind the admission gate before new ones
    /// are rejected with an overload error.
    pub max_read_queue_length: usize,

    /// The size of each memtable before a seal is requested.
    pub write_buffer_size: usize,

    /// Version string baked into sstable file names.
    pub sstable_version: String,

    /// How many shards the dataset is split across.
    pub shard_count: usize,

    /// The shard this engine instance is responsible for.
    pub shard_id: usize,

    /// Interval between background compaction strategy evaluations.
    pub compaction_interval_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_file_directories: Vec::new(),
            memtable_total_space_in_mb: 0,
            batch_size_warn_threshold_in_kb: DEFAULT_BATCH_SIZE_WARN_THRESHOLD_IN_KB,
            read_request_timeout_in_ms: DEFAULT_READ_REQUEST_TIMEOUT_IN_MS,
            enable_commitlog: true,
            enable_cache: true,
            enable_in_memory_data_store: false,
            incremental_backups: false,
            auto_snapshot: true,
            max_cached_partition_size_in_kb: DEFAULT_MAX_CACHED_PARTITION_SIZE_IN_KB,
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            max_read_queue_length: DEFAULT_MAX_READ_QUEUE_LENGTH,
            write_buffer_size: WRITE_BUFFER_SIZE,
            sstable_version: SSTABLE_VERSION.to_string(),
            shard_count: 1,
            shard_id: 0,
            compaction_interval_millis: DEFAULT_COMPACTION_INTERVAL_MILLIS,
        }
    }
}
