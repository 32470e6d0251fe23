use crate::commitlog::ReplayPosition;
use std::{io, path::PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// There was an error while creating a directory
    #[error("Failed to create directory `{path}`: {error}")]
    DirCreationError {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    /// There was an error while opening a file
    #[error("Failed to open file `{path}`: {error}")]
    FileOpenError {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    /// There was an error while attempting to read a file
    #[error("Failed to read file `{path}`: {error}")]
    FileReadError { path: PathBuf, error: io::Error },

    /// There was an error while attempting to write to a file
    #[error("Failed to write to file `{path}`: {error}")]
    FileWriteError { path: PathBuf, error: io::Error },

    /// There was an error while attempting to sync writes to a file
    #[error("Failed to sync writes to file `{path}`: {error}")]
    FileSyncError { path: PathBuf, error: io::Error },

    /// There was an error while renaming a file
    #[error("Failed to rename file `{from}`: {error}")]
    FileRenameError { from: PathBuf, error: io::Error },

    /// There was an error while removing a file
    #[error("Failed to remove file `{path}`: {error}")]
    FileRemoveError { path: PathBuf, error: io::Error },

    /// There was an error while hard-linking a snapshot file
    #[error("Failed to link snapshot file `{path}`: {error}")]
    SnapshotLinkError { path: PathBuf, error: io::Error },

    #[error("Failed to get file metadata for `{path}`: {error}")]
    GetFileMetaDataError { path: PathBuf, error: io::Error },

    /// A file in a column family directory does not follow the
    /// `<ks>-<cf>-<version>-<generation>-<component>.db` pattern
    #[error("Invalid sstable file name `{name}`")]
    InvalidSstableFilename { name: String },

    /// An sstable on disk is structurally broken
    #[error("Malformed sstable `{path}`: {reason}")]
    MalformedSstable { path: PathBuf, reason: String },

    /// A generation has data files but no TOC; the sstable cannot be trusted
    #[error("Sstable generation {generation} has no TOC component")]
    MissingToc { generation: u64 },

    /// A generation announced two TOC components
    #[error("Sstable generation {generation} has more than one TOC component")]
    DuplicateToc { generation: u64 },

    /// A component listed in the TOC is absent on disk
    #[error("Sstable generation {generation} is missing component `{component}`")]
    SstableComponentMissing { generation: u64, component: &'static str },

    /// There was an error while encoding an on-disk or wire payload
    #[error("Failed to encode {context}: {error}")]
    EncodeError {
        context: &'static str,
        #[source]
        error: bincode::Error,
    },

    /// There was an error while decoding an on-disk or wire payload
    #[error("Failed to decode {context}: {error}")]
    DecodeError {
        context: &'static str,
        #[source]
        error: bincode::Error,
    },

    /// There was an error while reading or writing a JSON component
    #[error("Failed to serialize {context}: {error}")]
    JsonError {
        context: &'static str,
        #[source]
        error: serde_json::Error,
    },

    /// The sstable data payload could not be decompressed
    #[error("Failed to decompress sstable block in `{path}`")]
    DecompressError { path: PathBuf },

    /// The write carried a schema the column family has not seen yet
    #[error("Schema is not synced: write used {got}, column family holds {expected}")]
    SchemaNotSynced { expected: Uuid, got: Uuid },

    /// A write arrived with a replay position below the flush high-water mark
    #[error("Replay position reordering: applying {applied:?} but highest flushed is {highest_flushed:?}")]
    ReplayPositionReordering {
        applied: ReplayPosition,
        highest_flushed: ReplayPosition,
    },

    /// The read admission queue is full
    #[error("Too many queued reads, max queue length is {max_queue_length}")]
    RequestThrottled { max_queue_length: usize },

    /// A read did not obtain an admission slot within the configured timeout
    #[error("Read request timed out")]
    ReadTimeout,

    /// The cross-shard atomic deletion was cancelled; the sstables stay
    /// in the compacted-but-not-deleted list
    #[error("Atomic sstable deletion cancelled")]
    DeletionCancelled,

    #[error("Keyspace `{name}` does not exist")]
    KeyspaceNotFound { name: String },

    #[error("Column family `{keyspace}.{name}` does not exist")]
    ColumnFamilyNotFound { keyspace: String, name: String },

    #[error("Keyspace `{name}` already exists")]
    KeyspaceAlreadyExists { name: String },

    #[error("Column family `{keyspace}.{name}` already exists")]
    ColumnFamilyAlreadyExists { keyspace: String, name: String },

    /// New flush work was submitted after the queue was closed
    #[error("Flush queue is closed")]
    FlushQueueClosed,

    #[error("Streaming plan `{plan_id}` is unknown to this column family")]
    StreamingPlanNotFound { plan_id: Uuid },

    /// Error occured during compaction
    #[error("Compaction failed, reason: {0}")]
    CompactionFailed(String),

    /// A shared flush request failed for every caller awaiting it
    #[error("Flush request failed: {0}")]
    FlushRequestFailed(String),

    /// Error occured while flushing a memtable to an sstable
    #[error("Error occured while flushing to disk")]
    FlushToDiskError {
        #[source]
        error: Box<Self>,
    },

    #[error("No data file directories configured")]
    NoDataDirectories,

    #[error("Storage engine is shutting down")]
    ShuttingDown,
}
