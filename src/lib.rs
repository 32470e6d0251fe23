//! Stratadb is the per-shard storage engine of a distributed wide-column database,
//! built on a log-structured merge (LSM) design.
//!
//! ## Introduction
//!
//! Writes enter an in-memory, partition-ordered memtable and are journaled to a
//! commit log. Once a memtable is sealed it is flushed to an immutable sorted
//! on-disk table (sstable); sstables are periodically merged by background
//! compaction. Reads fan out to every memtable plus the row cache or the on-disk
//! set and are fused by a combined reader that reconciles cells by timestamp, so
//! a partition is always observed as the logical merge of everything applied to it.
//!
//! A token derived from the partition key places every partition on a shard; all
//! column-family state is owned by its shard and sstables record the set of
//! shards that own them.
//!
//! ### Features
//! - [x] Partition-ordered lock-free memtables
//! - [x] Replay-position-ordered flush pipeline; commit-log segments are only
//!   discarded once every preceding memtable is durable
//! - [x] Row cache updated in lockstep with flushes
//! - [x] Dirty-memory accounting with soft/hard limits and reactive flushing
//! - [x] Bloom filters and clustering-range metadata to prune sstables on reads
//! - [x] Size-tiered compaction with vote-based cross-shard sstable deletion
//! - [x] Streaming-ingest path for repair and bootstrap, including oversized
//!   partitions fragmented across many sstables
//! - [x] Tokio runtime for background flush and compaction tasks
//!
//! ### It is not:
//! - A query language or planner
//! - A replication or consensus layer (placement is consumed as a token → endpoint view)
//!
//! # Basic usage
//!
//! ```rust
//! use stratadb::cfg::Config;
//! use stratadb::db::Database;
//! use stratadb::mutation::Mutation;
//! use stratadb::schema::Schema;
//! # use tempfile::tempdir;
//!
//! #[tokio::main]
//! async fn main() {
//!     let root = tempdir().unwrap();
//!     let mut config = Config::default();
//!     config.data_file_directories = vec![root.path().to_path_buf()];
//!
//!     let db = Database::open(config).await.unwrap();
//!     db.add_keyspace("apps", 1).await.unwrap();
//!     let schema = Schema::builder("apps", "events").build();
//!     let cf = db.add_column_family(schema.clone()).await.unwrap();
//!
//!     let mut m = Mutation::new(schema.id, cf.decorate(b"device-1"));
//!     m.set_cell(&[], "status", b"online".to_vec(), 10);
//!     db.apply(&schema, m).await.unwrap();
//!
//!     let partition = cf.read_partition(&cf.decorate(b"device-1")).await.unwrap();
//!     assert!(partition.is_some());
//! }
//! ```

pub mod cache;
pub mod cf;
pub mod cfg;
pub mod commitlog;
pub mod compaction;
mod consts;
pub mod db;
pub mod dirty;
pub mod err;
pub mod filter;
pub mod flush;
pub mod keyspace;
pub mod memtable;
pub mod mutation;
pub mod partitioner;
pub mod reader;
pub mod region;
pub mod schema;
pub mod sstable;
mod tests;
pub mod types;
