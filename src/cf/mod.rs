//! # Column family
//!
//! The orchestrator of one table's storage: it owns the memtable lists (regular
//! and streaming), the copy-on-write sstable set, the row cache, the
//! replay-position-ordered flush queue, and the compaction hooks, and exposes
//! the read/apply/flush/compact surface the database routes to.

mod compact;
mod maintenance;
mod streaming;

pub use maintenance::SnapshotBarrier;
pub use streaming::StreamingMemtableBig;

use crate::cache::RowCache;
use crate::cfg::Config;
use crate::commitlog::{CommitLog, ReplayPosition};
use crate::compaction::{strategy_for, AtomicDeletionManager, CompactionStrategy};
use crate::consts::{DEFAULT_FLUSH_SIGNAL_CHANNEL_SIZE, FLUSH_RETRY_BACKOFF, FLUSH_SIGNAL, KB};
use crate::dirty::DirtyMemoryManager;
use crate::err::Error;
use crate::flush::FlushQueue;
use crate::memtable::{MemtableList, Memtable, SealFn};
use crate::mutation::{Mutation, Partition};
use crate::partitioner::{decorate, DecoratedKey, PartitionRange};
use crate::reader::{
    CacheReader, CombinedReader, EmptyReader, MemtableReader, MutationReader, MutationReaderBox,
    ReadGate, RestrictedReader, SstableReader,
};
use crate::schema::SchemaHandle;
use crate::sstable::{
    filter_sstables_for_reader, populate, QuerySlice, Sstable, SstableSet,
};
use crate::types::{FlushSignal, Generation, PresenceChecker, SstableSetHandle};
use futures::FutureExt;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

impl std::fmt::Debug for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamily")
            .field("schema", &self.schema)
            .field("datadir", &self.datadir)
            .finish()
    }
}

pub struct ColumnFamily {
    /// Immutable descriptor; a schema change installs a new column family
    pub schema: SchemaHandle,

    pub(crate) config: Arc<Config>,

    /// Directory holding this column family's sstables
    pub(crate) datadir: PathBuf,

    pub(crate) dirty: Arc<DirtyMemoryManager>,
    pub(crate) streaming_dirty: Arc<DirtyMemoryManager>,

    /// Regular write path memtables
    pub(crate) memtables: Arc<MemtableList>,

    /// Streaming-ingest memtables, flushed without cache updates
    pub(crate) streaming_memtables: Arc<MemtableList>,

    /// Per-plan memtable lists for oversized fragmented partitions
    pub(crate) streaming_big: AsyncMutex<IndexMap<Uuid, Arc<StreamingMemtableBig>>>,

    /// Live sstables, published copy-on-write
    pub(crate) sstables: RwLock<SstableSetHandle>,

    /// Compacted sstables still visible to ongoing reads, awaiting their
    /// cross-shard deletion votes
    pub(crate) compacted_but_not_deleted: Mutex<Vec<Arc<Sstable>>>,

    pub(crate) cache: Arc<RowCache>,

    /// Orders post-flush commit-log discards by replay position
    pub(crate) flush_queue: FlushQueue,

    pub(crate) commitlog: Option<Arc<dyn CommitLog>>,

    pub(crate) highest_flushed_rp: Mutex<ReplayPosition>,

    /// Serializes rotate-plus-high-water so concurrent seals cannot publish
    /// replay positions out of order
    seal_serializer: Mutex<()>,

    next_generation: AtomicU64,

    pub(crate) strategy: Arc<dyn CompactionStrategy>,
    pub(crate) compaction_disabled: AtomicBool,
    /// One compaction at a time per column family
    pub(crate) compaction_serializer: AsyncMutex<()>,
    pub(crate) deletion: Arc<AtomicDeletionManager>,

    read_gate: Option<ReadGate>,

    /// Sends a signal to subscribers whenever a flush happens
    pub(crate) flush_signal_tx: async_broadcast::Sender<FlushSignal>,
    flush_signal_rx: async_broadcast::InactiveReceiver<FlushSignal>,

    write_count: AtomicU64,
    write_latency_micros: AtomicU64,

    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ColumnFamily {
    pub fn new(
        schema: SchemaHandle,
        config: Arc<Config>,
        datadir: PathBuf,
        dirty: Arc<DirtyMemoryManager>,
        streaming_dirty: Arc<DirtyMemoryManager>,
        commitlog: Option<Arc<dyn CommitLog>>,
        deletion: Arc<AtomicDeletionManager>,
    ) -> Arc<Self> {
        let (mut tx, rx) = async_broadcast::broadcast(DEFAULT_FLUSH_SIGNAL_CHANNEL_SIZE);
        tx.set_overflow(true);
        let strategy = strategy_for(schema.compaction_strategy);
        let read_gate = (config.max_concurrent_reads > 0).then(|| {
            ReadGate::new(
                config.max_concurrent_reads,
                config.max_read_queue_length,
                Duration::from_millis(config.read_request_timeout_in_ms),
            )
        });

        Arc::new_cyclic(|weak: &Weak<ColumnFamily>| {
            let seal_regular: SealFn = {
                let weak = weak.clone();
                Arc::new(move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(cf) => cf.seal_active_memtable().await,
                            None => Ok(()),
                        }
                    }
                    .boxed()
                })
            };
            let seal_streaming: SealFn = {
                let weak = weak.clone();
                Arc::new(move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(cf) => cf.seal_active_streaming_memtable_immediate().await,
                            None => Ok(()),
                        }
                    }
                    .boxed()
                })
            };

            ColumnFamily {
                memtables: MemtableList::new(
                    Arc::clone(&dirty),
                    seal_regular,
                    config.write_buffer_size,
                ),
                streaming_memtables: MemtableList::new(
                    Arc::clone(&streaming_dirty),
                    seal_streaming,
                    config.write_buffer_size,
                ),
                streaming_big: AsyncMutex::new(IndexMap::new()),
                sstables: RwLock::new(Arc::new(SstableSet::new())),
                compacted_but_not_deleted: Mutex::new(Vec::new()),
                cache: Arc::new(RowCache::new(
                    config.max_cached_partition_size_in_kb * KB,
                    config.enable_cache,
                )),
                flush_queue: FlushQueue::new(),
                commitlog,
                highest_flushed_rp: Mutex::new(ReplayPosition::ZERO),
                seal_serializer: Mutex::new(()),
                next_generation: AtomicU64::new(1),
                strategy,
                compaction_disabled: AtomicBool::new(false),
                compaction_serializer: AsyncMutex::new(()),
                deletion,
                read_gate,
                flush_signal_tx: tx,
                flush_signal_rx: rx.deactivate(),
                write_count: AtomicU64::new(0),
                write_latency_micros: AtomicU64::new(0),
                background: Mutex::new(Vec::new()),
                schema,
                config,
                datadir,
                dirty,
                streaming_dirty,
            }
        })
    }

    /// Probes the data directory, adopts the on-disk sstables, and registers
    /// the memtable lists with their dirty-memory managers.
    pub async fn init(self: &Arc<Self>) -> Result<(), Error> {
        let outcome = populate(
            &self.datadir,
            &self.schema.keyspace,
            &self.schema.name,
            self.config.shard_id,
            self.config.shard_count,
        )
        .await?;
        self.next_generation
            .store(outcome.max_generation + 1, Ordering::Release);
        *self.sstables.write().await = Arc::new(SstableSet::from_vec(outcome.sstables));
        self.dirty.register(&self.memtables);
        self.streaming_dirty.register(&self.streaming_memtables);
        Ok(())
    }

    pub fn decorate<K: AsRef<[u8]>>(&self, key: K) -> DecoratedKey {
        decorate(key)
    }

    pub(crate) fn allocate_generation(&self) -> Generation {
        self.next_generation.fetch_add(1, Ordering::AcqRel)
    }

    /// A point-in-time handle on the live sstable set. The returned set never
    /// changes, even under concurrent flushes and compactions.
    pub async fn sstable_set(&self) -> SstableSetHandle {
        Arc::clone(&*self.sstables.read().await)
    }

    pub fn cache(&self) -> &Arc<RowCache> {
        &self.cache
    }

    pub fn highest_flushed_replay_position(&self) -> ReplayPosition {
        *self
            .highest_flushed_rp
            .lock()
            .expect("highest flushed rp poisoned")
    }

    // ---------------------------------------------------------------- write

    /// Applies a mutation at a replay position. A position below the flush
    /// high-water mark is a fatal ordering error for this write; the database
    /// layer retries once by re-appending to the commit log.
    pub async fn apply(
        &self,
        schema: &SchemaHandle,
        m: &Mutation,
        rp: ReplayPosition,
    ) -> Result<(), Error> {
        if schema.id != self.schema.id {
            return Err(Error::SchemaNotSynced {
                expected: self.schema.id,
                got: schema.id,
            });
        }
        if !rp.is_zero() {
            let highest = self.highest_flushed_replay_position();
            if rp < highest {
                return Err(Error::ReplayPositionReordering {
                    applied: rp,
                    highest_flushed: highest,
                });
            }
        }
        let started = Instant::now();
        self.memtables.apply(m, rp).await;
        self.record_write_latency(started.elapsed());

        if self.memtables.should_flush() {
            let list = Arc::clone(&self.memtables);
            tokio::spawn(async move {
                if let Err(err) = list.request_flush().await {
                    log::error!("write-buffer flush request failed: {err}");
                }
            });
        }
        Ok(())
    }

    fn record_write_latency(&self, elapsed: Duration) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Mean apply latency in microseconds.
    pub fn average_write_latency_micros(&self) -> u64 {
        let count = self.write_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.write_latency_micros.load(Ordering::Relaxed) / count
    }

    // ---------------------------------------------------------------- flush

    /// Explicit flush of the regular and streaming memtable lists.
    pub async fn flush(self: &Arc<Self>) -> Result<(), Error> {
        self.memtables.request_flush().await?;
        self.streaming_memtables.request_flush().await?;
        Ok(())
    }

    /// Seals the active memtable and drives it through the flush pipeline:
    /// rotate, enqueue by replay position, write the sstable, publish it
    /// copy-on-write, update the cache, release the dirty-memory charge, and
    /// let the queue discard commit-log segments in order.
    pub async fn seal_active_memtable(self: &Arc<Self>) -> Result<(), Error> {
        if self.config.enable_in_memory_data_store {
            return Ok(());
        }
        self.flush_queue.check_open_gate()?;
        let (old, rp) = {
            let _seal = self.seal_serializer.lock().expect("seal serializer poisoned");
            let Some(old) = self.memtables.seal_and_rotate() else {
                // Nothing to do for an empty active memtable.
                return Ok(());
            };
            let rp = old.replay_position();
            let mut highest = self
                .highest_flushed_rp
                .lock()
                .expect("highest flushed rp poisoned");
            if !rp.is_zero() {
                debug_assert!(
                    rp >= *highest,
                    "sealed memtable replay position regressed"
                );
                if rp < *highest {
                    return Err(Error::ReplayPositionReordering {
                        applied: rp,
                        highest_flushed: *highest,
                    });
                }
                *highest = rp;
            }
            (old, rp)
        };

        let cf = Arc::clone(self);
        let worked = Arc::clone(&old);
        let commitlog = self.commitlog.clone();
        let cf_id = self.schema.id;
        self.flush_queue
            .run_cf_flush(
                rp,
                async move { cf.flush_memtable_to_sstable(worked).await },
                move |position| async move {
                    if let Some(log) = commitlog {
                        log.discard_completed_segments(cf_id, position).await;
                    }
                },
            )
            .await
    }

    /// Writes a sealed memtable to a new sstable. A write failure is logged
    /// and retried forever with backoff: the data is still in the memtable,
    /// so giving up would lose it. Cache update failures are not fatal
    /// either way, the sstable is already durable.
    async fn flush_memtable_to_sstable(
        self: Arc<Self>,
        old: Arc<Memtable>,
    ) -> Result<(), Error> {
        let entries = old.entries_for_flush();
        let sstable = loop {
            let generation = self.allocate_generation();
            match Sstable::write(
                &self.datadir,
                &self.schema.keyspace,
                &self.schema.name,
                &self.config.sstable_version,
                generation,
                0,
                self.config.shard_count,
                self.config.false_positive_rate,
                entries.clone(),
            )
            .await
            {
                Ok(sst) => break Arc::new(sst),
                Err(err) => {
                    log::error!(
                        "failed to write sstable for {}.{}, retrying in {:?}: {}",
                        self.schema.keyspace,
                        self.schema.name,
                        FLUSH_RETRY_BACKOFF,
                        Error::FlushToDiskError {
                            error: Box::new(err)
                        }
                    );
                    tokio::time::sleep(FLUSH_RETRY_BACKOFF).await;
                }
            }
        };
        if self.config.incremental_backups {
            self.link_to_backups(&sstable).await;
        }

        // Publish before updating the cache, so any read that observes the
        // cache entry also observes the sstable in the set.
        let checker = {
            let mut guard = self.sstables.write().await;
            let previous = Arc::clone(&*guard);
            let mut next = (*previous).clone();
            next.insert(Arc::clone(&sstable));
            *guard = Arc::new(next);
            self.presence_checker_excluding(previous, sstable.generation)
        };
        self.cache.update(&old, checker);

        self.memtables.erase(&old);
        old.release_memory();
        let _ = self.flush_signal_tx.try_broadcast(FLUSH_SIGNAL);
        Ok(())
    }

    /// Builds the partition-presence checker for a cache update: keys are
    /// checked against every sstable of the pre-flush set except the one
    /// that was just flushed.
    fn presence_checker_excluding(
        &self,
        set: SstableSetHandle,
        excluded_generation: Generation,
    ) -> PresenceChecker {
        Box::new(move |key: &DecoratedKey| {
            set.iter()
                .filter(|sst| sst.generation != excluded_generation)
                .any(|sst| sst.may_contain(key))
        })
    }

    pub(crate) async fn link_to_backups(&self, sstable: &Arc<Sstable>) {
        let backups = self.datadir.join("backups");
        if let Err(err) = tokio::fs::create_dir_all(&backups).await {
            log::warn!("cannot create backups directory: {err}");
            return;
        }
        for path in sstable.component_paths() {
            let Some(name) = path.file_name() else { continue };
            if let Err(err) = tokio::fs::hard_link(&path, backups.join(name)).await {
                if err.kind() != std::io::ErrorKind::AlreadyExists {
                    log::warn!("incremental backup link failed for {path:?}: {err}");
                }
            }
        }
    }

    // ----------------------------------------------------------------- read

    /// Builds the merged reader over every memtable plus the cache or the
    /// sstable set. Singular reads for tokens owned by another shard return
    /// an empty reader.
    pub async fn make_reader(
        &self,
        range: PartitionRange,
        slice: QuerySlice,
    ) -> Result<MutationReaderBox, Error> {
        if let Some(key) = range.singular_key() {
            if key.shard(self.config.shard_count) != self.config.shard_id {
                return Ok(Box::new(EmptyReader));
            }
        }
        let permit = match &self.read_gate {
            Some(gate) => Some(gate.admit().await?),
            None => None,
        };
        let cf_id = self.schema.id;

        let mut readers: Vec<MutationReaderBox> = Vec::new();
        for memtable in self.memtables.all() {
            readers.push(Box::new(MemtableReader::new(cf_id, memtable.snapshot(&range))));
        }
        for memtable in self.streaming_memtables.all() {
            readers.push(Box::new(MemtableReader::new(cf_id, memtable.snapshot(&range))));
        }
        for big in self.streaming_big.lock().await.values() {
            for memtable in big.memtables.all() {
                readers.push(Box::new(MemtableReader::new(cf_id, memtable.snapshot(&range))));
            }
        }

        let set = self.sstable_set().await;
        let candidates = set.select(&range);
        let selected = match range.singular_key() {
            Some(key) => filter_sstables_for_reader(candidates, key, &slice),
            None => candidates,
        };
        let sstable_readers: Vec<MutationReaderBox> = selected
            .into_iter()
            .map(|sst| {
                Box::new(SstableReader::new(
                    cf_id,
                    sst,
                    range.clone(),
                    Some(self.config.shard_id),
                )) as MutationReaderBox
            })
            .collect();
        let disk_side: MutationReaderBox = Box::new(CombinedReader::new(sstable_readers));
        let disk_side: MutationReaderBox = if self.cache.is_enabled() {
            Box::new(CacheReader::new(
                Arc::clone(&self.cache),
                cf_id,
                range.clone(),
                disk_side,
            ))
        } else {
            disk_side
        };
        readers.push(disk_side);

        let combined: MutationReaderBox = Box::new(CombinedReader::new(readers));
        Ok(match permit {
            Some(permit) => Box::new(RestrictedReader::new(permit, combined)),
            None => combined,
        })
    }

    /// Single-partition read: the merged partition across memtables, cache,
    /// and sstables, or `None` when nothing is stored.
    pub async fn read_partition(
        &self,
        key: &DecoratedKey,
    ) -> Result<Option<Partition>, Error> {
        let mut reader = self
            .make_reader(PartitionRange::singular(key.clone()), QuerySlice::full())
            .await?;
        Ok(reader.next().await?.map(|m| m.partition))
    }

    // ----------------------------------------------------------- background

    /// Starts the periodic compaction evaluator; it also wakes on every
    /// flush signal and retries parked sstable deletions.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let cf = Arc::clone(self);
        let mut signal = self.flush_signal_rx.activate_cloned();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(cf.config.compaction_interval_millis));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    received = signal.recv() => {
                        match received {
                            Ok(_) | Err(async_broadcast::RecvError::Overflowed(_)) => {}
                            Err(async_broadcast::RecvError::Closed) => return,
                        }
                    }
                }
                cf.retry_parked_deletions().await;
                if let Err(err) = cf.maybe_compact().await {
                    log::error!(
                        "background compaction of {}.{} failed: {err}",
                        cf.schema.keyspace,
                        cf.schema.name
                    );
                }
            }
        });
        self.background
            .lock()
            .expect("background handles poisoned")
            .push(handle);
    }

    /// Stops background work and drains the flush queue.
    pub async fn close(&self) {
        for handle in self
            .background
            .lock()
            .expect("background handles poisoned")
            .drain(..)
        {
            handle.abort();
        }
        self.flush_queue.close().await;
    }
}
