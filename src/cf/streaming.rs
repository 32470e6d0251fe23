//! Streaming-ingest sub-pipeline, parallel to the normal write path. Repair
//! and bootstrap deliver frozen mutations: ordinary ones batch in the
//! streaming memtable list behind a short coalescing timer, while fragments
//! of oversized partitions get a per-plan "big" list that emits one sstable
//! per seal so the whole partition never has to fit in memory at once.
//! Streaming flushes never update the row cache; they invalidate the ranges
//! they touched instead.

use crate::cf::ColumnFamily;
use crate::commitlog::ReplayPosition;
use crate::consts::FLUSH_RETRY_BACKOFF;
use crate::err::Error;
use crate::memtable::{FlushBehavior, Memtable, MemtableList, SealFn};
use crate::mutation::FrozenMutation;
use crate::partitioner::PartitionRange;
use crate::schema::SchemaHandle;
use crate::sstable::Sstable;
use futures::FutureExt;
use std::ops::Bound;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Per-plan memtable list for fragments of an oversized partition, plus the
/// sstables its seals have produced so far. The tables are only published
/// into the live set when the plan completes.
pub struct StreamingMemtableBig {
    pub(crate) memtables: Arc<MemtableList>,
    pub(crate) sstables: Mutex<Vec<Arc<Sstable>>>,
}

impl ColumnFamily {
    /// Writes a streamed mutation. `fragmented` marks one fragment of an
    /// oversized partition; those route to the plan's big list.
    pub async fn apply_streaming_mutation(
        self: &Arc<Self>,
        schema: &SchemaHandle,
        plan_id: Uuid,
        frozen: &FrozenMutation,
        fragmented: bool,
    ) -> Result<(), Error> {
        if schema.id != self.schema.id {
            return Err(Error::SchemaNotSynced {
                expected: self.schema.id,
                got: schema.id,
            });
        }
        let m = frozen.unfreeze()?;
        if fragmented {
            let big = self.big_list_for_plan(plan_id).await;
            big.memtables.apply(&m, ReplayPosition::ZERO).await;
            if big.memtables.should_flush() {
                // Each seal of a big list emits one sstable.
                big.memtables.seal_active(FlushBehavior::Immediate).await?;
            }
        } else {
            self.streaming_memtables.apply(&m, ReplayPosition::ZERO).await;
            if self.streaming_memtables.should_flush() {
                self.seal_active_streaming_memtable_delayed().await?;
            }
        }
        Ok(())
    }

    /// Arms the coalescing timer on the streaming list; many small incoming
    /// mutations batch into one seal.
    pub async fn seal_active_streaming_memtable_delayed(self: &Arc<Self>) -> Result<(), Error> {
        self.streaming_memtables
            .seal_active(FlushBehavior::Delayed)
            .await
    }

    /// Seals the active streaming memtable now. The sealed memtable writes
    /// one sstable, joins the live set, and triggers compaction; the cache
    /// is not updated, the touched range is invalidated instead.
    pub async fn seal_active_streaming_memtable_immediate(
        self: &Arc<Self>,
    ) -> Result<(), Error> {
        if self.config.enable_in_memory_data_store {
            return Ok(());
        }
        self.flush_queue.check_open_gate()?;
        let Some(old) = self.streaming_memtables.seal_and_rotate() else {
            return Ok(());
        };
        let cf = Arc::clone(self);
        let worked = Arc::clone(&old);
        // Streaming flushes have no commit-log position; the queue adopts
        // the highest queued key purely for ordering.
        self.flush_queue
            .run_cf_flush(
                ReplayPosition::ZERO,
                async move { cf.flush_streaming_memtable(worked).await },
                |_| async {},
            )
            .await
    }

    async fn flush_streaming_memtable(self: Arc<Self>, old: Arc<Memtable>) -> Result<(), Error> {
        let touched = range_of(&old);
        let sstable = self.write_streaming_sstable(&old).await;

        {
            let mut guard = self.sstables.write().await;
            let mut next = (**guard).clone();
            next.insert(Arc::clone(&sstable));
            *guard = Arc::new(next);
        }
        // No cache update from streaming: the cached entries may predate the
        // streamed data, so the range is dropped and reads re-populate.
        if let Some(range) = touched {
            self.cache.invalidate(&range);
        }
        self.streaming_memtables.erase(&old);
        old.release_memory();
        let _ = self.flush_signal_tx.try_broadcast(crate::consts::FLUSH_SIGNAL);
        Ok(())
    }

    async fn write_streaming_sstable(&self, old: &Arc<Memtable>) -> Arc<Sstable> {
        let entries = old.entries_for_flush();
        loop {
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
                Ok(sst) => return Arc::new(sst),
                Err(err) => {
                    log::error!(
                        "failed to write streaming sstable for {}.{}, retrying in {:?}: {err}",
                        self.schema.keyspace,
                        self.schema.name,
                        FLUSH_RETRY_BACKOFF
                    );
                    tokio::time::sleep(FLUSH_RETRY_BACKOFF).await;
                }
            }
        }
    }

    async fn big_list_for_plan(self: &Arc<Self>, plan_id: Uuid) -> Arc<StreamingMemtableBig> {
        let mut plans = self.streaming_big.lock().await;
        if let Some(existing) = plans.get(&plan_id) {
            return Arc::clone(existing);
        }
        let big = Arc::new_cyclic(|weak_big: &Weak<StreamingMemtableBig>| {
            let seal: SealFn = {
                let weak_cf = Arc::downgrade(self);
                let weak_big = weak_big.clone();
                Arc::new(move || {
                    let weak_cf = weak_cf.clone();
                    let weak_big = weak_big.clone();
                    async move {
                        match (weak_cf.upgrade(), weak_big.upgrade()) {
                            (Some(cf), Some(big)) => {
                                cf.seal_active_streaming_memtable_big(big).await
                            }
                            _ => Ok(()),
                        }
                    }
                    .boxed()
                })
            };
            StreamingMemtableBig {
                memtables: MemtableList::new(
                    Arc::clone(&self.streaming_dirty),
                    seal,
                    self.config.write_buffer_size,
                ),
                sstables: Mutex::new(Vec::new()),
            }
        });
        plans.insert(plan_id, Arc::clone(&big));
        big
    }

    /// One seal of a big list writes one sstable; it is only published when
    /// the plan completes.
    async fn seal_active_streaming_memtable_big(
        self: &Arc<Self>,
        big: Arc<StreamingMemtableBig>,
    ) -> Result<(), Error> {
        if self.config.enable_in_memory_data_store {
            return Ok(());
        }
        let Some(old) = big.memtables.seal_and_rotate() else {
            return Ok(());
        };
        let sstable = self.write_streaming_sstable(&old).await;
        big.sstables
            .lock()
            .expect("big streaming sstables poisoned")
            .push(sstable);
        big.memtables.erase(&old);
        old.release_memory();
        Ok(())
    }

    /// Flushes the plan's remaining fragments and publishes every sstable it
    /// produced in one copy-on-write swap.
    pub async fn complete_streaming_plan(self: &Arc<Self>, plan_id: Uuid) -> Result<(), Error> {
        let big = self
            .streaming_big
            .lock()
            .await
            .shift_remove(&plan_id)
            .ok_or(Error::StreamingPlanNotFound { plan_id })?;
        big.memtables.seal_active(FlushBehavior::Immediate).await?;
        let tables: Vec<Arc<Sstable>> = big
            .sstables
            .lock()
            .expect("big streaming sstables poisoned")
            .drain(..)
            .collect();
        if tables.is_empty() {
            return Ok(());
        }
        {
            let mut guard = self.sstables.write().await;
            let mut next = (**guard).clone();
            for sstable in &tables {
                next.insert(Arc::clone(sstable));
            }
            *guard = Arc::new(next);
        }
        for sstable in &tables {
            let summary = sstable.summary();
            self.cache.invalidate(&PartitionRange {
                start: Bound::Included(summary.first_key.clone()),
                end: Bound::Included(summary.last_key.clone()),
            });
        }
        let _ = self.flush_signal_tx.try_broadcast(crate::consts::FLUSH_SIGNAL);
        Ok(())
    }

    /// Abandons a plan: every sstable it produced is marked for deletion and
    /// its files are removed; nothing was ever published.
    pub async fn fail_streaming_mutations(self: &Arc<Self>, plan_id: Uuid) -> Result<(), Error> {
        let big = self
            .streaming_big
            .lock()
            .await
            .shift_remove(&plan_id)
            .ok_or(Error::StreamingPlanNotFound { plan_id })?;
        let tables: Vec<Arc<Sstable>> = big
            .sstables
            .lock()
            .expect("big streaming sstables poisoned")
            .drain(..)
            .collect();
        for sstable in tables {
            sstable.mark_for_deletion();
            if let Err(err) = sstable.delete_files().await {
                log::error!("failed to remove abandoned streaming sstable: {err}");
            }
        }
        Ok(())
    }
}

fn range_of(memtable: &Memtable) -> Option<PartitionRange> {
    let first = memtable.first_key()?;
    let last = memtable.last_key()?;
    Some(PartitionRange {
        start: Bound::Included(first),
        end: Bound::Included(last),
    })
}
