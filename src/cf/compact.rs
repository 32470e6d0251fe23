//! Compaction orchestration for a column family: running the strategy's
//! descriptors, rebuilding the sstable list copy-on-write, parking removed
//! sstables until their cross-shard deletion confirms, and cleanup rewrites
//! that restrict sstables to the node's owned token ranges.

use crate::cf::ColumnFamily;
use crate::compaction::CompactionDescriptor;
use crate::err::Error;
use crate::mutation::{now_seconds, Partition};
use crate::partitioner::{DecoratedKey, PartitionRange, Token};
use crate::reader::{CombinedReader, MutationReader, SstableReader};
use crate::sstable::Sstable;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl ColumnFamily {
    pub fn disable_compaction(&self) {
        self.compaction_disabled.store(true, Ordering::Release);
    }

    pub fn enable_compaction(&self) {
        self.compaction_disabled.store(false, Ordering::Release);
    }

    pub fn is_compaction_disabled(&self) -> bool {
        self.compaction_disabled.load(Ordering::Acquire)
    }

    /// Sstables removed by compaction but still awaiting deletion votes.
    pub fn compacted_but_not_deleted(&self) -> Vec<Arc<Sstable>> {
        self.compacted_but_not_deleted
            .lock()
            .expect("compacted list poisoned")
            .clone()
    }

    /// Evaluates the strategy once and runs the selected merge, if any.
    pub async fn maybe_compact(self: &Arc<Self>) -> Result<(), Error> {
        if self.is_compaction_disabled() {
            return Ok(());
        }
        let _one_at_a_time = self.compaction_serializer.lock().await;
        let set = self.sstable_set().await;
        let Some(descriptor) = self.strategy.select(&set) else {
            return Ok(());
        };
        log::info!(
            "compacting {} sstables of {}.{} to level {}",
            descriptor.inputs.len(),
            self.schema.keyspace,
            self.schema.name,
            descriptor.output_level
        );
        self.run_compaction(descriptor).await
    }

    /// Merges the descriptor's inputs into one sstable at the requested
    /// level, reconciling partitions cell-wise and purging tombstones that
    /// are past the grace period and provably unshadowable elsewhere.
    pub async fn compact_sstables(
        self: &Arc<Self>,
        descriptor: CompactionDescriptor,
    ) -> Result<(), Error> {
        let _one_at_a_time = self.compaction_serializer.lock().await;
        self.run_compaction(descriptor).await
    }

    async fn run_compaction(self: &Arc<Self>, descriptor: CompactionDescriptor) -> Result<(), Error> {
        if descriptor.inputs.is_empty() {
            return Ok(());
        }
        let merged = self.merge_inputs(&descriptor.inputs, None).await?;
        self.finish_compaction(descriptor, merged).await
    }

    /// Compaction variant that additionally restricts every partition to the
    /// node's owned token ranges; sstables already fully contained in them
    /// are skipped.
    pub async fn cleanup_sstables(
        self: &Arc<Self>,
        owned_ranges: &[(Token, Token)],
    ) -> Result<(), Error> {
        let _one_at_a_time = self.compaction_serializer.lock().await;
        let set = self.sstable_set().await;
        let inputs: Vec<Arc<Sstable>> = set
            .iter()
            .filter(|sst| {
                let summary = sst.summary();
                let fully_owned = owned_ranges.iter().any(|(start, end)| {
                    summary.first_key.token >= *start && summary.last_key.token <= *end
                });
                !fully_owned
            })
            .cloned()
            .collect();
        if inputs.is_empty() {
            return Ok(());
        }
        let merged = self.merge_inputs(&inputs, Some(owned_ranges)).await?;
        let output_level = inputs.iter().map(|t| t.level()).max().unwrap_or(0);
        self.finish_compaction(
            CompactionDescriptor {
                inputs,
                output_level,
            },
            merged,
        )
        .await
    }

    async fn merge_inputs(
        self: &Arc<Self>,
        inputs: &[Arc<Sstable>],
        owned_ranges: Option<&[(Token, Token)]>,
    ) -> Result<Vec<(DecoratedKey, Partition)>, Error> {
        let readers = inputs
            .iter()
            .map(|sst| {
                Box::new(SstableReader::new(
                    self.schema.id,
                    Arc::clone(sst),
                    PartitionRange::full(),
                    None,
                )) as Box<dyn MutationReader>
            })
            .collect();
        let mut combined = CombinedReader::new(readers);

        // Tombstones may only be purged when no sstable outside the inputs
        // can still hold shadowed data for the key. Sstables parked in the
        // compacted-but-not-deleted list count as protection sources too.
        let input_generations: Vec<u64> = inputs.iter().map(|t| t.generation).collect();
        let set = self.sstable_set().await;
        let mut protection: Vec<Arc<Sstable>> = set
            .iter()
            .filter(|sst| !input_generations.contains(&sst.generation))
            .cloned()
            .collect();
        protection.extend(self.compacted_but_not_deleted());

        let now = now_seconds();
        let gc_before = now.saturating_sub(self.schema.gc_grace_seconds);
        let mut merged: BTreeMap<DecoratedKey, Partition> = BTreeMap::new();
        while let Some(m) = combined.next().await? {
            if let Some(ranges) = owned_ranges {
                let owned = ranges
                    .iter()
                    .any(|(start, end)| m.key.token >= *start && m.key.token <= *end);
                if !owned {
                    continue;
                }
            }
            let mut partition = m.partition;
            let purgeable = !protection.iter().any(|sst| sst.may_contain(&m.key));
            partition.compact(now, purgeable.then_some(gc_before));
            if !partition.is_empty() {
                merged.insert(m.key, partition);
            }
        }
        Ok(merged.into_iter().collect())
    }

    async fn finish_compaction(
        self: &Arc<Self>,
        descriptor: CompactionDescriptor,
        merged: Vec<(DecoratedKey, Partition)>,
    ) -> Result<(), Error> {
        let mut outputs = Vec::new();
        if !merged.is_empty() {
            let generation = self.allocate_generation();
            let sstable = Sstable::write(
                &self.datadir,
                &self.schema.keyspace,
                &self.schema.name,
                &self.config.sstable_version,
                generation,
                descriptor.output_level,
                self.config.shard_count,
                self.config.false_positive_rate,
                merged,
            )
            .await
            .map_err(|err| Error::CompactionFailed(err.to_string()))?;
            outputs.push(Arc::new(sstable));
        }
        self.rebuild_sstable_list(outputs, descriptor.inputs).await;
        Ok(())
    }

    /// Publishes `(old ∪ new) \ removed` copy-on-write. Removed sstables are
    /// parked so ongoing reads finish against them, then deleted once every
    /// shard votes; a cancelled vote is not an error, the files stay parked
    /// as tombstone-protection sources until a later retry.
    pub async fn rebuild_sstable_list(
        self: &Arc<Self>,
        new_sstables: Vec<Arc<Sstable>>,
        removed: Vec<Arc<Sstable>>,
    ) {
        {
            let mut guard = self.sstables.write().await;
            let mut next = (**guard).clone();
            for sstable in &new_sstables {
                next.insert(Arc::clone(sstable));
            }
            for sstable in &removed {
                next.erase(sstable);
            }
            self.compacted_but_not_deleted
                .lock()
                .expect("compacted list poisoned")
                .extend(removed.iter().cloned());
            *guard = Arc::new(next);
        }

        match self.deletion.vote(self.config.shard_id, &removed).await {
            Ok(confirmed) => self.purge_parked(&confirmed),
            Err(Error::DeletionCancelled) => {
                log::debug!(
                    "atomic deletion cancelled for {}.{}; keeping {} sstables parked",
                    self.schema.keyspace,
                    self.schema.name,
                    removed.len()
                );
            }
            Err(err) => log::error!("sstable deletion failed: {err}"),
        }
    }

    fn purge_parked(&self, confirmed: &[Arc<Sstable>]) {
        if confirmed.is_empty() {
            return;
        }
        let generations: Vec<u64> = confirmed.iter().map(|t| t.generation).collect();
        self.compacted_but_not_deleted
            .lock()
            .expect("compacted list poisoned")
            .retain(|sst| !generations.contains(&sst.generation));
    }

    /// Re-votes for every parked sstable; runs on each background tick so a
    /// cancelled deletion eventually completes.
    pub(crate) async fn retry_parked_deletions(self: &Arc<Self>) {
        let parked = self.compacted_but_not_deleted();
        if parked.is_empty() {
            return;
        }
        match self.deletion.vote(self.config.shard_id, &parked).await {
            Ok(confirmed) => self.purge_parked(&confirmed),
            Err(Error::DeletionCancelled) => {
                log::debug!("atomic deletion retry cancelled; will try again");
            }
            Err(err) => log::error!("sstable deletion retry failed: {err}"),
        }
    }
}
