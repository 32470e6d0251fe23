//! # Atomic sstable deletion
//!
//! A compacted sstable may be shared by several shards; its files may only
//! disappear once every shard has stopped reading it. Each shard votes for
//! deletion; the files are removed when the last vote lands. Until then the
//! sstable stays in each shard's compacted-but-not-deleted list, where it
//! still serves as a tombstone-protection source for ongoing compactions.

use crate::err::Error;
use crate::sstable::Sstable;
use crate::types::ShardId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct AtomicDeletionManager {
    shard_count: usize,
    votes: Mutex<HashMap<String, HashSet<ShardId>>>,
    /// Test hook: fail the next round of votes with a cancellation.
    cancel_next: AtomicBool,
}

impl AtomicDeletionManager {
    pub fn new(shard_count: usize) -> Arc<Self> {
        Arc::new(Self {
            shard_count: shard_count.max(1),
            votes: Mutex::new(HashMap::new()),
            cancel_next: AtomicBool::new(false),
        })
    }

    fn key_of(sstable: &Sstable) -> String {
        format!(
            "{}/{}/{}",
            sstable.keyspace, sstable.cf_name, sstable.generation
        )
    }

    /// Makes the next `vote` call report a cancellation.
    pub fn cancel_next_deletion(&self) {
        self.cancel_next.store(true, Ordering::Release);
    }

    /// Records this shard's vote for deleting the given sstables. Files of
    /// any sstable that has now collected every shard's vote are removed;
    /// those sstables are returned so the caller can purge its parked list.
    pub async fn vote(
        &self,
        shard_id: ShardId,
        sstables: &[Arc<Sstable>],
    ) -> Result<Vec<Arc<Sstable>>, Error> {
        if self.cancel_next.swap(false, Ordering::AcqRel) {
            return Err(Error::DeletionCancelled);
        }
        let mut confirmed = Vec::new();
        for sstable in sstables {
            let all_voted = {
                let mut votes = self.votes.lock().expect("deletion votes poisoned");
                let entry = votes.entry(Self::key_of(sstable)).or_default();
                entry.insert(shard_id);
                entry.len() >= self.shard_count
            };
            if all_voted {
                confirmed.push(Arc::clone(sstable));
            }
        }
        for sstable in &confirmed {
            sstable.mark_for_deletion();
            sstable.delete_files().await?;
            self.votes
                .lock()
                .expect("deletion votes poisoned")
                .remove(&Self::key_of(sstable));
        }
        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{Mutation, Partition};
    use crate::partitioner::{decorate, DecoratedKey};
    use crate::sstable::Component;
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn sstable(dir: &std::path::Path, generation: u64) -> Arc<Sstable> {
        let mut m = Mutation::new(Uuid::new_v4(), decorate(b"k"));
        m.set_cell(&[], "v", b"x".to_vec(), 1);
        let entries: Vec<(DecoratedKey, Partition)> = vec![(m.key.clone(), m.partition)];
        Arc::new(
            Sstable::write(dir, "apps", "events", "la", generation, 0, 2, 0.01, entries)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn files_survive_until_every_shard_votes() {
        let root = tempdir().unwrap();
        let sst = sstable(root.path(), 1).await;
        let manager = AtomicDeletionManager::new(2);

        let confirmed = manager.vote(0, &[Arc::clone(&sst)]).await.unwrap();
        assert!(confirmed.is_empty());
        assert!(sst.component_path(Component::Data).exists());

        let confirmed = manager.vote(1, &[Arc::clone(&sst)]).await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert!(!sst.component_path(Component::Data).exists());
        assert!(sst.is_marked_for_deletion());
    }

    #[tokio::test]
    async fn duplicate_votes_do_not_count_twice() {
        let root = tempdir().unwrap();
        let sst = sstable(root.path(), 1).await;
        let manager = AtomicDeletionManager::new(2);
        for _ in 0..3 {
            let confirmed = manager.vote(0, &[Arc::clone(&sst)]).await.unwrap();
            assert!(confirmed.is_empty());
        }
        assert!(sst.component_path(Component::Data).exists());
    }

    #[tokio::test]
    async fn cancellation_surfaces_and_leaves_files() {
        let root = tempdir().unwrap();
        let sst = sstable(root.path(), 1).await;
        let manager = AtomicDeletionManager::new(1);
        manager.cancel_next_deletion();
        let err = manager.vote(0, &[Arc::clone(&sst)]).await.unwrap_err();
        assert!(matches!(err, Error::DeletionCancelled));
        assert!(sst.component_path(Component::Data).exists());

        // A later retry succeeds.
        let confirmed = manager.vote(0, &[Arc::clone(&sst)]).await.unwrap();
        assert_eq!(confirmed.len(), 1);
    }
}
