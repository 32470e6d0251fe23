//! Column family maintenance: snapshots (hard-link farms plus a sharded
//! manifest), adopting out-of-band sstables from the upload directory, and
//! truncation.

use crate::cf::ColumnFamily;
use crate::consts::{
    SNAPSHOTS_DIRECTORY_NAME, SNAPSHOT_MANIFEST_NAME, UPLOAD_DIRECTORY_NAME,
};
use crate::err::Error;
use crate::sstable::{Component, Descriptor, Sstable};
use crate::types::Generation;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Notify;

/// Coordinates the snapshot manifest across shards: every shard links its
/// files and signals; the nominated shard writes the manifest only after the
/// last signal.
pub struct SnapshotBarrier {
    total: usize,
    arrived: AtomicUsize,
    all_arrived: Notify,
}

impl SnapshotBarrier {
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total: total.max(1),
            arrived: AtomicUsize::new(0),
            all_arrived: Notify::new(),
        })
    }

    pub async fn arrive_and_wait(&self) {
        let arrived = self
            .arrived
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
            + 1;
        if arrived >= self.total {
            self.all_arrived.notify_waiters();
            return;
        }
        loop {
            let waiter = self.all_arrived.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            if self.arrived.load(std::sync::atomic::Ordering::Acquire) >= self.total {
                return;
            }
            waiter.await;
        }
    }
}

#[derive(Serialize)]
struct SnapshotManifest {
    files: Vec<String>,
}

impl ColumnFamily {
    /// Materializes a snapshot under `snapshots/<tag>/`: hard links to every
    /// live sstable component plus a `manifest.json` naming the data files.
    /// With a barrier, only shard 0 writes the manifest, after every shard
    /// has finished linking.
    pub async fn snapshot(
        &self,
        tag: &str,
        barrier: Option<Arc<SnapshotBarrier>>,
    ) -> Result<(), Error> {
        let snapshot_dir = self
            .datadir
            .join(SNAPSHOTS_DIRECTORY_NAME)
            .join(tag);
        fs::create_dir_all(&snapshot_dir)
            .await
            .map_err(|error| Error::DirCreationError {
                path: snapshot_dir.clone(),
                error,
            })?;

        let set = self.sstable_set().await;
        let mut data_files = Vec::with_capacity(set.len());
        for sstable in set.iter() {
            for path in sstable.component_paths() {
                let Some(name) = path.file_name() else { continue };
                let target = snapshot_dir.join(name);
                if let Err(error) = fs::hard_link(&path, &target).await {
                    if error.kind() != std::io::ErrorKind::AlreadyExists {
                        return Err(Error::SnapshotLinkError { path, error });
                    }
                }
            }
            data_files.push(sstable.data_filename());
        }

        let nominated = match barrier {
            Some(barrier) => {
                barrier.arrive_and_wait().await;
                self.config.shard_id == 0
            }
            None => true,
        };
        if nominated {
            let manifest = SnapshotManifest { files: data_files };
            let body = serde_json::to_vec_pretty(&manifest).map_err(|error| Error::JsonError {
                context: "snapshot manifest",
                error,
            })?;
            let manifest_path = snapshot_dir.join(SNAPSHOT_MANIFEST_NAME);
            fs::write(&manifest_path, body)
                .await
                .map_err(|error| Error::FileWriteError {
                    path: manifest_path,
                    error,
                })?;
        }
        Ok(())
    }

    /// Adopts sstables delivered out-of-band into `upload/`: every complete
    /// generation is renamed into the main directory under a freshly
    /// allocated generation at level 0 and added to the live set. Returns
    /// how many sstables were adopted.
    pub async fn flush_upload_dir(self: &Arc<Self>) -> Result<usize, Error> {
        let upload_dir = self.datadir.join(UPLOAD_DIRECTORY_NAME);
        let mut found: BTreeMap<Generation, Vec<(Descriptor, PathBuf)>> = BTreeMap::new();

        let mut entries = match fs::read_dir(&upload_dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => {
                return Err(Error::FileOpenError {
                    path: upload_dir,
                    error,
                })
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| Error::FileReadError {
                path: upload_dir.clone(),
                error,
            })?
        {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let descriptor = Descriptor::parse(name)?;
            found
                .entry(descriptor.generation)
                .or_default()
                .push((descriptor, path));
        }

        let mut adopted = 0;
        for (generation, files) in found {
            if !files.iter().any(|(d, _)| d.component == Component::Toc) {
                log::warn!("upload generation {generation} has no TOC, leaving it in place");
                continue;
            }
            let new_generation = self.allocate_generation();
            let mut version = self.config.sstable_version.clone();
            for (descriptor, path) in &files {
                version = descriptor.version.clone();
                let renamed = Descriptor::new(
                    &self.schema.keyspace,
                    &self.schema.name,
                    &descriptor.version,
                    new_generation,
                    descriptor.component,
                );
                let target = self.datadir.join(renamed.filename());
                fs::rename(path, &target)
                    .await
                    .map_err(|error| Error::FileRenameError {
                        from: path.clone(),
                        error,
                    })?;
            }
            let renamed = Descriptor::new(
                &self.schema.keyspace,
                &self.schema.name,
                &version,
                new_generation,
                Component::Toc,
            );
            Sstable::rewrite_level(&self.datadir, &renamed, 0).await?;
            let sstable = Arc::new(
                Sstable::open(
                    &self.datadir,
                    &self.schema.keyspace,
                    &self.schema.name,
                    &version,
                    new_generation,
                    self.config.shard_count,
                )
                .await?,
            );
            {
                let mut guard = self.sstables.write().await;
                let mut next = (**guard).clone();
                next.insert(sstable);
                *guard = Arc::new(next);
            }
            adopted += 1;
        }
        if adopted > 0 {
            self.cache.clear();
        }
        Ok(adopted)
    }

    /// Drops everything the column family stores: memtables are discarded,
    /// the cache is cleared, and every sstable is removed through the
    /// deletion votes. Snapshots first when configured to.
    pub async fn truncate(self: &Arc<Self>) -> Result<(), Error> {
        if self.config.auto_snapshot {
            let tag = format!("truncated-{}", Utc::now().timestamp_millis());
            self.snapshot(&tag, None).await?;
        }
        self.memtables.discard_all();
        self.streaming_memtables.discard_all();
        self.cache.clear();

        let removed: Vec<Arc<Sstable>> = self.sstable_set().await.all().to_vec();
        self.rebuild_sstable_list(Vec::new(), removed).await;
        Ok(())
    }
}
