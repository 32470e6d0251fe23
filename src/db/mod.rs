//! # Database
//!
//! The per-shard container: maps column family ids to column families and
//! keyspace names to keyspaces, owns the three dirty-memory managers (user,
//! system, streaming), and routes writes through the commit log into the
//! right column family.

use crate::cf::{ColumnFamily, SnapshotBarrier};
use crate::cfg::Config;
use crate::commitlog::{CommitLog, MemoryCommitLog, ReplayPosition};
use crate::compaction::AtomicDeletionManager;
use crate::consts::{
    DEFAULT_MEMTABLE_TOTAL_SPACE_IN_MB, KB, MB, STREAMING_SPACE_FRACTION,
    SYSTEM_KEYSPACE_NAME, SYSTEM_MEMORY_HEADROOM,
};
use crate::dirty::DirtyMemoryManager;
use crate::err::Error;
use crate::keyspace::{Keyspace, SimpleStrategy};
use crate::mutation::Mutation;
use crate::partitioner::Token;
use crate::schema::SchemaHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::fs;
use uuid::Uuid;

pub struct Database {
    config: Arc<Config>,

    keyspaces: RwLock<HashMap<String, Arc<Keyspace>>>,
    column_families: RwLock<HashMap<Uuid, Arc<ColumnFamily>>>,
    cf_names: RwLock<HashMap<(String, String), Uuid>>,

    /// Dirty-memory accounting for regular user writes
    user_dirty: Arc<DirtyMemoryManager>,

    /// System tables get extra headroom so they stay writable under a
    /// user-write throttle
    system_dirty: Arc<DirtyMemoryManager>,

    /// Streaming ingest is accounted separately from foreground writes
    streaming_dirty: Arc<DirtyMemoryManager>,

    commitlog: Option<Arc<dyn CommitLog>>,
    memory_commitlog: Option<Arc<MemoryCommitLog>>,

    deletion: Arc<AtomicDeletionManager>,
}

impl Database {
    pub async fn open(config: Config) -> Result<Arc<Database>, Error> {
        if config.data_file_directories.is_empty() {
            return Err(Error::NoDataDirectories);
        }
        let config = Arc::new(config);

        let total_space = if config.memtable_total_space_in_mb > 0 {
            config.memtable_total_space_in_mb * MB
        } else {
            DEFAULT_MEMTABLE_TOTAL_SPACE_IN_MB * MB
        };
        let user_dirty = DirtyMemoryManager::new("user", total_space / 2, total_space);
        let system_dirty = DirtyMemoryManager::new(
            "system",
            (total_space + SYSTEM_MEMORY_HEADROOM) / 2,
            total_space + SYSTEM_MEMORY_HEADROOM,
        );
        let streaming_space = total_space / STREAMING_SPACE_FRACTION;
        let streaming_dirty =
            DirtyMemoryManager::new("streaming", streaming_space / 2, streaming_space);
        user_dirty.start_flusher();
        system_dirty.start_flusher();
        streaming_dirty.start_flusher();

        let memory_commitlog = config
            .enable_commitlog
            .then(|| Arc::new(MemoryCommitLog::new()));
        let commitlog: Option<Arc<dyn CommitLog>> = memory_commitlog
            .as_ref()
            .map(|log| Arc::clone(log) as Arc<dyn CommitLog>);

        let db = Arc::new(Database {
            deletion: AtomicDeletionManager::new(config.shard_count),
            keyspaces: RwLock::new(HashMap::new()),
            column_families: RwLock::new(HashMap::new()),
            cf_names: RwLock::new(HashMap::new()),
            user_dirty,
            system_dirty,
            streaming_dirty,
            commitlog,
            memory_commitlog,
            config,
        });

        // The commit log asks for flushes when it runs out of segments.
        if let Some(log) = &db.commitlog {
            let weak: Weak<Database> = Arc::downgrade(&db);
            log.add_flush_handler(Box::new(move |cf_id, rp: ReplayPosition| {
                let Some(db) = weak.upgrade() else { return };
                tokio::spawn(async move {
                    let Some(cf) = db.column_family_by_id(cf_id) else {
                        return;
                    };
                    log::debug!("commit log requested flush of {cf_id} up to {rp:?}");
                    if let Err(err) = cf.flush().await {
                        log::error!("commit-log-driven flush failed: {err}");
                    }
                });
            }));
        }
        Ok(db)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn shard_id(&self) -> usize {
        self.config.shard_id
    }

    /// Creates a keyspace backed by a single-node ring view.
    pub async fn add_keyspace(&self, name: &str, replication_factor: usize) -> Result<Arc<Keyspace>, Error> {
        if self.keyspaces.read().expect("keyspaces poisoned").contains_key(name) {
            return Err(Error::KeyspaceAlreadyExists {
                name: name.to_string(),
            });
        }
        let datadir = self.config.data_file_directories[0].join(name);
        fs::create_dir_all(&datadir)
            .await
            .map_err(|error| Error::DirCreationError {
                path: datadir.clone(),
                error,
            })?;
        let strategy = Arc::new(SimpleStrategy::new(
            replication_factor,
            vec![(Token::MIN, "127.0.0.1".to_string())],
        ));
        let keyspace = Keyspace::new(name, strategy, datadir);
        self.keyspaces
            .write()
            .expect("keyspaces poisoned")
            .insert(name.to_string(), Arc::clone(&keyspace));
        Ok(keyspace)
    }

    /// Installs a column family for a schema: its directory is probed for
    /// existing sstables and background tasks start.
    pub async fn add_column_family(&self, schema: SchemaHandle) -> Result<Arc<ColumnFamily>, Error> {
        let keyspace = self.find_keyspace(&schema.keyspace)?;
        let key = (schema.keyspace.clone(), schema.name.clone());
        if self.cf_names.read().expect("cf names poisoned").contains_key(&key) {
            return Err(Error::ColumnFamilyAlreadyExists {
                keyspace: schema.keyspace.clone(),
                name: schema.name.clone(),
            });
        }
        let datadir = keyspace.column_family_datadir(&schema.name);
        fs::create_dir_all(&datadir)
            .await
            .map_err(|error| Error::DirCreationError {
                path: datadir.clone(),
                error,
            })?;
        let dirty = if schema.keyspace == SYSTEM_KEYSPACE_NAME {
            Arc::clone(&self.system_dirty)
        } else {
            Arc::clone(&self.user_dirty)
        };
        let cf = ColumnFamily::new(
            Arc::clone(&schema),
            Arc::clone(&self.config),
            datadir,
            dirty,
            Arc::clone(&self.streaming_dirty),
            self.commitlog.clone(),
            Arc::clone(&self.deletion),
        );
        cf.init().await?;
        cf.start_background_tasks();

        self.column_families
            .write()
            .expect("column families poisoned")
            .insert(schema.id, Arc::clone(&cf));
        self.cf_names
            .write()
            .expect("cf names poisoned")
            .insert(key, schema.id);
        Ok(cf)
    }

    /// Truncates and removes a column family.
    pub async fn drop_column_family(&self, keyspace: &str, name: &str) -> Result<(), Error> {
        let cf = self.find_column_family(keyspace, name)?;
        cf.truncate().await?;
        cf.close().await;
        self.cf_names
            .write()
            .expect("cf names poisoned")
            .remove(&(keyspace.to_string(), name.to_string()));
        self.column_families
            .write()
            .expect("column families poisoned")
            .remove(&cf.schema.id);
        Ok(())
    }

    pub fn find_keyspace(&self, name: &str) -> Result<Arc<Keyspace>, Error> {
        self.keyspaces
            .read()
            .expect("keyspaces poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::KeyspaceNotFound {
                name: name.to_string(),
            })
    }

    pub fn find_column_family(&self, keyspace: &str, name: &str) -> Result<Arc<ColumnFamily>, Error> {
        let id = self
            .cf_names
            .read()
            .expect("cf names poisoned")
            .get(&(keyspace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| Error::ColumnFamilyNotFound {
                keyspace: keyspace.to_string(),
                name: name.to_string(),
            })?;
        self.column_family_by_id(id)
            .ok_or_else(|| Error::ColumnFamilyNotFound {
                keyspace: keyspace.to_string(),
                name: name.to_string(),
            })
    }

    pub fn column_family_by_id(&self, id: Uuid) -> Option<Arc<ColumnFamily>> {
        self.column_families
            .read()
            .expect("column families poisoned")
            .get(&id)
            .cloned()
    }

    /// Applies a mutation: append to the commit log, then into the column
    /// family at the returned replay position. A replay-position reordering
    /// is retried once by re-appending; a mutation for an unknown column
    /// family is dropped (the family was just removed).
    pub async fn apply(&self, schema: &SchemaHandle, m: Mutation) -> Result<(), Error> {
        let Some(cf) = self.column_family_by_id(m.cf_id) else {
            log::warn!("dropping mutation for unknown column family {}", m.cf_id);
            return Ok(());
        };
        let frozen = m.freeze()?;
        if frozen.size() > self.config.batch_size_warn_threshold_in_kb * KB {
            log::warn!(
                "write of {} bytes to {}.{} exceeds the batch size warning threshold",
                frozen.size(),
                schema.keyspace,
                schema.name
            );
        }
        match &self.commitlog {
            Some(log) => {
                let rp = log.add_entry(m.cf_id, &frozen).await?;
                match cf.apply(schema, &m, rp).await {
                    Err(Error::ReplayPositionReordering { .. }) => {
                        log::warn!(
                            "replay position reordering on {}.{}; re-appending to the commit log",
                            schema.keyspace,
                            schema.name
                        );
                        let rp = log.add_entry(m.cf_id, &frozen).await?;
                        cf.apply(schema, &m, rp).await
                    }
                    other => other,
                }
            }
            None => cf.apply(schema, &m, ReplayPosition::ZERO).await,
        }
    }

    /// Explicitly flushes every column family.
    pub async fn flush_all(&self) -> Result<(), Error> {
        let cfs: Vec<Arc<ColumnFamily>> = self
            .column_families
            .read()
            .expect("column families poisoned")
            .values()
            .cloned()
            .collect();
        for cf in cfs {
            cf.flush().await?;
        }
        Ok(())
    }

    /// A barrier for coordinating snapshot manifests across shards.
    pub fn snapshot_barrier(&self) -> Arc<SnapshotBarrier> {
        SnapshotBarrier::new(self.config.shard_count)
    }

    pub fn user_dirty_memory(&self) -> &Arc<DirtyMemoryManager> {
        &self.user_dirty
    }

    pub fn system_dirty_memory(&self) -> &Arc<DirtyMemoryManager> {
        &self.system_dirty
    }

    pub fn streaming_dirty_memory(&self) -> &Arc<DirtyMemoryManager> {
        &self.streaming_dirty
    }

    pub fn deletion_manager(&self) -> &Arc<AtomicDeletionManager> {
        &self.deletion
    }

    /// The in-memory commit log, when journaling is enabled.
    pub fn memory_commitlog(&self) -> Option<&Arc<MemoryCommitLog>> {
        self.memory_commitlog.as_ref()
    }

    /// Drains flushes, closes every column family, stops the dirty-memory
    /// managers, and shuts the commit log down.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.flush_all().await?;
        let cfs: Vec<Arc<ColumnFamily>> = self
            .column_families
            .read()
            .expect("column families poisoned")
            .values()
            .cloned()
            .collect();
        for cf in cfs {
            cf.close().await;
        }
        self.user_dirty.shutdown().await;
        self.system_dirty.shutdown().await;
        self.streaming_dirty.shutdown().await;
        if let Some(log) = &self.commitlog {
            log.shutdown().await;
        }
        Ok(())
    }
}
