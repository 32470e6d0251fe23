//! # Sstable discovery
//!
//! Scans a column family data directory at boot. Every file is parsed into
//! its descriptor and folded into a per-generation state machine; only a
//! generation with a final TOC is loadable. Temporary statistics are
//! scrubbed eagerly, generations that died mid-write (temporary TOC only)
//! are removed on shard 0, and a generation with data but no TOC at all
//! refuses to boot.

use crate::err::Error;
use crate::sstable::components::{Component, Descriptor};
use crate::sstable::Sstable;
use crate::types::{Generation, ShardId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GenerationStatus {
    HasSomeFile,
    HasTemporaryToc,
    HasToc,
}

struct GenerationState {
    status: GenerationStatus,
    version: String,
    files: Vec<PathBuf>,
}

/// Result of probing one column family directory.
#[derive(Debug)]
pub struct ProbeOutcome {
    /// Loadable sstables owned (at least partly) by this shard
    pub sstables: Vec<Arc<Sstable>>,

    /// Highest generation seen on disk, loadable or not
    pub max_generation: Generation,
}

/// Scans `dir` for sstables of `keyspace.cf_name`.
pub async fn populate(
    dir: &Path,
    keyspace: &str,
    cf_name: &str,
    shard_id: ShardId,
    shard_count: usize,
) -> Result<ProbeOutcome, Error> {
    let mut generations: BTreeMap<Generation, GenerationState> = BTreeMap::new();
    let mut max_generation = 0;

    let mut dir_entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ProbeOutcome {
                sstables: Vec::new(),
                max_generation: 0,
            });
        }
        Err(error) => {
            return Err(Error::FileOpenError {
                path: dir.to_path_buf(),
                error,
            })
        }
    };

    while let Some(entry) = dir_entries
        .next_entry()
        .await
        .map_err(|error| Error::FileReadError {
            path: dir.to_path_buf(),
            error,
        })?
    {
        let path = entry.path();
        if path.is_dir() {
            // snapshots/ and upload/ live next to the sstables
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let descriptor = Descriptor::parse(&name)?;
        if descriptor.keyspace != keyspace || descriptor.cf_name != cf_name {
            log::warn!(
                "foreign sstable file `{name}` in directory of {keyspace}.{cf_name}, skipping"
            );
            continue;
        }
        max_generation = max_generation.max(descriptor.generation);

        if descriptor.component == Component::TemporaryStatistics {
            // Leftover of an interrupted statistics rewrite.
            log::debug!("scrubbing temporary statistics `{name}`");
            let _ = fs::remove_file(&path).await;
            continue;
        }

        let state = generations
            .entry(descriptor.generation)
            .or_insert_with(|| GenerationState {
                status: GenerationStatus::HasSomeFile,
                version: descriptor.version.clone(),
                files: Vec::new(),
            });
        state.files.push(path);
        match descriptor.component {
            Component::Toc => {
                if state.status == GenerationStatus::HasToc {
                    return Err(Error::DuplicateToc {
                        generation: descriptor.generation,
                    });
                }
                state.status = GenerationStatus::HasToc;
            }
            Component::TemporaryToc => {
                if state.status != GenerationStatus::HasToc {
                    state.status = GenerationStatus::HasTemporaryToc;
                }
            }
            _ => {}
        }
    }

    let mut sstables = Vec::new();
    for (generation, state) in generations {
        match state.status {
            GenerationStatus::HasTemporaryToc => {
                // A write died mid-flight. One shard cleans up for everyone.
                if shard_id == 0 {
                    log::info!(
                        "removing partial sstable generation {generation} of {keyspace}.{cf_name}"
                    );
                    for path in &state.files {
                        let _ = fs::remove_file(path).await;
                    }
                }
            }
            GenerationStatus::HasSomeFile => {
                return Err(Error::MissingToc { generation });
            }
            GenerationStatus::HasToc => {
                let sst = Sstable::open(
                    dir,
                    keyspace,
                    cf_name,
                    &state.version,
                    generation,
                    shard_count,
                )
                .await?;
                if !sst.owning_shards().contains(&shard_id) {
                    log::debug!(
                        "sstable generation {generation} owned by shards {:?}, not {shard_id}; skipping",
                        sst.owning_shards()
                    );
                    sst.mark_for_deletion();
                    continue;
                }
                sstables.push(Arc::new(sst));
            }
        }
    }

    Ok(ProbeOutcome {
        sstables,
        max_generation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{Mutation, Partition};
    use crate::partitioner::{decorate, DecoratedKey};
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn write_sstable(dir: &Path, generation: u64) {
        let mut m = Mutation::new(Uuid::new_v4(), decorate(b"k"));
        m.set_cell(&[], "v", b"x".to_vec(), 1);
        let entries: Vec<(DecoratedKey, Partition)> = vec![(m.key.clone(), m.partition)];
        Sstable::write(dir, "apps", "events", "la", generation, 0, 1, 0.01, entries)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_directory_probes_clean() {
        let root = tempdir().unwrap();
        let outcome = populate(root.path(), "apps", "events", 0, 1).await.unwrap();
        assert!(outcome.sstables.is_empty());
        assert_eq!(outcome.max_generation, 0);
    }

    #[tokio::test]
    async fn complete_generations_load() {
        let root = tempdir().unwrap();
        write_sstable(root.path(), 1).await;
        write_sstable(root.path(), 4).await;
        let outcome = populate(root.path(), "apps", "events", 0, 1).await.unwrap();
        assert_eq!(outcome.sstables.len(), 2);
        assert_eq!(outcome.max_generation, 4);
    }

    #[tokio::test]
    async fn temporary_statistics_are_scrubbed() {
        let root = tempdir().unwrap();
        write_sstable(root.path(), 1).await;
        let stray = root.path().join("apps-events-la-1-TemporaryStatistics.db");
        fs::write(&stray, b"{}").await.unwrap();
        let outcome = populate(root.path(), "apps", "events", 0, 1).await.unwrap();
        assert_eq!(outcome.sstables.len(), 1);
        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn partial_generation_is_removed_on_shard_zero() {
        let root = tempdir().unwrap();
        write_sstable(root.path(), 1).await;
        // Generation 2 died before its TOC was finalized.
        let tmp_toc = root.path().join("apps-events-la-2-TemporaryTOC.db");
        let data = root.path().join("apps-events-la-2-Data.db");
        fs::write(&tmp_toc, b"TOC\nData\n").await.unwrap();
        fs::write(&data, b"junk").await.unwrap();

        let outcome = populate(root.path(), "apps", "events", 0, 1).await.unwrap();
        assert_eq!(outcome.sstables.len(), 1);
        assert!(!tmp_toc.exists());
        assert!(!data.exists());
    }

    #[tokio::test]
    async fn partial_generation_is_kept_on_other_shards() {
        let root = tempdir().unwrap();
        let tmp_toc = root.path().join("apps-events-la-2-TemporaryTOC.db");
        fs::write(&tmp_toc, b"TOC\n").await.unwrap();
        let outcome = populate(root.path(), "apps", "events", 1, 2).await.unwrap();
        assert!(outcome.sstables.is_empty());
        assert!(tmp_toc.exists());
    }

    #[tokio::test]
    async fn generation_without_toc_refuses_to_boot() {
        let root = tempdir().unwrap();
        let data = root.path().join("apps-events-la-3-Data.db");
        fs::write(&data, b"junk").await.unwrap();
        let err = populate(root.path(), "apps", "events", 0, 1).await.unwrap_err();
        assert!(matches!(err, Error::MissingToc { generation: 3 }));
    }
}
