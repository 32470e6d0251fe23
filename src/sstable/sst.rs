//! # Sstable
//!
//! An immutable on-disk sorted table: the unit of persistence and compaction.
//! One generation is a family of component files described by its TOC. The
//! Data component holds one lz4-compressed record per partition; the Index
//! maps decorated keys to record offsets; Statistics carries the metadata the
//! read path prunes on (timestamp bounds, tombstone drop-time histogram,
//! per-clustering-component bounds, owning shards, level).

use crate::err::Error;
use crate::filter::BloomFilter;
use crate::mutation::{ClusteringValue, Partition};
use crate::partitioner::{shard_of, DecoratedKey, PartitionRange};
use crate::sstable::components::{Component, Descriptor};
use crate::types::{Generation, ShardId};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Seconds per histogram bucket of the tombstone drop-time estimate.
const DROP_TIME_BUCKET: u32 = 3600;

/// Contents of the Statistics component.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatsMetadata {
    pub min_timestamp: i64,
    pub max_timestamp: i64,

    /// Estimated histogram of tombstone drop times: bucket seconds → count
    pub tombstone_drop_times: Vec<(u32, u64)>,

    /// Per-component minimum over all clustering keys present
    pub min_clustering: Vec<ClusteringValue>,

    /// Per-component maximum over all clustering keys present
    pub max_clustering: Vec<ClusteringValue>,

    /// Shards responsible for at least one contained token
    pub owning_shards: Vec<ShardId>,

    pub level: u32,

    pub partition_count: u64,
}

impl StatsMetadata {
    pub fn has_tombstones(&self) -> bool {
        !self.tombstone_drop_times.is_empty()
    }
}

/// Contents of the Summary component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    pub first_key: DecoratedKey,
    pub last_key: DecoratedKey,
    pub partition_count: u64,
}

/// Contents of the CompressionInfo component.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct CompressionInfo {
    algorithm: String,
    record_count: u64,
    uncompressed_length: u64,
    compressed_length: u64,
}

pub struct Sstable {
    pub keyspace: String,
    pub cf_name: String,
    pub version: String,
    pub generation: Generation,
    dir: PathBuf,
    metadata: StatsMetadata,
    summary: Summary,
    filter: BloomFilter,
    /// Partition index: decorated key → offset of its Data record
    index: Vec<(DecoratedKey, u64)>,
    data_size: u64,
    shard_count: usize,
    marked_for_deletion: AtomicBool,
}

impl std::fmt::Debug for Sstable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sstable")
            .field("keyspace", &self.keyspace)
            .field("cf_name", &self.cf_name)
            .field("generation", &self.generation)
            .field("level", &self.metadata.level)
            .field("partitions", &self.summary.partition_count)
            .finish()
    }
}

impl Sstable {
    /// Writes a complete sstable family from ordered partitions and opens it.
    ///
    /// A TemporaryTOC marks the generation as in-progress; the final TOC is
    /// only written after every other component is durable, so a crash leaves
    /// either a complete sstable or a scrubbable partial one.
    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        dir: &Path,
        keyspace: &str,
        cf_name: &str,
        version: &str,
        generation: Generation,
        level: u32,
        shard_count: usize,
        false_positive_rate: f64,
        entries: Vec<(DecoratedKey, Partition)>,
    ) -> Result<Sstable, Error> {
        debug_assert!(
            entries.windows(2).all(|w| w[0].0 < w[1].0),
            "sstable entries must be sorted by decorated key"
        );
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Err(Error::MalformedSstable {
                path: dir.to_path_buf(),
                reason: "refusing to write an empty sstable".to_string(),
            });
        };
        let summary = Summary {
            first_key: first.0.clone(),
            last_key: last.0.clone(),
            partition_count: entries.len() as u64,
        };

        fs::create_dir_all(dir).await.map_err(|error| Error::DirCreationError {
            path: dir.to_path_buf(),
            error,
        })?;
        let descriptor = Descriptor::new(keyspace, cf_name, version, generation, Component::Toc);
        let path_of = |component: Component| dir.join(descriptor.with_component(component).filename());

        let toc_body: String = Component::LIVE
            .iter()
            .map(|c| format!("{}\n", c.name()))
            .collect();
        write_file(&path_of(Component::TemporaryToc), toc_body.as_bytes()).await?;

        // Data + Index, accumulating metadata and the filter in one pass.
        let mut filter = BloomFilter::new(false_positive_rate, entries.len());
        let mut metadata = StatsMetadata {
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            level,
            ..Default::default()
        };
        let mut drop_histogram: std::collections::BTreeMap<u32, u64> = Default::default();
        let mut owning: std::collections::BTreeSet<ShardId> = Default::default();
        let mut index: Vec<(DecoratedKey, u64)> = Vec::with_capacity(entries.len());
        let mut data: Vec<u8> = Vec::new();
        let mut uncompressed_length = 0u64;

        for (key, partition) in &entries {
            filter.set(&key.key);
            owning.insert(shard_of(key.token, shard_count));
            metadata.min_timestamp = metadata.min_timestamp.min(partition.min_timestamp());
            metadata.max_timestamp = metadata.max_timestamp.max(partition.max_timestamp());
            for t in partition.tombstone_drop_times() {
                *drop_histogram.entry(t - (t % DROP_TIME_BUCKET)).or_insert(0) += 1;
            }
            for ck in partition.rows.keys() {
                accumulate_clustering_bounds(&mut metadata, ck);
            }

            let record = bincode::serialize(&(key, partition)).map_err(|error| Error::EncodeError {
                context: "sstable data record",
                error,
            })?;
            uncompressed_length += record.len() as u64;
            let compressed = lz4_flex::compress_prepend_size(&record);
            index.push((key.clone(), data.len() as u64));
            let mut len_prefix = [0u8; 4];
            BigEndian::write_u32(&mut len_prefix, compressed.len() as u32);
            data.extend_from_slice(&len_prefix);
            data.extend_from_slice(&compressed);
        }
        metadata.partition_count = entries.len() as u64;
        metadata.tombstone_drop_times = drop_histogram.into_iter().collect();
        metadata.owning_shards = owning.into_iter().collect();

        let data_path = path_of(Component::Data);
        write_file(&data_path, &data).await?;
        sync_file(&data_path).await?;

        let index_bytes = bincode::serialize(&index).map_err(|error| Error::EncodeError {
            context: "sstable index",
            error,
        })?;
        write_file(&path_of(Component::Index), &index_bytes).await?;

        write_file(&path_of(Component::Filter), &filter.to_bytes()).await?;

        write_json(&path_of(Component::Summary), &summary, "sstable summary").await?;

        // Statistics goes through its temporary name, as the loader scrubs.
        let tmp_stats = path_of(Component::TemporaryStatistics);
        write_json(&tmp_stats, &metadata, "sstable statistics").await?;
        rename_file(&tmp_stats, &path_of(Component::Statistics)).await?;

        let compression = CompressionInfo {
            algorithm: "lz4".to_string(),
            record_count: entries.len() as u64,
            uncompressed_length,
            compressed_length: data.len() as u64,
        };
        write_json(
            &path_of(Component::CompressionInfo),
            &compression,
            "sstable compression info",
        )
        .await?;

        // All components durable: publish the TOC and drop the temporary.
        write_file(&path_of(Component::Toc), toc_body.as_bytes()).await?;
        sync_file(&path_of(Component::Toc)).await?;
        remove_file(&path_of(Component::TemporaryToc)).await?;

        Ok(Sstable {
            keyspace: keyspace.to_string(),
            cf_name: cf_name.to_string(),
            version: version.to_string(),
            generation,
            dir: dir.to_path_buf(),
            metadata,
            summary,
            filter,
            index,
            data_size: data.len() as u64,
            shard_count,
            marked_for_deletion: AtomicBool::new(false),
        })
    }

    /// Opens an existing generation: verifies the TOC and loads summary,
    /// statistics, filter, and the partition index into memory.
    pub async fn open(
        dir: &Path,
        keyspace: &str,
        cf_name: &str,
        version: &str,
        generation: Generation,
        shard_count: usize,
    ) -> Result<Sstable, Error> {
        let descriptor = Descriptor::new(keyspace, cf_name, version, generation, Component::Toc);
        let path_of = |component: Component| dir.join(descriptor.with_component(component).filename());

        let toc_path = path_of(Component::Toc);
        let toc = fs::read_to_string(&toc_path)
            .await
            .map_err(|error| Error::FileReadError {
                path: toc_path.clone(),
                error,
            })?;
        for line in toc.lines().filter(|l| !l.trim().is_empty()) {
            let component = Component::parse(line.trim()).ok_or_else(|| Error::MalformedSstable {
                path: toc_path.clone(),
                reason: format!("unknown component `{line}` in TOC"),
            })?;
            let present = fs::try_exists(path_of(component)).await.unwrap_or(false);
            if !present {
                return Err(Error::SstableComponentMissing {
                    generation,
                    component: component.name(),
                });
            }
        }

        let summary: Summary = read_json(&path_of(Component::Summary), "sstable summary").await?;
        let metadata: StatsMetadata =
            read_json(&path_of(Component::Statistics), "sstable statistics").await?;

        let filter_path = path_of(Component::Filter);
        let filter_bytes = fs::read(&filter_path)
            .await
            .map_err(|error| Error::FileReadError {
                path: filter_path.clone(),
                error,
            })?;
        let filter = BloomFilter::from_bytes(&filter_path, &filter_bytes)?;

        let index_path = path_of(Component::Index);
        let index_bytes = fs::read(&index_path)
            .await
            .map_err(|error| Error::FileReadError {
                path: index_path.clone(),
                error,
            })?;
        let index: Vec<(DecoratedKey, u64)> =
            bincode::deserialize(&index_bytes).map_err(|error| Error::DecodeError {
                context: "sstable index",
                error,
            })?;

        let data_path = path_of(Component::Data);
        let data_size = fs::metadata(&data_path)
            .await
            .map_err(|error| Error::GetFileMetaDataError {
                path: data_path.clone(),
                error,
            })?
            .len();

        Ok(Sstable {
            keyspace: keyspace.to_string(),
            cf_name: cf_name.to_string(),
            version: version.to_string(),
            generation,
            dir: dir.to_path_buf(),
            metadata,
            summary,
            filter,
            index,
            data_size,
            shard_count,
            marked_for_deletion: AtomicBool::new(false),
        })
    }

    pub fn component_path(&self, component: Component) -> PathBuf {
        let descriptor = Descriptor::new(
            &self.keyspace,
            &self.cf_name,
            &self.version,
            self.generation,
            component,
        );
        self.dir.join(descriptor.filename())
    }

    /// Paths of every live component of this generation.
    pub fn component_paths(&self) -> Vec<PathBuf> {
        Component::LIVE
            .iter()
            .map(|c| self.component_path(*c))
            .collect()
    }

    pub fn data_filename(&self) -> String {
        Descriptor::new(
            &self.keyspace,
            &self.cf_name,
            &self.version,
            self.generation,
            Component::Data,
        )
        .filename()
    }

    pub fn metadata(&self) -> &StatsMetadata {
        &self.metadata
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn level(&self) -> u32 {
        self.metadata.level
    }

    pub fn min_timestamp(&self) -> i64 {
        self.metadata.min_timestamp
    }

    pub fn max_timestamp(&self) -> i64 {
        self.metadata.max_timestamp
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn owning_shards(&self) -> &[ShardId] {
        &self.metadata.owning_shards
    }

    /// More than one shard owns tokens in this sstable.
    pub fn is_shared(&self) -> bool {
        self.metadata.owning_shards.len() > 1
    }

    /// Exactly one shard is responsible for every contained token.
    pub fn unshared(&self) -> bool {
        !self.is_shared()
    }

    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    /// Bloom-filter check; false only when the key is certainly absent.
    pub fn may_contain(&self, key: &DecoratedKey) -> bool {
        self.filter.contains(&key.key)
    }

    /// Whether `[first_key, last_key]` intersects the range.
    pub fn overlaps(&self, range: &PartitionRange) -> bool {
        range.overlaps(&self.summary.first_key, &self.summary.last_key)
    }

    /// Single-partition lookup.
    pub async fn read_partition(&self, key: &DecoratedKey) -> Result<Option<Partition>, Error> {
        let slot = match self.index.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(i) => i,
            Err(_) => return Ok(None),
        };
        let (_, offset) = &self.index[slot];
        let (found, partition) = self.read_record(*offset).await?;
        if &found != key {
            return Err(Error::MalformedSstable {
                path: self.component_path(Component::Data),
                reason: "index offset points at a different partition".to_string(),
            });
        }
        Ok(Some(partition))
    }

    /// Range scan in decorated-key order. When the sstable is shared across
    /// shards, keys owned by other shards are filtered out on the fly.
    pub async fn read_range(
        &self,
        range: &PartitionRange,
        current_shard: Option<ShardId>,
    ) -> Result<Vec<(DecoratedKey, Partition)>, Error> {
        let shard_filter = current_shard.filter(|_| self.is_shared());
        let mut out = Vec::new();
        for (key, offset) in &self.index {
            if !range.contains(key) {
                continue;
            }
            if let Some(shard) = shard_filter {
                if shard_of(key.token, self.shard_count) != shard {
                    continue;
                }
            }
            let (_, partition) = self.read_record(*offset).await?;
            out.push((key.clone(), partition));
        }
        Ok(out)
    }

    async fn read_record(&self, offset: u64) -> Result<(DecoratedKey, Partition), Error> {
        let path = self.component_path(Component::Data);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|error| Error::FileOpenError {
                path: path.clone(),
                error,
            })?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|error| Error::FileReadError {
                path: path.clone(),
                error,
            })?;
        let mut len_prefix = [0u8; 4];
        file.read_exact(&mut len_prefix)
            .await
            .map_err(|error| Error::FileReadError {
                path: path.clone(),
                error,
            })?;
        let len = BigEndian::read_u32(&len_prefix) as usize;
        let mut compressed = vec![0u8; len];
        file.read_exact(&mut compressed)
            .await
            .map_err(|error| Error::FileReadError {
                path: path.clone(),
                error,
            })?;
        let record = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|_| Error::DecompressError { path: path.clone() })?;
        bincode::deserialize(&record).map_err(|error| Error::DecodeError {
            context: "sstable data record",
            error,
        })
    }

    /// Removes every component file of this generation.
    pub async fn delete_files(&self) -> Result<(), Error> {
        for path in self.component_paths() {
            remove_file(&path).await?;
        }
        Ok(())
    }

    /// Rewrites the Statistics component of an on-disk generation with a new
    /// level; used when adopting foreign sstables at level 0.
    pub async fn rewrite_level(
        dir: &Path,
        descriptor: &Descriptor,
        level: u32,
    ) -> Result<(), Error> {
        let stats_path = dir.join(descriptor.with_component(Component::Statistics).filename());
        let mut metadata: StatsMetadata = read_json(&stats_path, "sstable statistics").await?;
        metadata.level = level;
        write_json(&stats_path, &metadata, "sstable statistics").await
    }
}

fn accumulate_clustering_bounds(metadata: &mut StatsMetadata, ck: &[ClusteringValue]) {
    for (i, value) in ck.iter().enumerate() {
        if i == metadata.min_clustering.len() {
            metadata.min_clustering.push(value.clone());
        } else if *value < metadata.min_clustering[i] {
            metadata.min_clustering[i] = value.clone();
        }
        if i == metadata.max_clustering.len() {
            metadata.max_clustering.push(value.clone());
        } else if *value > metadata.max_clustering[i] {
            metadata.max_clustering[i] = value.clone();
        }
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    fs::write(path, bytes)
        .await
        .map_err(|error| Error::FileWriteError {
            path: path.to_path_buf(),
            error,
        })
}

async fn sync_file(path: &Path) -> Result<(), Error> {
    let file = fs::File::open(path)
        .await
        .map_err(|error| Error::FileOpenError {
            path: path.to_path_buf(),
            error,
        })?;
    file.sync_all().await.map_err(|error| Error::FileSyncError {
        path: path.to_path_buf(),
        error,
    })
}

async fn rename_file(from: &Path, to: &Path) -> Result<(), Error> {
    fs::rename(from, to)
        .await
        .map_err(|error| Error::FileRenameError {
            from: from.to_path_buf(),
            error,
        })
}

async fn remove_file(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(Error::FileRemoveError {
            path: path.to_path_buf(),
            error,
        }),
    }
}

async fn write_json<T: Serialize>(
    path: &Path,
    value: &T,
    context: &'static str,
) -> Result<(), Error> {
    let body = serde_json::to_vec_pretty(value).map_err(|error| Error::JsonError {
        context,
        error,
    })?;
    write_file(path, &body).await
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    path: &Path,
    context: &'static str,
) -> Result<T, Error> {
    let bytes = fs::read(path).await.map_err(|error| Error::FileReadError {
        path: path.to_path_buf(),
        error,
    })?;
    serde_json::from_slice(&bytes).map_err(|error| Error::JsonError { context, error })
}
