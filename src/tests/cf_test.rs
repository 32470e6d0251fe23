use crate::cfg::Config;
use crate::db::Database;
use crate::mutation::{now_seconds, Mutation};
use crate::partitioner::PartitionRange;
use crate::reader::MutationReader;
use crate::schema::{CompactionStrategyKind, Schema, SchemaHandle};
use crate::sstable::QuerySlice;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config_at(path: &Path) -> Config {
    let mut config = Config::default();
    config.data_file_directories = vec![path.to_path_buf()];
    config
}

async fn open_db(path: &Path) -> (Arc<Database>, SchemaHandle, Arc<crate::cf::ColumnFamily>) {
    let db = Database::open(config_at(path)).await.unwrap();
    db.add_keyspace("apps", 1).await.unwrap();
    let schema = Schema::builder("apps", "events")
        .compaction_strategy(CompactionStrategyKind::Null)
        .build();
    let cf = db.add_column_family(schema.clone()).await.unwrap();
    (db, schema, cf)
}

fn cell_mutation(schema: &SchemaHandle, cf: &crate::cf::ColumnFamily, key: &[u8], value: &[u8], ts: i64) -> Mutation {
    let mut m = Mutation::new(schema.id, cf.decorate(key));
    m.set_cell(&[], "v", value.to_vec(), ts);
    m
}

#[tokio::test]
async fn single_key_read_through_memtable_and_sstable() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;

    // Higher timestamp goes to disk, lower stays in the memtable: the
    // merged read must still return the on-disk value.
    db.apply(&schema, cell_mutation(&schema, &cf, b"k1", b"a", 10))
        .await
        .unwrap();
    cf.flush().await.unwrap();
    db.apply(&schema, cell_mutation(&schema, &cf, b"k1", b"b", 5))
        .await
        .unwrap();

    let partition = cf.read_partition(&cf.decorate(b"k1")).await.unwrap().unwrap();
    let cell = partition.live_cell(&vec![], "v", now_seconds()).unwrap();
    assert_eq!(cell.value(), Some(&b"a"[..]));
}

#[tokio::test]
async fn tombstone_shadows_across_the_flush_boundary() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;

    db.apply(&schema, cell_mutation(&schema, &cf, b"k1", b"x", 10))
        .await
        .unwrap();
    cf.flush().await.unwrap();

    let mut delete = Mutation::new(schema.id, cf.decorate(b"k1"));
    delete.delete_partition(20, now_seconds());
    db.apply(&schema, delete).await.unwrap();

    let partition = cf.read_partition(&cf.decorate(b"k1")).await.unwrap().unwrap();
    assert!(partition.is_empty_at(now_seconds()));
}

#[tokio::test]
async fn write_is_durable_and_discardable_after_flush() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;

    db.apply(&schema, cell_mutation(&schema, &cf, b"k", b"v1", 1))
        .await
        .unwrap();
    cf.flush().await.unwrap();

    // Durable: the partition reads back from the sstable set alone.
    assert_eq!(cf.sstable_set().await.len(), 1);
    let partition = cf.read_partition(&cf.decorate(b"k")).await.unwrap().unwrap();
    assert!(!partition.is_empty_at(now_seconds()));

    // The commit log learned it can discard up to the flushed position.
    let discards = db.memory_commitlog().unwrap().discards(schema.id);
    assert_eq!(discards.len(), 1);
    assert_eq!(discards[0], cf.highest_flushed_replay_position());
}

#[tokio::test]
async fn reads_merge_memtable_cache_and_sstables() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;

    db.apply(&schema, cell_mutation(&schema, &cf, b"k", b"first", 1))
        .await
        .unwrap();
    cf.flush().await.unwrap();
    db.apply(&schema, cell_mutation(&schema, &cf, b"k", b"second", 2))
        .await
        .unwrap();
    cf.flush().await.unwrap();
    db.apply(&schema, cell_mutation(&schema, &cf, b"k", b"third", 3))
        .await
        .unwrap();

    // Two sstables plus a memtable; the read reconciles all of them.
    let partition = cf.read_partition(&cf.decorate(b"k")).await.unwrap().unwrap();
    let cell = partition.live_cell(&vec![], "v", now_seconds()).unwrap();
    assert_eq!(cell.value(), Some(&b"third"[..]));
}

#[tokio::test]
async fn sstable_set_handle_is_stable_under_flushes() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;

    db.apply(&schema, cell_mutation(&schema, &cf, b"a", b"1", 1))
        .await
        .unwrap();
    cf.flush().await.unwrap();

    let held = cf.sstable_set().await;
    let held_generations: Vec<u64> = held.iter().map(|t| t.generation).collect();

    db.apply(&schema, cell_mutation(&schema, &cf, b"b", b"2", 2))
        .await
        .unwrap();
    cf.flush().await.unwrap();

    // The old handle still observes exactly the old set.
    let after: Vec<u64> = held.iter().map(|t| t.generation).collect();
    assert_eq!(held_generations, after);
    assert_eq!(cf.sstable_set().await.len(), 2);
}

#[tokio::test]
async fn clustering_slice_query_respects_range_tombstone_from_other_sstable() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;
    use crate::mutation::{ClusteringBound, ClusteringRange, ClusteringValue};

    let ck = |v: i64| vec![ClusteringValue::BigInt(v), ClusteringValue::BigInt(v * 2)];

    // Sstable A: a live row at ck [5, 10].
    let mut live = Mutation::new(schema.id, cf.decorate(b"pk"));
    live.set_cell(&ck(5), "v", b"x".to_vec(), 100);
    db.apply(&schema, live).await.unwrap();
    cf.flush().await.unwrap();

    // Sstable B: a newer range tombstone over every clustering key.
    let mut wipe = Mutation::new(schema.id, cf.decorate(b"pk"));
    wipe.delete_range(
        ClusteringRange {
            start: Some(ClusteringBound {
                prefix: vec![ClusteringValue::BigInt(0)],
                inclusive: true,
            }),
            end: None,
        },
        200,
        now_seconds(),
    );
    db.apply(&schema, wipe).await.unwrap();
    cf.flush().await.unwrap();

    // Query ck [5,10]: the tombstone-bearing sstable is rescued by the
    // filter and shadows the live row.
    let slice = QuerySlice::of(vec![ClusteringRange {
        start: Some(ClusteringBound {
            prefix: ck(5),
            inclusive: true,
        }),
        end: Some(ClusteringBound {
            prefix: ck(5),
            inclusive: true,
        }),
    }]);
    let mut reader = cf
        .make_reader(PartitionRange::singular(cf.decorate(b"pk")), slice)
        .await
        .unwrap();
    let merged = reader.next().await.unwrap().unwrap();
    assert!(merged.partition.live_row(&ck(5), now_seconds()).is_none());
}

#[tokio::test]
async fn shared_sstable_scan_yields_only_local_shard_keys() {
    init();
    let root = tempdir().unwrap();
    let mut config = config_at(root.path());
    config.shard_count = 2;
    config.shard_id = 0;
    let db = Database::open(config).await.unwrap();
    db.add_keyspace("apps", 1).await.unwrap();
    let schema = Schema::builder("apps", "events")
        .compaction_strategy(CompactionStrategyKind::Null)
        .build();
    let cf = db.add_column_family(schema.clone()).await.unwrap();

    // Find keys for both shards.
    let mut shard0 = Vec::new();
    let mut shard1 = Vec::new();
    for i in 0..64u32 {
        let key = format!("key-{i}").into_bytes();
        match cf.decorate(&key).shard(2) {
            0 => shard0.push(key),
            _ => shard1.push(key),
        }
    }
    assert!(!shard0.is_empty() && !shard1.is_empty());

    for key in shard0.iter().chain(shard1.iter()) {
        db.apply(&schema, cell_mutation(&schema, &cf, key, b"x", 1))
            .await
            .unwrap();
    }
    cf.flush().await.unwrap();
    let set = cf.sstable_set().await;
    assert_eq!(set.len(), 1);
    assert!(set.all()[0].is_shared());

    let mut reader = cf
        .make_reader(PartitionRange::full(), QuerySlice::full())
        .await
        .unwrap();
    let mut seen = 0;
    while let Some(m) = reader.next().await.unwrap() {
        assert_eq!(m.key.shard(2), 0, "foreign-shard key leaked into the scan");
        seen += 1;
    }
    assert_eq!(seen, shard0.len());
}

#[tokio::test]
async fn singular_read_for_foreign_shard_is_empty() {
    init();
    let root = tempdir().unwrap();
    let mut config = config_at(root.path());
    config.shard_count = 2;
    config.shard_id = 0;
    let db = Database::open(config).await.unwrap();
    db.add_keyspace("apps", 1).await.unwrap();
    let schema = Schema::builder("apps", "events").build();
    let cf = db.add_column_family(schema.clone()).await.unwrap();

    let foreign = (0..64u32)
        .map(|i| format!("key-{i}").into_bytes())
        .find(|key| cf.decorate(key).shard(2) == 1)
        .unwrap();
    db.apply(&schema, cell_mutation(&schema, &cf, &foreign, b"x", 1))
        .await
        .unwrap();
    assert!(cf.read_partition(&cf.decorate(&foreign)).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_column_family_writes_are_dropped() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, _cf) = open_db(root.path()).await;
    let mut m = Mutation::new(uuid::Uuid::new_v4(), crate::partitioner::decorate(b"k"));
    m.set_cell(&[], "v", b"x".to_vec(), 1);
    // Silently dropped: the column family was just removed.
    assert!(db.apply(&schema, m).await.is_ok());
}

#[tokio::test]
async fn mismatched_schema_is_rejected() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;
    let other = Schema::builder("apps", "events").build();
    let m = cell_mutation(&schema, &cf, b"k", b"x", 1);
    let mut m = m;
    m.cf_id = schema.id;
    let err = db.apply(&other, m).await.unwrap_err();
    assert!(matches!(err, crate::err::Error::SchemaNotSynced { .. }));
}

#[tokio::test]
async fn lookup_errors_are_typed() {
    init();
    let root = tempdir().unwrap();
    let (db, _schema, _cf) = open_db(root.path()).await;
    assert!(matches!(
        db.find_keyspace("nope").unwrap_err(),
        crate::err::Error::KeyspaceNotFound { .. }
    ));
    assert!(matches!(
        db.find_column_family("apps", "nope").unwrap_err(),
        crate::err::Error::ColumnFamilyNotFound { .. }
    ));
}

#[tokio::test]
async fn snapshot_links_components_and_writes_manifest() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;
    db.apply(&schema, cell_mutation(&schema, &cf, b"k", b"v", 1))
        .await
        .unwrap();
    cf.flush().await.unwrap();

    cf.snapshot("backup-1", None).await.unwrap();
    let snapshot_dir = root
        .path()
        .join("apps")
        .join("events")
        .join("snapshots")
        .join("backup-1");
    let manifest = std::fs::read_to_string(snapshot_dir.join("manifest.json")).unwrap();
    let sstable = &cf.sstable_set().await.all()[0].data_filename();
    assert!(manifest.contains(sstable.as_str()));
    assert!(snapshot_dir.join(sstable).exists());
}

#[tokio::test]
async fn upload_directory_sstables_are_adopted_at_level_zero() {
    init();
    let root = tempdir().unwrap();
    let (_db, _schema, cf) = open_db(root.path()).await;

    // An sstable delivered out-of-band, under a generation that collides
    // with local numbering.
    let upload_dir = root.path().join("apps").join("events").join("upload");
    let key = cf.decorate(b"uploaded");
    let mut m = Mutation::new(cf.schema.id, key.clone());
    m.set_cell(&[], "v", b"from-upload".to_vec(), 9);
    crate::sstable::Sstable::write(
        &upload_dir,
        "apps",
        "events",
        "la",
        1,
        3,
        1,
        0.01,
        vec![(key.clone(), m.partition)],
    )
    .await
    .unwrap();

    let adopted = cf.flush_upload_dir().await.unwrap();
    assert_eq!(adopted, 1);
    let set = cf.sstable_set().await;
    assert_eq!(set.len(), 1);
    assert_eq!(set.all()[0].level(), 0);
    let partition = cf.read_partition(&key).await.unwrap().unwrap();
    assert_eq!(
        partition.live_cell(&vec![], "v", now_seconds()).unwrap().value(),
        Some(&b"from-upload"[..])
    );
}

#[tokio::test]
async fn truncate_discards_everything() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_db(root.path()).await;
    db.apply(&schema, cell_mutation(&schema, &cf, b"a", b"1", 1))
        .await
        .unwrap();
    cf.flush().await.unwrap();
    db.apply(&schema, cell_mutation(&schema, &cf, b"b", b"2", 2))
        .await
        .unwrap();

    cf.truncate().await.unwrap();
    assert!(cf.read_partition(&cf.decorate(b"a")).await.unwrap().is_none());
    assert!(cf.read_partition(&cf.decorate(b"b")).await.unwrap().is_none());
    assert!(cf.sstable_set().await.is_empty());
    // auto_snapshot preserved the pre-truncate sstables.
    let snapshots = root.path().join("apps").join("events").join("snapshots");
    assert!(snapshots.exists());
}

#[tokio::test]
async fn restart_recovers_sstables_from_disk() {
    init();
    let root = tempdir().unwrap();
    let schema = {
        let (db, schema, cf) = open_db(root.path()).await;
        db.apply(&schema, cell_mutation(&schema, &cf, b"k", b"persisted", 4))
            .await
            .unwrap();
        cf.flush().await.unwrap();
        db.shutdown().await.unwrap();
        schema
    };

    // A fresh database over the same directory sees the flushed data.
    let db = Database::open(config_at(root.path())).await.unwrap();
    db.add_keyspace("apps", 1).await.unwrap();
    let reopened = Schema::builder("apps", "events")
        .with_id(schema.id)
        .compaction_strategy(CompactionStrategyKind::Null)
        .build();
    let cf = db.add_column_family(reopened).await.unwrap();
    let partition = cf.read_partition(&cf.decorate(b"k")).await.unwrap().unwrap();
    assert_eq!(
        partition.live_cell(&vec![], "v", now_seconds()).unwrap().value(),
        Some(&b"persisted"[..])
    );
}
