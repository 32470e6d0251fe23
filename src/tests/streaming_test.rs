use crate::cfg::Config;
use crate::db::Database;
use crate::mutation::{now_seconds, Mutation};
use crate::schema::{CompactionStrategyKind, Schema, SchemaHandle};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config_at(path: &Path) -> Config {
    let mut config = Config::default();
    config.data_file_directories = vec![path.to_path_buf()];
    config.compaction_interval_millis = 3_600_000;
    config
}

async fn open_cf(path: &Path) -> (Arc<Database>, SchemaHandle, Arc<crate::cf::ColumnFamily>) {
    let db = Database::open(config_at(path)).await.unwrap();
    db.add_keyspace("apps", 1).await.unwrap();
    let schema = Schema::builder("apps", "events")
        .compaction_strategy(CompactionStrategyKind::Null)
        .build();
    let cf = db.add_column_family(schema.clone()).await.unwrap();
    (db, schema, cf)
}

fn streamed(schema: &SchemaHandle, cf: &crate::cf::ColumnFamily, key: &[u8], value: &[u8], ts: i64) -> crate::mutation::FrozenMutation {
    let mut m = Mutation::new(schema.id, cf.decorate(key));
    m.set_cell(&[], "v", value.to_vec(), ts);
    m.freeze().unwrap()
}

#[tokio::test]
async fn streamed_mutations_are_readable_before_any_seal() {
    init();
    let root = tempdir().unwrap();
    let (_db, schema, cf) = open_cf(root.path()).await;
    let plan = Uuid::new_v4();

    cf.apply_streaming_mutation(&schema, plan, &streamed(&schema, &cf, b"s1", b"v", 3), false)
        .await
        .unwrap();

    // Still only in the streaming memtable; reads must already see it.
    assert!(cf.sstable_set().await.is_empty());
    let partition = cf.read_partition(&cf.decorate(b"s1")).await.unwrap().unwrap();
    assert_eq!(
        partition.live_cell(&vec![], "v", now_seconds()).unwrap().value(),
        Some(&b"v"[..])
    );
}

#[tokio::test]
async fn streaming_seal_writes_sstable_and_invalidates_cache() {
    init();
    let root = tempdir().unwrap();
    let (db, schema, cf) = open_cf(root.path()).await;

    // Put the partition into the cache through the regular path.
    let mut m = Mutation::new(schema.id, cf.decorate(b"hot"));
    m.set_cell(&[], "v", b"old".to_vec(), 1);
    db.apply(&schema, m).await.unwrap();
    cf.flush().await.unwrap();
    let _ = cf.read_partition(&cf.decorate(b"hot")).await.unwrap();
    assert!(cf.cache().contains(&cf.decorate(b"hot")));

    // Stream a newer value for the same partition and seal immediately.
    let plan = Uuid::new_v4();
    cf.apply_streaming_mutation(&schema, plan, &streamed(&schema, &cf, b"hot", b"new", 9), false)
        .await
        .unwrap();
    cf.seal_active_streaming_memtable_immediate().await.unwrap();

    // The streaming flush never updates the cache; it invalidates, and the
    // next read re-populates with the merged value.
    assert!(!cf.cache().contains(&cf.decorate(b"hot")));
    assert_eq!(cf.sstable_set().await.len(), 2);
    let partition = cf.read_partition(&cf.decorate(b"hot")).await.unwrap().unwrap();
    assert_eq!(
        partition.live_cell(&vec![], "v", now_seconds()).unwrap().value(),
        Some(&b"new"[..])
    );
}

#[tokio::test]
async fn fragmented_plan_publishes_every_fragment_atomically() {
    init();
    let root = tempdir().unwrap();
    let (_db, schema, cf) = open_cf(root.path()).await;
    let plan = Uuid::new_v4();

    // Fragments of one oversized partition, delivered separately.
    for (i, column) in ["c1", "c2", "c3"].iter().enumerate() {
        let mut m = Mutation::new(schema.id, cf.decorate(b"big"));
        m.set_cell(&[], column, vec![i as u8; 1024], 10 + i as i64);
        cf.apply_streaming_mutation(&schema, plan, &m.freeze().unwrap(), true)
            .await
            .unwrap();
    }
    cf.complete_streaming_plan(plan).await.unwrap();

    assert!(!cf.sstable_set().await.is_empty());
    let partition = cf.read_partition(&cf.decorate(b"big")).await.unwrap().unwrap();
    for column in ["c1", "c2", "c3"] {
        assert!(partition.live_cell(&vec![], column, now_seconds()).is_some());
    }
}

#[tokio::test]
async fn failed_plan_leaves_nothing_behind() {
    init();
    let root = tempdir().unwrap();
    let (_db, schema, cf) = open_cf(root.path()).await;
    let plan = Uuid::new_v4();

    // Force at least one big-list seal so an sstable exists to abandon.
    let mut m = Mutation::new(schema.id, cf.decorate(b"doomed"));
    m.set_cell(&[], "v", vec![1u8; 128 * 1024], 5);
    cf.apply_streaming_mutation(&schema, plan, &m.freeze().unwrap(), true)
        .await
        .unwrap();

    cf.fail_streaming_mutations(plan).await.unwrap();
    assert!(cf.sstable_set().await.is_empty());

    // The plan is gone; completing it now is an error.
    assert!(matches!(
        cf.complete_streaming_plan(plan).await.unwrap_err(),
        crate::err::Error::StreamingPlanNotFound { .. }
    ));
}

#[tokio::test]
async fn unknown_plan_is_a_typed_error() {
    init();
    let root = tempdir().unwrap();
    let (_db, _schema, cf) = open_cf(root.path()).await;
    assert!(matches!(
        cf.fail_streaming_mutations(Uuid::new_v4()).await.unwrap_err(),
        crate::err::Error::StreamingPlanNotFound { .. }
    ));
}
