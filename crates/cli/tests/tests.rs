use config::StorageGroupConfig;
use engine::StorageGroupProcessor;
use tempfile::tempdir;

fn small_sg() -> (tempfile::TempDir, StorageGroupProcessor) {
    let dir = tempdir().unwrap();
    let config = StorageGroupConfig { partition_interval_ms: 1_000, ..Default::default() };
    let sg = StorageGroupProcessor::new("sg", dir.path(), config).unwrap();
    (dir, sg)
}

#[test]
fn insert_then_query_roundtrip() {
    let (_dir, sg) = small_sg();
    sg.insert("root.d0", "s0", 10, memtable::DataValue::Int64(42)).unwrap();

    let samples = sg.query("root.d0", "s0").collect(sg.cache()).unwrap();
    assert_eq!(samples, vec![(10, memtable::DataValue::Int64(42))]);
}

#[test]
fn delete_removes_value_from_live_memtable() {
    let (_dir, sg) = small_sg();
    sg.insert("root.d0", "s0", 10, memtable::DataValue::Int64(1)).unwrap();
    sg.delete("root.d0", "s0", 10).unwrap();

    let samples = sg.query("root.d0", "s0").collect(sg.cache()).unwrap();
    assert!(samples.is_empty());
}

#[test]
fn insert_tablet_writes_every_row() {
    let (_dir, sg) = small_sg();
    let rows = vec![
        (1, vec![("s0".to_string(), memtable::DataValue::Int64(1))]),
        (2, vec![("s0".to_string(), memtable::DataValue::Int64(2))]),
    ];
    let results = sg.insert_tablet("root.d0", &rows);
    assert!(results.iter().all(|r| r.is_ok()));

    let samples = sg.query("root.d0", "s0").collect(sg.cache()).unwrap();
    assert_eq!(samples.len(), 2);
}

#[test]
fn close_all_leaves_group_queryable() {
    let (_dir, sg) = small_sg();
    sg.insert("root.d0", "s0", 10, memtable::DataValue::Int64(1)).unwrap();
    sg.close_all().unwrap();

    let samples = sg.query("root.d0", "s0").collect(sg.cache()).unwrap();
    assert_eq!(samples.len(), 1);
}

#[test]
fn merge_is_a_noop_on_an_empty_group() {
    let (_dir, sg) = small_sg();
    sg.merge(false).unwrap();
    assert_eq!(sg.stats().seq_files, 0);
}
