use super::helpers::small_config;
use crate::StorageGroupProcessor;
use anyhow::Result;
use memtable::DataValue;
use tempfile::tempdir;

#[test]
fn query_merges_memtable_and_sealed_file() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    for i in 0..10i64 {
        sg.insert("root.sg.d0", "s0", i, DataValue::Int64(i))?;
    }
    sg.close_all()?;
    // More writes land in a fresh active processor after the seal.
    for i in 10..15i64 {
        sg.insert("root.sg.d0", "s0", i, DataValue::Int64(i))?;
    }

    let samples = sg.query("root.sg.d0", "s0").collect(sg.cache())?;
    let expected: Vec<(i64, DataValue)> = (0..15).map(|i| (i, DataValue::Int64(i))).collect();
    assert_eq!(samples, expected);
    Ok(())
}

#[test]
fn query_unknown_series_is_empty() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    sg.insert("root.sg.d0", "s0", 1, DataValue::Int64(1))?;
    let samples = sg.query("root.sg.d0", "nope").collect(sg.cache())?;
    assert!(samples.is_empty());
    Ok(())
}

#[test]
fn query_respects_tombstone_against_sealed_file() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    for i in 0..10i64 {
        sg.insert("root.sg.d0", "s0", i, DataValue::Int64(i))?;
    }
    sg.close_all()?;

    sg.delete("root.sg.d0", "s0", 4)?;

    let samples = sg.query("root.sg.d0", "s0").collect(sg.cache())?;
    let expected: Vec<(i64, DataValue)> = (5..10).map(|i| (i, DataValue::Int64(i))).collect();
    assert_eq!(samples, expected);
    Ok(())
}

#[test]
fn query_prefers_unseq_overwrite_at_same_timestamp() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    sg.insert("root.sg.d0", "s0", 10, DataValue::Int64(1))?;
    sg.close_all()?;

    // Same timestamp, written later as an unseq correction.
    sg.insert("root.sg.d0", "s0", 10, DataValue::Int64(2))?;
    sg.close_all()?;

    let samples = sg.query("root.sg.d0", "s0").collect(sg.cache())?;
    assert_eq!(samples, vec![(10, DataValue::Int64(2))]);
    Ok(())
}

#[test]
fn query_spans_multiple_partitions() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    // partition_interval_ms is 1000 in small_config, so these land in
    // different partitions.
    sg.insert("root.sg.d0", "s0", 100, DataValue::Int64(1))?;
    sg.insert("root.sg.d0", "s0", 1500, DataValue::Int64(2))?;
    sg.insert("root.sg.d0", "s0", 2700, DataValue::Int64(3))?;
    sg.close_all()?;

    let samples = sg.query("root.sg.d0", "s0").collect(sg.cache())?;
    assert_eq!(samples, vec![(100, DataValue::Int64(1)), (1500, DataValue::Int64(2)), (2700, DataValue::Int64(3))]);
    Ok(())
}
