use super::helpers::small_config;
use crate::StorageGroupProcessor;
use anyhow::Result;
use memtable::DataValue;
use tempfile::tempdir;

#[test]
fn merge_combines_seq_and_unseq_into_one_series() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    for i in 0..10i64 {
        sg.insert("root.sg.d0", "s0", i, DataValue::Int64(i))?;
    }
    sg.close_all()?;

    // Out-of-order write creates an unseq file in the same partition.
    sg.insert("root.sg.d0", "s0", 5, DataValue::Int64(500))?;
    sg.close_all()?;

    let before = sg.stats();
    assert!(before.unseq_files >= 1);

    sg.merge(false)?;

    let after = sg.stats();
    assert_eq!(after.unseq_files, 0, "merge should decommission unseq sources");

    let samples = sg.query("root.sg.d0", "s0").collect(sg.cache())?;
    let mut expected: Vec<(i64, DataValue)> = (0..10).map(|i| (i, DataValue::Int64(i))).collect();
    expected[5] = (5, DataValue::Int64(500));
    assert_eq!(samples, expected);
    Ok(())
}

#[test]
fn merge_respects_tombstones_recorded_before_merge() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    for i in 0..10i64 {
        sg.insert("root.sg.d0", "s0", i, DataValue::Int64(i))?;
    }
    sg.close_all()?;
    sg.insert("root.sg.d0", "s0", 3, DataValue::Int64(999))?;
    sg.close_all()?;

    sg.delete("root.sg.d0", "s0", 2)?;
    sg.merge(false)?;

    let samples = sg.query("root.sg.d0", "s0").collect(sg.cache())?;
    let mut expected: Vec<(i64, DataValue)> = (3..10).map(|i| (i, DataValue::Int64(i))).collect();
    expected[0] = (3, DataValue::Int64(999));
    assert_eq!(samples, expected);
    Ok(())
}

#[test]
fn full_merge_with_no_unseq_files_is_a_noop() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    for i in 0..5i64 {
        sg.insert("root.sg.d0", "s0", i, DataValue::Int64(i))?;
    }
    sg.close_all()?;

    let before = sg.stats();
    sg.merge(false)?;
    let after = sg.stats();
    assert_eq!(before.seq_files, after.seq_files, "no unseq files and no full_merge flag should leave seq files untouched");
    Ok(())
}

#[test]
fn merge_preserves_data_across_multiple_devices() -> Result<()> {
    let dir = tempdir()?;
    let sg = StorageGroupProcessor::new("sg", dir.path(), small_config())?;

    for i in 0..5i64 {
        sg.insert("root.sg.d0", "s0", i, DataValue::Int64(i))?;
        sg.insert("root.sg.d1", "s0", i, DataValue::Int64(i * 10))?;
    }
    sg.close_all()?;
    sg.insert("root.sg.d0", "s0", 2, DataValue::Int64(-1))?;
    sg.close_all()?;

    sg.merge(false)?;

    let d0 = sg.query("root.sg.d0", "s0").collect(sg.cache())?;
    let mut expected0: Vec<(i64, DataValue)> = (0..5).map(|i| (i, DataValue::Int64(i))).collect();
    expected0[2] = (2, DataValue::Int64(-1));
    assert_eq!(d0, expected0);

    let d1 = sg.query("root.sg.d1", "s0").collect(sg.cache())?;
    let expected1: Vec<(i64, DataValue)> = (0..5).map(|i| (i, DataValue::Int64(i * 10))).collect();
    assert_eq!(d1, expected1);
    Ok(())
}
