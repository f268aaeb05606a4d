use super::*;

// -------------------- Basic CRUD --------------------

#[test]
fn put_and_query_single_sample() {
    let mut m = Memtable::new();
    m.put("root.sg.d0", "s0", 10, DataValue::Int64(42));
    assert_eq!(m.query("root.sg.d0", "s0"), vec![(10, DataValue::Int64(42))]);
}

#[test]
fn put_overwrites_same_timestamp() {
    let mut m = Memtable::new();
    m.put("root.sg.d0", "s0", 10, DataValue::Int64(1));
    m.put("root.sg.d0", "s0", 10, DataValue::Int64(2));
    assert_eq!(m.query("root.sg.d0", "s0"), vec![(10, DataValue::Int64(2))]);
    assert_eq!(m.len(), 1);
}

#[test]
fn query_missing_series_is_empty() {
    let m = Memtable::new();
    assert!(m.query("root.sg.d0", "s0").is_empty());
}

#[test]
fn query_returns_ascending_timestamp_order() {
    let mut m = Memtable::new();
    m.put("root.sg.d0", "s0", 30, DataValue::Int32(3));
    m.put("root.sg.d0", "s0", 10, DataValue::Int32(1));
    m.put("root.sg.d0", "s0", 20, DataValue::Int32(2));

    let got: Vec<i64> = m.query("root.sg.d0", "s0").into_iter().map(|(t, _)| t).collect();
    assert_eq!(got, vec![10, 20, 30]);
}

// -------------------- Tombstones --------------------

#[test]
fn delete_hides_samples_at_or_below_upper_bound() {
    let mut m = Memtable::new();
    for t in 11..=20 {
        m.put("root.v.d0", "s0", t, DataValue::Int64(t));
    }
    m.delete("root.v.d0", "s0", 15);

    let got: Vec<i64> = m.query("root.v.d0", "s0").into_iter().map(|(t, _)| t).collect();
    assert_eq!(got, vec![16, 17, 18, 19, 20]);
}

#[test]
fn delete_only_affects_named_measurement() {
    let mut m = Memtable::new();
    m.put("root.v.d0", "s0", 5, DataValue::Int64(1));
    m.put("root.v.d0", "s1", 5, DataValue::Int64(2));
    m.delete("root.v.d0", "s0", 10);

    assert!(m.query("root.v.d0", "s0").is_empty());
    assert_eq!(m.query("root.v.d0", "s1"), vec![(5, DataValue::Int64(2))]);
}

#[test]
fn delete_does_not_remove_underlying_samples() {
    // Deletion is a tombstone span, not a physical purge -- len() still
    // counts the (logically hidden) sample until a merge rewrites the data.
    let mut m = Memtable::new();
    m.put("root.v.d0", "s0", 1, DataValue::Int64(1));
    m.delete("root.v.d0", "s0", 100);
    assert_eq!(m.len(), 1);
    assert!(m.query("root.v.d0", "s0").is_empty());
}

// -------------------- Device time range / seq classification --------------------

#[test]
fn max_timestamp_tracks_device_across_measurements() {
    let mut m = Memtable::new();
    m.put("root.v.d0", "s0", 5, DataValue::Int32(1));
    m.put("root.v.d0", "s1", 9, DataValue::Int32(2));
    assert_eq!(m.max_timestamp("root.v.d0"), Some(9));
}

#[test]
fn device_time_range_tracks_min_and_max() {
    let mut m = Memtable::new();
    m.put("root.v.d0", "s0", 5, DataValue::Int32(1));
    m.put("root.v.d0", "s0", 2, DataValue::Int32(1));
    m.put("root.v.d0", "s0", 9, DataValue::Int32(1));
    assert_eq!(m.device_time_range("root.v.d0"), Some((2, 9)));
}

#[test]
fn max_timestamp_absent_for_unseen_device() {
    let m = Memtable::new();
    assert_eq!(m.max_timestamp("root.v.d9"), None);
}

// -------------------- Tablet writes --------------------

#[test]
fn put_row_writes_all_columns_at_one_timestamp() {
    let mut m = Memtable::new();
    let columns = vec![
        ("s0".to_string(), DataValue::Int32(1)),
        ("s1".to_string(), DataValue::Int64(2)),
    ];
    m.put_row("root.v.d0", 7, &columns);

    assert_eq!(m.query("root.v.d0", "s0"), vec![(7, DataValue::Int32(1))]);
    assert_eq!(m.query("root.v.d0", "s1"), vec![(7, DataValue::Int64(2))]);
}

// -------------------- Load tests --------------------

#[test]
fn write_load_10k_unique_timestamps() {
    let mut m = Memtable::new();
    for t in 0..10_000i64 {
        m.put("root.v.d0", "s0", t, DataValue::Double(t as f64));
    }
    assert_eq!(m.len(), 10_000);
}

// -------------------- Size accounting --------------------

#[test]
fn approx_size_grows_and_resets() {
    let mut m = Memtable::new();
    assert_eq!(m.approx_size(), 0);
    m.put("root.v.d0", "s0", 1, DataValue::Int64(1));
    assert!(m.approx_size() > 0);
    m.clear();
    assert_eq!(m.approx_size(), 0);
    assert!(m.is_empty());
}

#[test]
fn clear_resets_assigned_version() {
    let mut m = Memtable::new();
    m.assign_version(7);
    assert_eq!(m.assigned_version(), Some(7));
    m.clear();
    assert_eq!(m.assigned_version(), None);
}

// -------------------- Multi-device / multi-measurement listing --------------------

#[test]
fn devices_and_measurements_are_sorted() {
    let mut m = Memtable::new();
    m.put("root.v.d1", "s0", 1, DataValue::Bool(true));
    m.put("root.v.d0", "s1", 1, DataValue::Bool(true));
    m.put("root.v.d0", "s0", 1, DataValue::Bool(true));

    let devices: Vec<&str> = m.devices().collect();
    assert_eq!(devices, vec!["root.v.d0", "root.v.d1"]);

    let measurements = m.measurements("root.v.d0");
    assert_eq!(measurements, vec!["s0", "s1"]);
}
