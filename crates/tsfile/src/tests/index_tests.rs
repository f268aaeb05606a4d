use crate::format::IndexNodeKind;
use crate::index::{self, BranchEntry, MeasurementEntry};
use std::io::Cursor;

fn branch(name: &str, offset: u64, kind: IndexNodeKind) -> BranchEntry {
    BranchEntry {
        name: name.to_string(),
        offset,
        kind,
    }
}

#[test]
fn wrap_pointers_omits_layer_for_single_entry() {
    let mut buf = Cursor::new(Vec::new());
    let single = vec![branch("root.d0", 42, IndexNodeKind::LeafMeasurement)];
    let (offset, kind) = index::wrap_pointers(&mut buf, single, IndexNodeKind::InternalDevice, 4).unwrap();
    assert_eq!(offset, 42);
    assert_eq!(kind, IndexNodeKind::LeafMeasurement);
    assert!(buf.into_inner().is_empty(), "no node should be written for a single pointer");
}

#[test]
fn build_layer_stays_flat_within_max_degree() {
    let mut buf = Cursor::new(Vec::new());
    let entries = vec![
        branch("root.d0", 10, IndexNodeKind::LeafMeasurement),
        branch("root.d1", 20, IndexNodeKind::LeafMeasurement),
    ];
    let (_offset, kind) =
        index::build_layer(&mut buf, entries, IndexNodeKind::LeafDevice, IndexNodeKind::InternalDevice, 4).unwrap();
    assert_eq!(kind, IndexNodeKind::LeafDevice);
}

#[test]
fn build_layer_wraps_with_internal_nodes_when_over_degree() {
    let mut buf = Cursor::new(Vec::new());
    let entries: Vec<BranchEntry> = (0..10)
        .map(|i| branch(&format!("root.d{i:02}"), i as u64, IndexNodeKind::LeafMeasurement))
        .collect();
    let (offset, kind) =
        index::build_layer(&mut buf, entries, IndexNodeKind::LeafDevice, IndexNodeKind::InternalDevice, 2).unwrap();
    assert_eq!(kind, IndexNodeKind::InternalDevice);

    let device = index::find_device(&mut buf, offset, kind, "root.d07").unwrap().unwrap();
    assert_eq!(device.offset, 7);
}

#[test]
fn find_device_returns_none_for_absent_device() {
    let mut buf = Cursor::new(Vec::new());
    let entries = vec![
        branch("root.d0", 10, IndexNodeKind::LeafMeasurement),
        branch("root.d1", 20, IndexNodeKind::LeafMeasurement),
    ];
    let (offset, kind) =
        index::build_layer(&mut buf, entries, IndexNodeKind::LeafDevice, IndexNodeKind::InternalDevice, 4).unwrap();

    assert!(index::find_device(&mut buf, offset, kind, "root.zzz").unwrap().is_none());
}

#[test]
fn measurement_tree_round_trips_and_finds_by_name() {
    let mut buf = Cursor::new(Vec::new());
    let entries: Vec<MeasurementEntry> = (0..6)
        .map(|i| MeasurementEntry {
            name: format!("m{i}"),
            data_type: 1,
            chunk_list_offset: i as u64 * 100,
            chunk_list_len: 1,
            start_time: i as i64,
            end_time: i as i64,
        })
        .collect();

    let (offset, kind) = index::build_measurement_tree(&mut buf, entries, 2).unwrap();
    assert_eq!(kind, IndexNodeKind::InternalMeasurement);

    let found = index::find_measurement(&mut buf, offset, kind, "m4").unwrap().unwrap();
    assert_eq!(found.chunk_list_offset, 400);

    assert!(index::find_measurement(&mut buf, offset, kind, "m99").unwrap().is_none());

    let all = index::collect_all_measurements(&mut buf, offset, kind).unwrap();
    assert_eq!(all.len(), 6);
    assert!(all.windows(2).all(|w| w[0].name < w[1].name));
}

#[test]
fn bulk_read_threshold_matches_formula() {
    // max_degree=8: threshold = 8/ln(8) ~= 3.85
    assert!(!index::bulk_read_is_cheaper(3, 8));
    assert!(index::bulk_read_is_cheaper(4, 8));
}

#[test]
fn bulk_read_threshold_degenerate_degree_is_never_cheaper() {
    assert!(!index::bulk_read_is_cheaper(100, 1));
    assert!(!index::bulk_read_is_cheaper(100, 0));
}
