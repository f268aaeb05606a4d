use crate::{merge_samples, SampleSource};
use memtable::DataValue;

#[test]
fn merge_preserves_timestamp_order_across_sources() {
    let a = SampleSource::new(1, vec![(1, DataValue::Int64(10)), (3, DataValue::Int64(30))]);
    let b = SampleSource::new(1, vec![(2, DataValue::Int64(20)), (4, DataValue::Int64(40))]);

    let merged = merge_samples(vec![a, b], |_, _| false);
    assert_eq!(
        merged,
        vec![
            (1, DataValue::Int64(10)),
            (2, DataValue::Int64(20)),
            (3, DataValue::Int64(30)),
            (4, DataValue::Int64(40)),
        ]
    );
}

#[test]
fn merge_on_timestamp_collision_keeps_highest_version() {
    let old = SampleSource::new(1, vec![(5, DataValue::Int64(100))]);
    let new = SampleSource::new(2, vec![(5, DataValue::Int64(200))]);

    let merged = merge_samples(vec![old, new], |_, _| false);
    assert_eq!(merged, vec![(5, DataValue::Int64(200))]);
}

#[test]
fn merge_drops_tombstoned_samples() {
    let source = SampleSource::new(3, vec![(1, DataValue::Int64(1)), (2, DataValue::Int64(2)), (3, DataValue::Int64(3))]);

    // Tombstone everything up through timestamp 2 at version >= 3.
    let merged = merge_samples(vec![source], |ts, version| ts <= 2 && version >= 3);
    assert_eq!(merged, vec![(3, DataValue::Int64(3))]);
}

#[test]
fn merge_of_no_sources_is_empty() {
    let merged = merge_samples(Vec::<SampleSource>::new(), |_, _| false);
    assert!(merged.is_empty());
}

#[test]
fn merge_three_way_collision_picks_max_version() {
    let a = SampleSource::new(1, vec![(10, DataValue::Double(1.0))]);
    let b = SampleSource::new(5, vec![(10, DataValue::Double(5.0))]);
    let c = SampleSource::new(3, vec![(10, DataValue::Double(3.0))]);

    let merged = merge_samples(vec![a, b, c], |_, _| false);
    assert_eq!(merged, vec![(10, DataValue::Double(5.0))]);
}
