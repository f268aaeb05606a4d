//! # Memtable
//!
//! An in-memory, sorted, mutable write buffer for one unsealed time-series
//! file in the storage-group engine.
//!
//! Unlike a flat key-value memtable, a time-series memtable is keyed by
//! `(device, measurement, timestamp)`. Every insert targets exactly one
//! `(partition, seq/unseq)` slot's memtable, so there is never more than one
//! writer racing on a given key — a later `put` for the same
//! `(device, measurement, timestamp)` simply overwrites the earlier one
//! in-place (no sequence number is needed to arbitrate, unlike a general KV
//! store where unrelated writers can race).
//!
//! ## Key properties
//! - **Per-series sorted order**: each `(device, measurement)` series is a
//!   `BTreeMap<i64, DataValue>`, always in ascending timestamp order
//!   (required for chunk flush).
//! - **Per-device time range**: tracks the min/max timestamp seen for each
//!   device, used by the storage-group processor to classify sequence vs.
//!   out-of-sequence writes and to update the file-resource side-car.
//! - **In-memory tombstones**: a `delete` does not scan and remove points.
//!   It records a `(measurement, upper_bound)` span; reads filter points
//!   whose timestamp falls under any matching span. This lets a delete
//!   against a large unsealed memtable be O(1).
//! - **Approximate size tracking**: tracks the byte size of keys + values for
//!   flush threshold decisions.
//!
//! ## Example
//! ```rust
//! use memtable::{DataValue, Memtable};
//!
//! let mut m = Memtable::new();
//! m.put("root.sg.d0", "s0", 1, DataValue::Int64(100));
//! assert_eq!(m.query("root.sg.d0", "s0"), vec![(1, DataValue::Int64(100))]);
//!
//! m.delete("root.sg.d0", "s0", 1);
//! assert!(m.query("root.sg.d0", "s0").is_empty());
//! ```

use std::collections::BTreeMap;

/// A typed sample value. One measurement's column always holds a single
/// variant across a file, but the memtable itself is variant-agnostic so the
/// same buffer can back columns of differing declared types during testing.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Text(String),
}

impl DataValue {
    /// Approximate serialized size in bytes, used for flush-threshold
    /// accounting. Matches the on-disk encoding closely enough to keep the
    /// threshold meaningful without requiring an actual encode pass.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        match self {
            DataValue::Int32(_) => 4,
            DataValue::Int64(_) => 8,
            DataValue::Float(_) => 4,
            DataValue::Double(_) => 8,
            DataValue::Bool(_) => 1,
            DataValue::Text(s) => 4 + s.len(),
        }
    }

    /// A one-byte tag identifying this value's type, used by the on-disk
    /// chunk encoding in the `tsfile` crate.
    #[must_use]
    pub fn type_tag(&self) -> u8 {
        match self {
            DataValue::Int32(_) => 0,
            DataValue::Int64(_) => 1,
            DataValue::Float(_) => 2,
            DataValue::Double(_) => 3,
            DataValue::Bool(_) => 4,
            DataValue::Text(_) => 5,
        }
    }
}

/// A tombstone span recorded against one measurement of one device: samples
/// with `timestamp <= upper_bound` are hidden from reads of this memtable.
///
/// Spans are append-only and never merged; at most a handful accumulate per
/// series before the memtable is flushed, so a linear scan at read time is
/// cheap and avoids the complexity of interval-merging on the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Deletion {
    measurement: String,
    upper_bound: i64,
}

#[derive(Debug, Default)]
struct DeviceData {
    series: BTreeMap<String, BTreeMap<i64, DataValue>>,
    start_time: Option<i64>,
    end_time: Option<i64>,
    deletions: Vec<Deletion>,
}

/// An ordered, in-memory write buffer for one unsealed file, keyed by
/// `(device, measurement, timestamp)`.
///
/// The memtable tracks an approximate byte size so the file processor can
/// decide when to flush, and a per-device `[start_time, end_time]` so the
/// storage-group processor can classify later writes as sequence or
/// out-of-sequence and seed the flushed file's `.resource` side-car.
#[derive(Debug, Default)]
pub struct Memtable {
    devices: BTreeMap<String, DeviceData>,
    approx_size: usize,
    /// Version assigned by the storage group's version controller once this
    /// memtable is handed to the flush pipeline. `None` while still active.
    assigned_version: Option<u64>,
}

impl Memtable {
    /// Creates a new, empty memtable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts one sample for `(device, measurement)`.
    ///
    /// If a sample already exists at this exact timestamp it is replaced —
    /// within a single memtable there is only ever one writer for a given
    /// `(partition, seq/unseq)` slot, so the most recent call always wins.
    pub fn put(&mut self, device: &str, measurement: &str, timestamp: i64, value: DataValue) {
        let dev = self.devices.entry(device.to_string()).or_default();
        let series = dev.series.entry(measurement.to_string()).or_default();

        match series.insert(timestamp, value) {
            Some(old) => {
                // Same (device, measurement, timestamp) key already existed;
                // key bytes were already counted, only the value size moves.
                let new_size = series.get(&timestamp).unwrap().approx_size();
                self.approx_size = self
                    .approx_size
                    .saturating_sub(old.approx_size())
                    .saturating_add(new_size);
            }
            None => {
                let key_bytes = device.len() + measurement.len() + 8;
                let value_bytes = series.get(&timestamp).unwrap().approx_size();
                self.approx_size = self.approx_size.saturating_add(key_bytes + value_bytes);
            }
        }

        dev.start_time = Some(dev.start_time.map_or(timestamp, |t| t.min(timestamp)));
        dev.end_time = Some(dev.end_time.map_or(timestamp, |t| t.max(timestamp)));
    }

    /// Inserts a tablet: multiple measurements sharing one timestamp, for one
    /// device. Equivalent to calling [`put`](Memtable::put) once per column.
    pub fn put_row(&mut self, device: &str, timestamp: i64, columns: &[(String, DataValue)]) {
        for (measurement, value) in columns {
            self.put(device, measurement, timestamp, value.clone());
        }
    }

    /// Records a tombstone span: `(device, measurement)` samples with
    /// `timestamp <= upper_bound` are hidden from subsequent
    /// [`query`](Memtable::query) calls.
    ///
    /// This does not touch `approx_size` or remove any points — purging
    /// happens later, during merge (see the `engine` crate's merge module),
    /// when the tombstone is folded into the on-disk `.mods` record instead.
    pub fn delete(&mut self, device: &str, measurement: &str, upper_bound: i64) {
        let dev = self.devices.entry(device.to_string()).or_default();
        dev.deletions.push(Deletion {
            measurement: measurement.to_string(),
            upper_bound,
        });
    }

    /// Returns the current maximum timestamp observed for `device`, or
    /// `None` if the device has never been written in this memtable.
    ///
    /// Used by the storage-group processor to classify an incoming sample as
    /// sequence (`timestamp >= max`) or out-of-sequence.
    #[must_use]
    pub fn max_timestamp(&self, device: &str) -> Option<i64> {
        self.devices.get(device).and_then(|d| d.end_time)
    }

    /// Returns `(start_time, end_time)` for `device`, or `None` if the device
    /// has no samples in this memtable.
    #[must_use]
    pub fn device_time_range(&self, device: &str) -> Option<(i64, i64)> {
        self.devices
            .get(device)
            .and_then(|d| Some((d.start_time?, d.end_time?)))
    }

    /// Returns all live, non-deleted `(timestamp, value)` pairs for
    /// `(device, measurement)`, in ascending timestamp order.
    ///
    /// Tombstone spans recorded via [`delete`](Memtable::delete) are applied
    /// here rather than at write time.
    #[must_use]
    pub fn query(&self, device: &str, measurement: &str) -> Vec<(i64, DataValue)> {
        let Some(dev) = self.devices.get(device) else {
            return Vec::new();
        };
        let Some(series) = dev.series.get(measurement) else {
            return Vec::new();
        };

        let upper_bounds: Vec<i64> = dev
            .deletions
            .iter()
            .filter(|d| d.measurement == measurement)
            .map(|d| d.upper_bound)
            .collect();

        series
            .iter()
            .filter(|(ts, _)| !upper_bounds.iter().any(|ub| **ts <= *ub))
            .map(|(ts, v)| (*ts, v.clone()))
            .collect()
    }

    /// Returns the device names present in this memtable, in sorted order.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(|s| s.as_str())
    }

    /// Returns the measurement names present for `device`, in sorted order.
    pub fn measurements(&self, device: &str) -> Vec<&str> {
        match self.devices.get(device) {
            Some(dev) => dev.series.keys().map(|s| s.as_str()).collect(),
            None => Vec::new(),
        }
    }

    /// Returns the number of samples across all devices and measurements
    /// (tombstone spans are not counted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices
            .values()
            .map(|d| d.series.values().map(BTreeMap::len).sum::<usize>())
            .sum()
    }

    /// Returns `true` if the memtable holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the approximate byte size of all keys and values stored.
    ///
    /// Used by the file processor to decide when to flush.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.approx_size
    }

    /// Returns the version assigned to this memtable by the storage group's
    /// version controller, if it has been handed to the flush pipeline.
    #[must_use]
    pub fn assigned_version(&self) -> Option<u64> {
        self.assigned_version
    }

    /// Assigns a flush version to this memtable. Called exactly once, when
    /// the file processor swaps this memtable into the "flushing" slot.
    pub fn assign_version(&mut self, version: u64) {
        self.assigned_version = Some(version);
    }

    /// Removes all entries and tombstones, resetting the memtable to empty.
    pub fn clear(&mut self) {
        self.devices.clear();
        self.approx_size = 0;
        self.assigned_version = None;
    }
}

#[cfg(test)]
mod tests;
