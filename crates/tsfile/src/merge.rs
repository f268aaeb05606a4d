//! Merge iterator over multiple chunk sample streams.
//!
//! Produces `(timestamp, value)` pairs in ascending timestamp order. When the
//! same timestamp appears in more than one source (a seq file overwritten by
//! a later unseq flush, or two chunks straddling a partition boundary), only
//! the sample from the source with the **highest file version** wins.

use memtable::DataValue;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One input to a merge: a file version tag plus its already-decoded,
/// timestamp-ordered samples.
pub struct SampleSource {
    version: u64,
    samples: std::vec::IntoIter<(i64, DataValue)>,
}

impl SampleSource {
    pub fn new(version: u64, samples: Vec<(i64, DataValue)>) -> Self {
        Self {
            version,
            samples: samples.into_iter(),
        }
    }
}

/// A pending sample from one source, used for heap-based merge ordering.
struct HeapEntry {
    timestamp: i64,
    version: u64,
    source: usize,
    value: DataValue,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse the timestamp comparison so the
        // smallest timestamp surfaces first. On a tie, prefer the entry with
        // the lower version so popping repeatedly surfaces the *highest*
        // version last, letting the drain loop below pick the newest.
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| self.version.cmp(&other.version))
    }
}

/// Merges multiple chunk sample streams into one sorted, de-duplicated,
/// tombstone-filtered stream.
pub struct SampleMergeIterator {
    sources: Vec<SampleSource>,
    heap: BinaryHeap<HeapEntry>,
}

impl SampleMergeIterator {
    pub fn new(mut sources: Vec<SampleSource>) -> Self {
        let mut heap = BinaryHeap::new();
        for (i, source) in sources.iter_mut().enumerate() {
            if let Some((ts, value)) = source.samples.next() {
                heap.push(HeapEntry {
                    timestamp: ts,
                    version: source.version,
                    source: i,
                    value,
                });
            }
        }
        Self { sources, heap }
    }

    /// Returns the next `(timestamp, value)`, skipping samples for which
    /// `is_deleted(timestamp, chosen_version)` returns `true`.
    pub fn next_sample(&mut self, is_deleted: &impl Fn(i64, u64) -> bool) -> Option<(i64, DataValue)> {
        loop {
            let top = self.heap.pop()?;
            self.advance(top.source);

            let mut best_timestamp = top.timestamp;
            let mut best_version = top.version;
            let mut best_value = top.value;

            while let Some(peek) = self.heap.peek() {
                if peek.timestamp != best_timestamp {
                    break;
                }
                let dup = self.heap.pop().unwrap();
                self.advance(dup.source);
                if dup.version > best_version {
                    best_version = dup.version;
                    best_value = dup.value;
                }
            }

            if is_deleted(best_timestamp, best_version) {
                continue;
            }

            return Some((best_timestamp, best_value));
        }
    }

    fn advance(&mut self, source: usize) {
        if let Some((ts, value)) = self.sources[source].samples.next() {
            let version = self.sources[source].version;
            self.heap.push(HeapEntry {
                timestamp: ts,
                version,
                source,
                value,
            });
        }
    }
}

/// Merges `sources` into one sorted `Vec`, dropping samples that
/// `is_deleted` reports as tombstoned.
pub fn merge_samples(sources: Vec<SampleSource>, is_deleted: impl Fn(i64, u64) -> bool) -> Vec<(i64, DataValue)> {
    let mut iter = SampleMergeIterator::new(sources);
    let mut out = Vec::new();
    while let Some(pair) = iter.next_sample(&is_deleted) {
        out.push(pair);
    }
    out
}
