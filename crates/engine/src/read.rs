//! Read path: assembles a [`QueryDataSource`] snapshot over every seq and
//! unseq source that might hold a device's series, then merges them with
//! newer-wins semantics and `.mods` tombstone filtering.

use crate::{FileProcessor, PartitionState, StorageGroupProcessor};
use anyhow::Result;
use memtable::DataValue;
use metacache::{CacheKey, MetadataCache};
use resource::{FileResource, ModificationFile};
use std::sync::Arc;
use tsfile::{merge_samples, SampleSource, TsFileReader};

/// One file contributing samples to a query. `processor` is `Some` while
/// the file is still unsealed (or mid-flush), in which case its memtable
/// snapshot is read instead of the (not yet fully written) on-disk data.
pub struct SeriesSource {
    pub resource: Arc<FileResource>,
    pub processor: Option<Arc<FileProcessor>>,
}

impl SeriesSource {
    fn read_samples(&self, device: &str, measurement: &str, cache: &MetadataCache) -> Result<(u64, Vec<(i64, DataValue)>)> {
        // Held for the duration of this one source's read, not the whole
        // query: a flush-seal or merge-swap on this file blocks until the
        // read finishes, and is blocked from starting while it's in flight.
        let _guard = self.resource.read_lock();

        let version = self.resource.historical_versions().iter().copied().max().unwrap_or(0);

        if !self.resource.is_closed() {
            let samples = self.processor.as_ref().map(|p| p.query(device, measurement)).unwrap_or_default();
            return Ok((version, samples));
        }

        let reader = TsFileReader::open(self.resource.path())?;
        let key = CacheKey::new(self.resource.path(), device, measurement);

        let metas = if let Some(hit) = cache.get(&key) {
            hit
        } else if !reader.may_contain(device, measurement) {
            Vec::new()
        } else {
            let metas = reader.chunk_metadata(device, measurement)?;
            cache.insert(key, metas.clone());
            metas
        };

        let mut samples = Vec::new();
        for meta in &metas {
            samples.extend(reader.read_chunk(meta)?);
        }
        samples.sort_by_key(|(t, _)| *t);
        Ok((version, samples))
    }
}

/// A query's full set of sources: sequence files in version order, then
/// unsequence files (no particular order required of them).
pub struct QueryDataSource {
    pub device: String,
    pub measurement: String,
    pub seq: Vec<SeriesSource>,
    pub unseq: Vec<SeriesSource>,
}

impl QueryDataSource {
    /// Reads every source and merges them into one ascending, tombstone-
    /// filtered stream of samples.
    pub fn collect(&self, cache: &MetadataCache) -> Result<Vec<(i64, DataValue)>> {
        let mut sources = Vec::new();
        let mut mods = Vec::new();

        for s in self.seq.iter().chain(self.unseq.iter()) {
            let (version, samples) = s.read_samples(&self.device, &self.measurement, cache)?;
            if !samples.is_empty() {
                sources.push(SampleSource::new(version, samples));
            }
            mods.push(ModificationFile::open(s.resource.path())?);
        }

        let series_path = format!("{}.{}", self.device, self.measurement);
        let is_deleted = move |timestamp: i64, version: u64| mods.iter().any(|m| m.is_deleted(&series_path, timestamp, version));

        Ok(merge_samples(sources, is_deleted))
    }
}

impl StorageGroupProcessor {
    /// Builds the data source for one `(device, measurement)` query,
    /// snapshotting which files and in-flight processors currently hold
    /// data for it across every partition.
    pub fn query(&self, device: &str, measurement: &str) -> QueryDataSource {
        let partitions: Vec<Arc<PartitionState>> = self.partitions.read().values().cloned().collect();

        let mut seq = Vec::new();
        let mut unseq = Vec::new();

        for part in &partitions {
            part.reap_closed();
            collect_slot(&part.seq_active, &part.seq_closing, &part.seq_sealed, device, &mut seq);
            collect_slot(&part.unseq_active, &part.unseq_closing, &part.unseq_sealed, device, &mut unseq);
        }

        seq.sort_by_key(|s: &SeriesSource| s.resource.historical_versions().into_iter().min().unwrap_or(0));

        QueryDataSource {
            device: device.to_string(),
            measurement: measurement.to_string(),
            seq,
            unseq,
        }
    }
}

fn collect_slot(
    active: &parking_lot::RwLock<Option<Arc<FileProcessor>>>,
    closing: &parking_lot::RwLock<Vec<Arc<FileProcessor>>>,
    sealed: &parking_lot::RwLock<Vec<Arc<FileResource>>>,
    device: &str,
    out: &mut Vec<SeriesSource>,
) {
    if let Some(p) = active.read().as_ref() {
        if p.resource.contains_device(device) {
            out.push(SeriesSource { resource: Arc::clone(&p.resource), processor: Some(Arc::clone(p)) });
        }
    }
    for p in closing.read().iter() {
        if p.resource.contains_device(device) {
            out.push(SeriesSource { resource: Arc::clone(&p.resource), processor: Some(Arc::clone(p)) });
        }
    }
    for r in sealed.read().iter() {
        if r.contains_device(device) {
            out.push(SeriesSource { resource: Arc::clone(r), processor: None });
        }
    }
}
