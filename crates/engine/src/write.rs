//! Write path: `insert`, `insert_tablet`, and `delete`.
//!
//! A write resolves its partition from the timestamp, classifies itself as
//! sequence or unsequence against that device's prior progress in the
//! partition, then routes to the active [`FileProcessor`] for that
//! `(partition, seq/unseq)` slot — creating one if none is active. Deletes
//! apply in-memory tombstones to every live memtable and append a
//! `.mods` record to every overlapping sealed file.

use crate::file_processor::FileProcessor;
use crate::{PartitionState, StorageGroupProcessor};
use anyhow::{ensure, Result};
use memtable::DataValue;
use resource::ModificationRecord;
use std::sync::Arc;

impl StorageGroupProcessor {
    /// Inserts one sample.
    pub fn insert(&self, device: &str, measurement: &str, timestamp: i64, value: DataValue) -> Result<()> {
        if self.is_closed() {
            log::warn!("rejecting write to {device}.{measurement}: storage group {} is closed to writes", self.name);
        }
        ensure!(!self.is_closed(), "storage group {} is closed to writes", self.name);

        let partition = self.partition_of(timestamp);
        let part = self.partition_state(partition);
        part.reap_closed();

        let is_seq = self.classify(&part, device, timestamp);
        let processor = self.active_processor(&part, partition, is_seq)?;
        processor.insert(device, measurement, timestamp, value)?;
        self.after_write(&part, is_seq, &processor)?;
        Ok(())
    }

    /// Inserts a tablet: several rows for one device, each row sharing a
    /// timestamp across multiple measurements. Each row is classified and
    /// routed independently since seq/unseq status can flip mid-tablet.
    pub fn insert_tablet(&self, device: &str, rows: &[(i64, Vec<(String, DataValue)>)]) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(rows.len());
        let mut current: Option<(i64, bool, Arc<FileProcessor>)> = None;

        for (timestamp, columns) in rows {
            let outcome = (|| -> Result<()> {
                ensure!(!self.is_closed(), "storage group {} is closed to writes", self.name);

                let partition = self.partition_of(*timestamp);
                let part = self.partition_state(partition);
                part.reap_closed();
                let is_seq = self.classify(&part, device, *timestamp);

                let processor = match &current {
                    Some((p, seq, proc)) if *p == partition && *seq == is_seq && !proc.is_closing_or_closed() => Arc::clone(proc),
                    _ => self.active_processor(&part, partition, is_seq)?,
                };

                processor.insert_row(device, *timestamp, columns)?;
                self.after_write(&part, is_seq, &processor)?;
                current = Some((partition, is_seq, processor));
                Ok(())
            })();
            results.push(outcome);
        }

        results
    }

    /// Appends a tombstone for `device.measurement` at or below
    /// `upper_bound`: applied immediately to every live memtable, and
    /// recorded in the `.mods` file of every sealed file whose time range
    /// could contain an affected sample.
    pub fn delete(&self, device: &str, measurement: &str, upper_bound: i64) -> Result<()> {
        let partitions: Vec<Arc<PartitionState>> = self.partitions.read().values().cloned().collect();

        for part in &partitions {
            part.reap_closed();

            for processor in live_processors(part) {
                if processor.resource.contains_device(device) {
                    processor.delete(device, measurement, upper_bound);
                }
            }

            for resource in part.seq_sealed.read().iter().chain(part.unseq_sealed.read().iter()) {
                let overlaps = resource.contains_device(device)
                    && resource.device_time_range(device).map(|(start, _)| start <= upper_bound).unwrap_or(false);
                if !overlaps {
                    continue;
                }
                let file_version = resource.historical_versions().iter().copied().max().unwrap_or(0);
                let mut mods = resource::ModificationFile::open(resource.path())?;
                mods.append(ModificationRecord {
                    series_path: format!("{device}.{measurement}"),
                    upper_bound,
                    file_version,
                })?;
            }
        }

        Ok(())
    }

    /// Async-closes every active (seq and unseq, every partition) file
    /// processor currently holding `device`, so its data becomes visible to
    /// merges and to self-check-based recovery sooner than waiting for the
    /// memtable threshold.
    pub fn close_device(&self, device: &str) -> Result<()> {
        let partitions: Vec<Arc<PartitionState>> = self.partitions.read().values().cloned().collect();
        for part in &partitions {
            part.reap_closed();
            if let Some(p) = part.seq_active.read().clone() {
                if p.resource.contains_device(device) {
                    self.close_slot(part, true, &p)?;
                }
            }
            if let Some(p) = part.unseq_active.read().clone() {
                if p.resource.contains_device(device) {
                    self.close_slot(part, false, &p)?;
                }
            }
        }
        Ok(())
    }

    fn partition_of(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.config.partition_interval_ms)
    }

    /// A write is sequence iff its timestamp is strictly greater than the
    /// largest timestamp already committed for `device` in this partition,
    /// across the active sequence processor and every sealed/closing
    /// sequence file.
    fn classify(&self, part: &PartitionState, device: &str, timestamp: i64) -> bool {
        if let Some(active) = part.seq_active.read().as_ref() {
            if let Some((_, end)) = active.resource.device_time_range(device) {
                return timestamp > end;
            }
        }

        let sealed_end = part.seq_sealed.read().iter().filter_map(|r| r.device_time_range(device).map(|(_, e)| e)).max();
        let closing_end = part
            .seq_closing
            .read()
            .iter()
            .filter_map(|p| p.resource.device_time_range(device).map(|(_, e)| e))
            .max();

        match [sealed_end, closing_end].into_iter().flatten().max() {
            Some(end) => timestamp > end,
            None => true,
        }
    }

    /// Returns the active processor for `(partition, is_seq)`, creating one
    /// if none exists or the current one has started closing.
    fn active_processor(&self, part: &PartitionState, partition: i64, is_seq: bool) -> Result<Arc<FileProcessor>> {
        let slot = if is_seq { &part.seq_active } else { &part.unseq_active };

        {
            let guard = slot.read();
            if let Some(p) = guard.as_ref() {
                if !p.is_closing_or_closed() {
                    return Ok(Arc::clone(p));
                }
            }
        }

        let mut guard = slot.write();
        if let Some(p) = guard.as_ref() {
            if !p.is_closing_or_closed() {
                return Ok(Arc::clone(p));
            }
        }

        let version = self.next_version(partition);
        let kind = if is_seq { "seq" } else { "unseq" };
        let dir = self.dir.join(partition.to_string());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{kind}-{version}.tsfile"));

        let processor = Arc::new(FileProcessor::create(path, partition, version, is_seq, Arc::clone(&self.config))?);
        *guard = Some(Arc::clone(&processor));
        Ok(processor)
    }

    /// After a write: closes the slot if the memtable crossed its size
    /// threshold, and enforces `unseq_files_per_partition_max` by closing
    /// the active unsequence processor once the partition's unsequence
    /// file count would otherwise exceed the ceiling.
    fn after_write(&self, part: &PartitionState, is_seq: bool, processor: &Arc<FileProcessor>) -> Result<()> {
        if processor.approx_size() >= self.config.memtable_size_threshold {
            self.close_slot(part, is_seq, processor)?;
        }

        if !is_seq && self.unseq_file_count(part) > self.config.unseq_files_per_partition_max {
            if let Some(active) = part.unseq_active.read().clone() {
                log::debug!(
                    "unseq file ceiling ({}) reached in partition {}, forcing close",
                    self.config.unseq_files_per_partition_max,
                    part.partition
                );
                self.close_slot(part, false, &active)?;
            }
        }

        Ok(())
    }

    fn close_slot(&self, part: &PartitionState, is_seq: bool, processor: &Arc<FileProcessor>) -> Result<()> {
        processor.async_close(&self.flush_pool)?;

        let slot = if is_seq { &part.seq_active } else { &part.unseq_active };
        {
            let mut guard = slot.write();
            if guard.as_ref().map(|p| Arc::ptr_eq(p, processor)).unwrap_or(false) {
                *guard = None;
            }
        }

        let closing = if is_seq { &part.seq_closing } else { &part.unseq_closing };
        closing.write().push(Arc::clone(processor));
        Ok(())
    }
}

fn live_processors(part: &PartitionState) -> Vec<Arc<FileProcessor>> {
    let mut out = Vec::new();
    if let Some(p) = part.seq_active.read().clone() {
        out.push(p);
    }
    if let Some(p) = part.unseq_active.read().clone() {
        out.push(p);
    }
    out.extend(part.seq_closing.read().iter().cloned());
    out.extend(part.unseq_closing.read().iter().cloned());
    out
}
