//! Owns exactly one memtable for one unsealed time-series file.
//!
//! A file processor is born when the storage-group processor routes the
//! first write to a fresh `(partition, seq/unseq)` slot and dies once its
//! single memtable has flushed and the backing file is sealed — there is no
//! "reopen for more writes" path; a later write to the same slot creates a
//! new file processor with a new version.

use crate::flush_pool::FlushPool;
use anyhow::{Context, Result};
use config::StorageGroupConfig;
use memtable::{DataValue, Memtable};
use parking_lot::Mutex;
use resource::{FileResource, ModificationFile};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use tsfile::TsFileWriter;

pub struct FileProcessor {
    pub resource: Arc<FileResource>,
    pub is_seq: bool,
    version: u64,
    memtable: Mutex<Memtable>,
    flushing: Mutex<Option<Memtable>>,
    mods: Mutex<ModificationFile>,
    config: Arc<StorageGroupConfig>,
    closing: AtomicBool,
    close_rx: Mutex<Option<Receiver<Result<()>>>>,
}

impl FileProcessor {
    pub fn create(path: PathBuf, partition: i64, version: u64, is_seq: bool, config: Arc<StorageGroupConfig>) -> Result<Self> {
        let resource = Arc::new(FileResource::new_unsealed(path.clone(), partition, version));
        let mods = ModificationFile::open(&path)?;
        Ok(Self {
            resource,
            is_seq,
            version,
            memtable: Mutex::new(Memtable::new()),
            flushing: Mutex::new(None),
            mods: Mutex::new(mods),
            config,
            closing: AtomicBool::new(false),
            close_rx: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn is_closing_or_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.resource.is_closed()
    }

    /// Inserts one sample. Sequence files reject any timestamp not strictly
    /// greater than the device's current maximum — the storage-group
    /// processor is responsible for routing out-of-order writes to an
    /// unsequence processor instead of calling this with one.
    pub fn insert(&self, device: &str, measurement: &str, timestamp: i64, value: DataValue) -> Result<()> {
        anyhow::ensure!(!self.resource.is_closed(), "file processor for {} is already sealed", self.resource.path().display());
        {
            let mut mem = self.memtable.lock();
            if self.is_seq {
                if let Some(max) = mem.max_timestamp(device) {
                    anyhow::ensure!(
                        timestamp > max,
                        "out-of-order write to sequence file for device {device}: {timestamp} <= {max}"
                    );
                }
            }
            mem.put(device, measurement, timestamp, value);
        }
        self.resource.update_start_time(device, timestamp);
        self.resource.update_end_time(device, timestamp);
        Ok(())
    }

    /// Inserts one tablet row (several measurements sharing a timestamp).
    pub fn insert_row(&self, device: &str, timestamp: i64, columns: &[(String, DataValue)]) -> Result<()> {
        anyhow::ensure!(!self.resource.is_closed(), "file processor for {} is already sealed", self.resource.path().display());
        {
            let mut mem = self.memtable.lock();
            if self.is_seq {
                if let Some(max) = mem.max_timestamp(device) {
                    anyhow::ensure!(
                        timestamp > max,
                        "out-of-order tablet row to sequence file for device {device}: {timestamp} <= {max}"
                    );
                }
            }
            mem.put_row(device, timestamp, columns);
        }
        self.resource.update_start_time(device, timestamp);
        self.resource.update_end_time(device, timestamp);
        Ok(())
    }

    /// Returns `(memtable snapshot, visible chunk metadata)` for this
    /// unsealed file. Since the file has no flushed chunk groups until it
    /// seals, the chunk-metadata half is always empty here; the caller
    /// pairs this with the on-disk data once `resource.is_closed()`.
    #[must_use]
    pub fn query(&self, device: &str, measurement: &str) -> Vec<(i64, DataValue)> {
        let mut out = if let Some(flushing) = self.flushing.lock().as_ref() {
            flushing.query(device, measurement)
        } else {
            Vec::new()
        };
        out.extend(self.memtable.lock().query(device, measurement));
        out.sort_by_key(|(t, _)| *t);
        out
    }

    /// Applies an in-memory tombstone to whichever memtable(s) are live.
    /// During the flush transition both the frozen `flushing` memtable and
    /// the fresh active one may need it, since a concurrent reader of the
    /// flushing memtable must also stop seeing the deleted samples.
    pub fn delete(&self, device: &str, measurement: &str, upper_bound: i64) {
        self.memtable.lock().delete(device, measurement, upper_bound);
        if let Some(flushing) = self.flushing.lock().as_mut() {
            flushing.delete(device, measurement, upper_bound);
        }
    }

    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.memtable.lock().approx_size()
    }

    pub fn mods(&self) -> &Mutex<ModificationFile> {
        &self.mods
    }

    /// Schedules the flush-then-seal protocol on `pool` and returns without
    /// waiting for it to finish.
    pub fn async_close(self: &Arc<Self>, pool: &FlushPool) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let this = Arc::clone(self);
        let rx = pool.submit(move || this.flush_and_seal());
        *self.close_rx.lock() = Some(rx);
        Ok(())
    }

    /// Schedules (if not already scheduled) the flush-then-seal protocol and
    /// blocks until it completes.
    pub fn sync_close(self: &Arc<Self>, pool: &FlushPool) -> Result<()> {
        self.async_close(pool)?;
        let rx = self.close_rx.lock().take();
        match rx {
            Some(rx) => rx.recv().context("flush pool worker dropped without a result")?,
            None => Ok(()),
        }
    }

    /// The flush protocol: swap memtable to flushing, write one chunk group
    /// per device, finalize the metadata-index tree and tail, fsync,
    /// persist the `.resource` side-car, then mark sealed.
    fn flush_and_seal(&self) -> Result<()> {
        log::debug!(
            "flushing {} (partition {}, version {})",
            self.resource.path().display(),
            self.resource.partition(),
            self.version
        );
        let flushing = {
            let mut mem = self.memtable.lock();
            std::mem::replace(&mut *mem, Memtable::new())
        };
        *self.flushing.lock() = Some(flushing);

        let path = self.resource.path().to_path_buf();
        let closing_flag = self.resource.closing_flag_path();
        std::fs::write(&closing_flag, b"")?;

        let devices: Vec<String> = {
            let guard = self.flushing.lock();
            guard.as_ref().unwrap().devices().map(str::to_string).collect()
        };

        // Held across the finalize-then-serialize sequence below: a query
        // reading this file must see either the pre-flush (unsealed, via the
        // frozen `flushing` memtable) or post-flush (sealed, on disk) state,
        // never a data file that has been renamed into place with no
        // side-car describing it yet.
        let _guard = self.resource.write_lock();

        if !devices.is_empty() {
            let expected_series = devices.len() * 4;
            let mut writer = TsFileWriter::create(&path, expected_series, self.config.max_degree_of_index_node)?;

            for device in &devices {
                let mut columns: BTreeMap<String, Vec<(i64, DataValue)>> = BTreeMap::new();
                let measurements: Vec<String> = {
                    let guard = self.flushing.lock();
                    guard.as_ref().unwrap().measurements(device).into_iter().map(str::to_string).collect()
                };
                for measurement in &measurements {
                    let samples = {
                        let guard = self.flushing.lock();
                        guard.as_ref().unwrap().query(device, measurement)
                    };
                    if !samples.is_empty() {
                        columns.insert(measurement.clone(), samples);
                    }
                }
                if !columns.is_empty() {
                    writer.write_chunk_group(device, &columns, self.version)?;
                }
            }

            writer.finalize()?;
        }

        self.resource.serialize()?;
        self.resource.mark_closed();
        *self.flushing.lock() = None;
        let _ = std::fs::remove_file(&closing_flag);
        log::debug!("sealed {}", self.resource.path().display());
        Ok(())
    }
}
