//! # Resource — file-resource side-car descriptor
//!
//! Every on-disk time-series file (sealed or unsealed) has a companion
//! [`FileResource`] tracking the metadata the storage-group engine needs
//! without re-opening and re-scanning the file itself: per-device time
//! bounds, the file's merge-lineage fingerprint (its historical-version
//! set), and the flags/lock that let flush, merge, and concurrent queries
//! coexist safely.
//!
//! The side-car is persisted next to the data file as `<file>.resource`
//! (see [`FileResource::serialize`]/[`FileResource::deserialize`]), and a
//! file's logical deletes live in a companion `<file>.mods`
//! ([`ModificationFile`]).
//!
//! ## `.resource` wire format
//!
//! ```text
//! startCount: i32 | (name_len: i32, name: utf8, start: i64)*
//! endCount:   i32 | (name_len: i32, name: utf8, end: i64)*
//! versionCount: i32 | (version: i64)*
//! ```
//!
//! An unsealed sequence file with an empty memtable has `endCount == 0` for
//! every device (its side-car has no end time yet).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Errors raised while reading, writing, or manipulating a file-resource
/// side-car or its modification file.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt .resource side-car: {0}")]
    Corrupt(String),
}

type Result<T> = std::result::Result<T, ResourceError>;

/// Per-device time bounds, historical-version fingerprint, and lifecycle
/// flags for one on-disk time-series file.
///
/// Holds one [`parking_lot::RwLock`] that readers acquire in shared mode
/// (for the lifetime of a query iterator) and that flush/close/merge-swap
/// acquire exclusively. The lock guards visibility of the underlying data
/// file, not the fields of this struct itself (those use atomics /
/// interior mutability appropriate to single-field updates).
pub struct FileResource {
    path: PathBuf,
    partition: i64,
    device_start: RwLock<BTreeMap<String, i64>>,
    device_end: RwLock<BTreeMap<String, i64>>,
    historical_versions: RwLock<BTreeSet<u64>>,
    closed: AtomicBool,
    deleted: AtomicBool,
    merging: AtomicBool,
    /// Read/write lock taken by queries (shared) and by flush-seal,
    /// close, and merge-swap (exclusive).
    query_lock: RwLock<()>,
}

impl FileResource {
    /// Creates a fresh, unsealed resource for a file about to be written,
    /// owning the singleton historical-version set `{ version }` (a freshly
    /// flushed file's lineage fingerprint is itself).
    pub fn new_unsealed<P: Into<PathBuf>>(path: P, partition: i64, version: u64) -> Self {
        let mut versions = BTreeSet::new();
        versions.insert(version);
        Self {
            path: path.into(),
            partition,
            device_start: RwLock::new(BTreeMap::new()),
            device_end: RwLock::new(BTreeMap::new()),
            historical_versions: RwLock::new(versions),
            closed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            query_lock: RwLock::new(()),
        }
    }

    /// Path to the data file this resource describes (not the `.resource`
    /// side-car itself — see [`Self::resource_path`]).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path to the `.resource` side-car file.
    #[must_use]
    pub fn resource_path(&self) -> PathBuf {
        append_ext(&self.path, "resource")
    }

    /// Path to the `.mods` modification file.
    #[must_use]
    pub fn mods_path(&self) -> PathBuf {
        append_ext(&self.path, "mods")
    }

    /// Path to the `.closing` zero-byte flag file present during the
    /// flush-to-seal transition.
    #[must_use]
    pub fn closing_flag_path(&self) -> PathBuf {
        append_ext(&self.path, "closing")
    }

    /// The time partition this file belongs to.
    #[must_use]
    pub fn partition(&self) -> i64 {
        self.partition
    }

    /// Raises `device`'s recorded start time only if `start` is lower than
    /// the current value (or if `device` has not been seen yet). Monotone:
    /// never moves the start time later.
    pub fn update_start_time(&self, device: &str, start: i64) {
        let mut map = self.device_start.write();
        map.entry(device.to_string())
            .and_modify(|t| *t = (*t).min(start))
            .or_insert(start);
    }

    /// Raises `device`'s recorded end time only if `end` is greater than the
    /// current value (or if `device` has not been seen yet). Monotone: never
    /// moves the end time earlier.
    pub fn update_end_time(&self, device: &str, end: i64) {
        let mut map = self.device_end.write();
        map.entry(device.to_string())
            .and_modify(|t| *t = (*t).max(end))
            .or_insert(end);
    }

    /// Returns `true` if `device` has any recorded time range in this file.
    #[must_use]
    pub fn contains_device(&self, device: &str) -> bool {
        self.device_start.read().contains_key(device)
    }

    /// Returns `(start, end)` for `device`, if recorded.
    #[must_use]
    pub fn device_time_range(&self, device: &str) -> Option<(i64, i64)> {
        let start = *self.device_start.read().get(device)?;
        let end = *self.device_end.read().get(device)?;
        Some((start, end))
    }

    /// All device names with a recorded time range in this file, sorted.
    ///
    /// Used by the merge engine to enumerate the devices it must read out of
    /// a source file without re-opening and scanning the data file itself.
    #[must_use]
    pub fn devices(&self) -> Vec<String> {
        self.device_start.read().keys().cloned().collect()
    }

    /// Returns `true` iff any device's recorded end time is `>= t`.
    ///
    /// Used by TTL and merge-candidate filtering: a file with no device
    /// still alive past `t` can be dropped or skipped.
    #[must_use]
    pub fn still_lives(&self, t: i64) -> bool {
        self.device_end.read().values().any(|end| *end >= t)
    }

    /// The set of flush versions whose data contributed to this file,
    /// directly or through merges. Two live files in the same storage group
    /// with intersecting-but-not-subset historical-version sets would be a
    /// bug: lineage sets are always disjoint or nested.
    #[must_use]
    pub fn historical_versions(&self) -> BTreeSet<u64> {
        self.historical_versions.read().clone()
    }

    /// Merges `other` into this file's historical-version set (used after a
    /// merge: the output's lineage is the union of its inputs').
    pub fn union_historical_versions(&self, other: &BTreeSet<u64>) {
        self.historical_versions.write().extend(other.iter().copied());
    }

    /// Returns `true` if this resource's lineage set is disjoint from, or a
    /// superset/subset of, `other` — i.e. a valid pairing per the
    /// merge-lineage invariant (never partially overlapping).
    #[must_use]
    pub fn lineage_compatible(&self, other: &BTreeSet<u64>) -> bool {
        let mine = self.historical_versions.read();
        let disjoint = mine.is_disjoint(other);
        let subset = mine.is_subset(other);
        let superset = mine.is_superset(other);
        disjoint || subset || superset
    }

    /// `true` once the backing file has been sealed (flush + fsync +
    /// side-car persisted).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    pub fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::Release);
    }

    /// Acquires the shared query lock. Held for the lifetime of a query's
    /// iterator over this file.
    pub fn read_lock(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.query_lock.read()
    }

    /// Acquires the exclusive lock taken by flush-seal, close, and
    /// merge-swap.
    pub fn write_lock(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.query_lock.write()
    }

    /// Size in bytes of the backing data file, or 0 if it does not exist
    /// yet (e.g. an unsealed file with an empty memtable).
    #[must_use]
    pub fn file_size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Deletes the data file, `.resource`, and `.mods` files. Used when a
    /// file is TTL-dropped or consumed by a SQUEEZE merge.
    pub fn remove(&self) -> Result<()> {
        for p in [
            self.path.clone(),
            self.resource_path(),
            self.mods_path(),
            self.closing_flag_path(),
        ] {
            if p.exists() {
                fs::remove_file(&p)?;
            }
        }
        Ok(())
    }

    /// Persists the side-car to `<path>.resource` via write-temp-then-rename
    /// (the same atomic-publish pattern the engine uses for every other
    /// durable artifact).
    pub fn serialize(&self) -> Result<()> {
        let tmp = append_ext(&self.resource_path(), "temp");
        {
            let f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut w = BufWriter::new(f);

            let starts = self.device_start.read();
            w.write_i32::<LittleEndian>(starts.len() as i32)?;
            for (name, t) in starts.iter() {
                write_str(&mut w, name)?;
                w.write_i64::<LittleEndian>(*t)?;
            }
            drop(starts);

            let ends = self.device_end.read();
            w.write_i32::<LittleEndian>(ends.len() as i32)?;
            for (name, t) in ends.iter() {
                write_str(&mut w, name)?;
                w.write_i64::<LittleEndian>(*t)?;
            }
            drop(ends);

            let versions = self.historical_versions.read();
            w.write_i32::<LittleEndian>(versions.len() as i32)?;
            for v in versions.iter() {
                w.write_i64::<LittleEndian>(*v as i64)?;
            }

            w.flush()?;
            w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&tmp, self.resource_path())?;
        Ok(())
    }

    /// Loads a side-car from `<path>.resource`. `path` is the data file's
    /// path, not the `.resource` file.
    pub fn deserialize<P: Into<PathBuf>>(path: P, partition: i64) -> Result<Self> {
        let path = path.into();
        let resource_path = append_ext(&path, "resource");
        let f = File::open(&resource_path)?;
        let mut r = BufReader::new(f);

        let start_count = r.read_i32::<LittleEndian>()?;
        if start_count < 0 {
            return Err(ResourceError::Corrupt("negative startCount".into()));
        }
        let mut device_start = BTreeMap::new();
        for _ in 0..start_count {
            let name = read_str(&mut r)?;
            let t = r.read_i64::<LittleEndian>()?;
            device_start.insert(name, t);
        }

        let end_count = r.read_i32::<LittleEndian>()?;
        if end_count < 0 {
            return Err(ResourceError::Corrupt("negative endCount".into()));
        }
        let mut device_end = BTreeMap::new();
        for _ in 0..end_count {
            let name = read_str(&mut r)?;
            let t = r.read_i64::<LittleEndian>()?;
            device_end.insert(name, t);
        }

        let version_count = r.read_i32::<LittleEndian>()?;
        if version_count < 0 {
            return Err(ResourceError::Corrupt("negative versionCount".into()));
        }
        let mut versions = BTreeSet::new();
        for _ in 0..version_count {
            versions.insert(r.read_i64::<LittleEndian>()? as u64);
        }

        Ok(Self {
            path,
            partition,
            device_start: RwLock::new(device_start),
            device_end: RwLock::new(device_end),
            historical_versions: RwLock::new(versions),
            closed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            query_lock: RwLock::new(()),
        })
    }

    /// `true` iff `device_start`/`device_end`/`historical_versions` are
    /// equal to `other`'s. Flags and the lock are runtime-only and excluded
    /// from this comparison (they are not part of the persisted format).
    #[must_use]
    pub fn data_eq(&self, other: &FileResource) -> bool {
        *self.device_start.read() == *other.device_start.read()
            && *self.device_end.read() == *other.device_end.read()
            && *self.historical_versions.read() == *other.historical_versions.read()
    }
}

fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn write_str<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_i32::<LittleEndian>(s.len() as i32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_i32::<LittleEndian>()?;
    if len < 0 {
        return Err(ResourceError::Corrupt("negative string length".into()));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| ResourceError::Corrupt(e.to_string()))
}

/// One logical-delete tombstone: samples on `series_path` with
/// `timestamp <= upper_bound` are hidden for any chunk whose version is
/// `<= file_version` (a chunk merged in later, at a higher version, is not
/// covered and must carry its own tombstone forward if still applicable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationRecord {
    /// `"{device}.{measurement}"`.
    pub series_path: String,
    pub upper_bound: i64,
    pub file_version: u64,
}

/// Append-only `.mods` log of logical deletes against one data file.
///
/// All records are kept in memory (a file accumulates only as many
/// tombstones as there are deletes issued against it before the next merge)
/// as well as appended durably to disk.
pub struct ModificationFile {
    path: PathBuf,
    records: Vec<ModificationRecord>,
}

impl ModificationFile {
    /// Opens `<data_path>.mods`, loading any existing records, or starts
    /// empty if the file does not exist yet.
    pub fn open<P: AsRef<Path>>(data_path: P) -> Result<Self> {
        let path = append_ext(data_path.as_ref(), "mods");
        let mut records = Vec::new();

        if path.exists() {
            let f = File::open(&path)?;
            let mut r = BufReader::new(f);
            loop {
                match r.read_i32::<LittleEndian>() {
                    Ok(len) => {
                        if len < 0 {
                            return Err(ResourceError::Corrupt("negative path length".into()));
                        }
                        let mut buf = vec![0u8; len as usize];
                        r.read_exact(&mut buf)?;
                        let series_path =
                            String::from_utf8(buf).map_err(|e| ResourceError::Corrupt(e.to_string()))?;
                        let upper_bound = r.read_i64::<LittleEndian>()?;
                        let file_version = r.read_i64::<LittleEndian>()? as u64;
                        records.push(ModificationRecord {
                            series_path,
                            upper_bound,
                            file_version,
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(Self { path, records })
    }

    /// Appends one tombstone record, persisting it immediately (append +
    /// flush) so a concurrent reader that re-opens the `.mods` file sees it.
    pub fn append(&mut self, record: ModificationRecord) -> Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        write_str(&mut f, &record.series_path)?;
        f.write_i64::<LittleEndian>(record.upper_bound)?;
        f.write_i64::<LittleEndian>(record.file_version as i64)?;
        f.flush()?;
        self.records.push(record);
        Ok(())
    }

    /// All tombstone records currently known for this file.
    #[must_use]
    pub fn records(&self) -> &[ModificationRecord] {
        &self.records
    }

    /// Returns `true` if `(series_path, timestamp)` at `chunk_version` is
    /// hidden by any recorded tombstone: a delete whose upper bound is
    /// `>= timestamp` and whose file version is `>= chunk_version` covers
    /// data written at or before that version.
    #[must_use]
    pub fn is_deleted(&self, series_path: &str, timestamp: i64, chunk_version: u64) -> bool {
        self.records.iter().any(|r| {
            r.series_path == series_path && r.upper_bound >= timestamp && r.file_version >= chunk_version
        })
    }
}
