//! # engine — storage-group processor
//!
//! The central orchestrator tying together [`memtable`], [`tsfile`],
//! [`mergelog`], [`resource`], and [`metacache`] into one storage group: a
//! directory of time-partitioned sequence/unsequence files plus the
//! in-memory state needed to write and query them.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌────────────────────────────────────────────────────┐
//! │              STORAGE GROUP PROCESSOR                │
//! │                                                      │
//! │ write.rs → classify seq/unseq → FileProcessor::insert│
//! │              |                                      │
//! │              |  (memtable threshold exceeded?)      │
//! │              v                                      │
//! │           async_close() → flush_pool → tsfile       │
//! │                                                      │
//! │ merge.rs → select candidates → write-ahead merge log │
//! │             → multi-chunk merge → seal output        │
//! │                                                      │
//! │ read.rs → QueryDataSource (seq + unseq + memtables)  │
//! │            → newer-wins merge, tombstone filtered     │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module responsibilities
//!
//! | Module            | Purpose                                                |
//! |-------------------|---------------------------------------------------------|
//! | [`lib.rs`]        | `StorageGroupProcessor`, `PartitionState`, constructors  |
//! | [`file_processor`] | One memtable's lifecycle: insert, query, flush, seal     |
//! | [`flush_pool`]    | CPU-sized worker pool running flushes off the caller     |
//! | [`write`]         | `insert`, `insert_tablet`, `delete`                      |
//! | [`read`]          | `query`, `QueryDataSource`                               |
//! | [`recovery`]      | Startup recovery: self-check, `.resource` reload          |
//! | [`merge`]         | File selection, write-ahead-logged multi-file merge       |
//!
//! ## Partitions
//!
//! Each time partition holds at most one *active* sequence and one active
//! unsequence [`FileProcessor`]; any number of *closing* (flushing) and
//! *sealed* (on-disk, read-only) files besides. A write threshold or the
//! unsequence-file ceiling swaps the active slot to closing; recovery and
//! merges operate only on sealed files.
//!
//! ## Crash safety
//!
//! Flushes publish atomically (write to `.tmp`, fsync, rename) before the
//! `.resource` side-car is persisted — see [`file_processor`]. Merges are
//! protected by a write-ahead log replayed by [`recovery::open`] through
//! [`merge::recover_merge`] before the storage group admits writes.

mod file_processor;
mod flush_pool;
pub mod merge;
mod read;
mod recovery;
#[cfg(test)]
mod tests;
mod write;

pub use file_processor::FileProcessor;
pub use flush_pool::FlushPool;
pub use read::{QueryDataSource, SeriesSource};

use config::StorageGroupConfig;
use metacache::MetadataCache;
use parking_lot::RwLock;
use resource::FileResource;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-partition file bookkeeping: at most one active processor per
/// seq/unseq slot, any number closing (flushing) or sealed.
pub(crate) struct PartitionState {
    pub partition: i64,
    pub seq_active: RwLock<Option<Arc<FileProcessor>>>,
    pub seq_closing: RwLock<Vec<Arc<FileProcessor>>>,
    pub seq_sealed: RwLock<Vec<Arc<FileResource>>>,
    pub unseq_active: RwLock<Option<Arc<FileProcessor>>>,
    pub unseq_closing: RwLock<Vec<Arc<FileProcessor>>>,
    pub unseq_sealed: RwLock<Vec<Arc<FileResource>>>,
}

impl PartitionState {
    fn new(partition: i64) -> Self {
        Self {
            partition,
            seq_active: RwLock::new(None),
            seq_closing: RwLock::new(Vec::new()),
            seq_sealed: RwLock::new(Vec::new()),
            unseq_active: RwLock::new(None),
            unseq_closing: RwLock::new(Vec::new()),
            unseq_sealed: RwLock::new(Vec::new()),
        }
    }

    /// Moves any closing processor whose backing file has finished sealing
    /// into the sealed list, so later reads and merges see it as an
    /// ordinary sealed file rather than an in-flight one.
    fn reap_closed(&self) {
        reap(&self.seq_closing, &self.seq_sealed);
        reap(&self.unseq_closing, &self.unseq_sealed);
    }
}

fn reap(closing: &RwLock<Vec<Arc<FileProcessor>>>, sealed: &RwLock<Vec<Arc<FileResource>>>) {
    let done: Vec<Arc<FileProcessor>> = {
        let mut guard = closing.write();
        let (done, still): (Vec<_>, Vec<_>) = guard.drain(..).partition(|p| p.resource.is_closed());
        *guard = still;
        done
    };
    if !done.is_empty() {
        sealed.write().extend(done.into_iter().map(|p| Arc::clone(&p.resource)));
    }
}

/// Aggregate counts for `STATS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageGroupStats {
    pub partitions: usize,
    pub seq_files: usize,
    pub unseq_files: usize,
    pub closing_files: usize,
}

/// Owns one storage group's on-disk directory and in-memory write/merge
/// state. Cloning is not supported; share via `Arc<StorageGroupProcessor>`.
pub struct StorageGroupProcessor {
    pub(crate) name: String,
    pub(crate) dir: PathBuf,
    pub(crate) config: Arc<StorageGroupConfig>,
    pub(crate) partitions: RwLock<BTreeMap<i64, Arc<PartitionState>>>,
    pub(crate) next_version: RwLock<BTreeMap<i64, u64>>,
    pub(crate) cache: Arc<MetadataCache>,
    pub(crate) flush_pool: Arc<FlushPool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StorageGroupProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("StorageGroupProcessor")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("partitions", &stats.partitions)
            .field("seq_files", &stats.seq_files)
            .field("unseq_files", &stats.unseq_files)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StorageGroupProcessor {
    /// Creates a fresh, empty storage group at `dir` without reading
    /// anything back from disk. Use [`Self::open`] on startup instead;
    /// this is exposed for tests and for building a group whose directory
    /// is known to be empty.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, config: StorageGroupConfig) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let cache = Arc::new(MetadataCache::new(config.metadata_cache_size));
        if config.metadata_cache_size == 0 {
            cache.set_enabled(false);
        }

        Ok(Self {
            name: name.into(),
            dir,
            config: Arc::new(config),
            partitions: RwLock::new(BTreeMap::new()),
            next_version: RwLock::new(BTreeMap::new()),
            cache,
            flush_pool: Arc::new(FlushPool::cpu_sized()),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn config(&self) -> &StorageGroupConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops admitting new writes. Used to escalate a repeated flush
    /// failure into a hard stop rather than silently losing data.
    pub fn close_to_writes(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Blocks until every active and closing file processor across every
    /// partition has flushed and sealed.
    pub fn close_all(&self) -> anyhow::Result<()> {
        let partitions: Vec<Arc<PartitionState>> = self.partitions.read().values().cloned().collect();
        for part in &partitions {
            let actives: Vec<Arc<FileProcessor>> = [part.seq_active.read().clone(), part.unseq_active.read().clone()]
                .into_iter()
                .flatten()
                .collect();
            for p in actives {
                p.sync_close(&self.flush_pool)?;
            }
            part.reap_closed();

            let closing: Vec<Arc<FileProcessor>> =
                part.seq_closing.read().iter().chain(part.unseq_closing.read().iter()).cloned().collect();
            for p in closing {
                p.sync_close(&self.flush_pool)?;
            }
            part.reap_closed();
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> StorageGroupStats {
        let partitions = self.partitions.read();
        let mut stats = StorageGroupStats { partitions: partitions.len(), ..Default::default() };
        for part in partitions.values() {
            stats.seq_files += part.seq_sealed.read().len() + usize::from(part.seq_active.read().is_some());
            stats.unseq_files += part.unseq_sealed.read().len() + usize::from(part.unseq_active.read().is_some());
            stats.closing_files += part.seq_closing.read().len() + part.unseq_closing.read().len();
        }
        stats
    }

    pub(crate) fn partition_state(&self, partition: i64) -> Arc<PartitionState> {
        {
            let partitions = self.partitions.read();
            if let Some(p) = partitions.get(&partition) {
                return Arc::clone(p);
            }
        }
        let mut partitions = self.partitions.write();
        Arc::clone(partitions.entry(partition).or_insert_with(|| Arc::new(PartitionState::new(partition))))
    }

    /// Allocates the next file version for `partition`. Versions are
    /// partition-scoped rather than global, so merges that consolidate one
    /// partition never need to renumber another.
    pub(crate) fn next_version(&self, partition: i64) -> u64 {
        let mut map = self.next_version.write();
        let entry = map.entry(partition).or_insert(0);
        *entry += 1;
        *entry
    }

    pub(crate) fn unseq_file_count(&self, part: &PartitionState) -> usize {
        part.unseq_sealed.read().len() + part.unseq_closing.read().len() + usize::from(part.unseq_active.read().is_some())
    }
}
