use config::StorageGroupConfig;
use std::path::Path;

/// A config tuned for fast tests: small partitions and a low memtable
/// threshold so a handful of writes is enough to exercise a flush.
pub fn small_config() -> StorageGroupConfig {
    StorageGroupConfig {
        partition_interval_ms: 1_000,
        memtable_size_threshold: 64,
        unseq_files_per_partition_max: 3,
        metadata_cache_size: 4096,
        ..Default::default()
    }
}

pub fn count_tsfiles(dir: &Path) -> usize {
    walk(dir)
        .into_iter()
        .filter(|p| p.extension().map(|e| e == "tsfile").unwrap_or(false))
        .count()
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else { return out };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk(&path));
        } else {
            out.push(path);
        }
    }
    out
}
