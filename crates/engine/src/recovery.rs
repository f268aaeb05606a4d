//! Startup recovery: clean up orphan `.tmp` files from interrupted flushes,
//! load every partition's sealed file-resources, self-check any file whose
//! `.resource` side-car is missing or whose `.closing` flag is still set,
//! then hand off to the merge log before admitting writes.
//!
//! [`tsfile::TsFileWriter`] publishes a sealed file atomically (write to
//! `.tmp`, fsync, rename), but publishes the data file itself *before* the
//! engine persists its `.resource` side-car ([`crate::file_processor`]'s
//! `flush_and_seal`) — a crash in that window leaves a complete, self-check
//! `Complete` data file with no side-car. A crash mid-chunk-group instead
//! leaves a file whose tail never got written at all, which self-check
//! reports as `Truncated(pos)`: safe to use up to `pos`, unsafe past it.
//! Both cases are recovered here by truncating (only for `Truncated`) and
//! then rebuilding the side-car from a direct re-walk of the file's own
//! chunk-group region — [`tsfile::recover_side_car`] — rather than by
//! discarding the file. Only a file that fails self-check outright
//! (`OnlyMagicHead`, `Incompatible`, or an I/O error) is discarded.

use crate::merge;
use crate::StorageGroupProcessor;
use anyhow::Result;
use config::StorageGroupConfig;
use resource::FileResource;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tsfile::{RecoveredSidecar, SelfCheckResult};

impl StorageGroupProcessor {
    /// Opens (or creates) a storage group at `dir`, replaying every
    /// partition's on-disk state before returning a processor ready for
    /// writes.
    pub fn open(name: impl Into<String>, dir: impl Into<PathBuf>, config: StorageGroupConfig) -> Result<Self> {
        let sg = Self::new(name, dir, config)?;
        sg.recover()?;
        Ok(sg)
    }

    fn recover(&self) -> Result<()> {
        log::info!("recovering storage group {} at {}", self.name, self.dir.display());
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut partition_dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(partition) = entry.file_name().to_string_lossy().parse::<i64>() {
                    partition_dirs.push((partition, entry.path()));
                }
            }
        }

        for (partition, path) in partition_dirs {
            self.recover_partition(partition, &path)?;
        }

        merge::recover_merge(self)?;
        Ok(())
    }

    fn recover_partition(&self, partition: i64, dir: &Path) -> Result<()> {
        cleanup_tmp_files(dir);

        let part = self.partition_state(partition);
        let mut max_version = 0u64;

        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "tsfile").unwrap_or(false))
            .collect();
        files.sort();

        for path in files {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_string();
            let is_seq = stem.starts_with("seq-");
            let version = stem.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            max_version = max_version.max(version);

            let closing_flag = append_suffix(&path, ".closing");
            let resource_path = append_suffix(&path, ".resource");
            let needs_check = closing_flag.exists() || !resource_path.exists();

            let resource = if needs_check {
                match tsfile::recover_side_car(&path) {
                    Ok((SelfCheckResult::Complete, _)) if resource_path.exists() => {
                        FileResource::deserialize(&path, partition).ok()
                    }
                    Ok((SelfCheckResult::Complete, sidecar)) => {
                        log::warn!("rebuilding missing .resource side-car for {}", path.display());
                        let resource = rebuild_resource(&path, partition, version, sidecar);
                        if let Err(e) = resource.serialize() {
                            log::error!("failed to persist rebuilt side-car for {}: {e}", path.display());
                        }
                        Some(resource)
                    }
                    Ok((SelfCheckResult::Truncated(pos), sidecar)) => {
                        log::warn!("truncating {} to {} bytes and rebuilding its side-car", path.display(), pos);
                        match truncate_to(&path, pos) {
                            Ok(()) => {
                                let resource = rebuild_resource(&path, partition, version, sidecar);
                                if let Err(e) = resource.serialize() {
                                    log::error!("failed to persist rebuilt side-car for {}: {e}", path.display());
                                }
                                Some(resource)
                            }
                            Err(e) => {
                                log::error!("failed to truncate {}: {e}, discarding", path.display());
                                let _ = fs::remove_file(&path);
                                None
                            }
                        }
                    }
                    _ => {
                        log::error!("discarding unrecoverable file {}", path.display());
                        let _ = fs::remove_file(&path);
                        None
                    }
                }
            } else {
                FileResource::deserialize(&path, partition).ok()
            };

            let _ = fs::remove_file(&closing_flag);

            if let Some(resource) = resource {
                resource.mark_closed();
                let resource = Arc::new(resource);
                if is_seq {
                    part.seq_sealed.write().push(resource);
                } else {
                    part.unseq_sealed.write().push(resource);
                }
            }
        }

        self.next_version.write().insert(partition, max_version);
        Ok(())
    }
}

/// Builds a fresh [`FileResource`] from a chunk-group-region re-walk.
/// `fallback_version` (parsed from the file's own name) seeds the
/// historical-version set in case the walk recovered none (an otherwise
/// empty file).
fn rebuild_resource(path: &Path, partition: i64, fallback_version: u64, sidecar: RecoveredSidecar) -> FileResource {
    let resource = FileResource::new_unsealed(path.to_path_buf(), partition, fallback_version);
    for (device, (start, end)) in &sidecar.device_ranges {
        resource.update_start_time(device, *start);
        resource.update_end_time(device, *end);
    }
    if !sidecar.versions.is_empty() {
        resource.union_historical_versions(&sidecar.versions);
    }
    resource
}

fn truncate_to(path: &Path, pos: u64) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(pos)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn cleanup_tmp_files(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            if p.extension().map(|e| e == "tmp").unwrap_or(false) {
                let _ = fs::remove_file(&p);
            }
        }
    }
}
