//! Merge engine.
//!
//! Selects candidate seq/unseq files under a memory budget, then merges
//! them through a write-ahead-logged, six-phase protocol: `SOURCE`,
//! `MERGE_START`, `TS_END`* (one per completed series), `ALL_TS_MERGED`,
//! `FILE_END`* (one per decommissioned or rewritten source), `MERGE_END`.
//! Crash recovery ([`recover_merge`]) classifies an interrupted log the
//! same way and either aborts (pre-swap) or finishes removing files the
//! log shows were already superseded (post-swap).

use crate::{PartitionState, StorageGroupProcessor};
use anyhow::Result;
use config::MergeStrategy;
use memtable::DataValue;
use mergelog::{MergeLogRecord, MergeLogWriter, MergeLogAnalysis, RecoveryState};
use resource::{FileResource, ModificationFile};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tsfile::{merge_samples, SampleSource, TsFileReader, TsFileWriter};

/// A selected set of files one merge task will consume.
#[derive(Default, Clone)]
pub struct MergeCandidate {
    pub seq: Vec<Arc<FileResource>>,
    pub unseq: Vec<Arc<FileResource>>,
}

impl MergeCandidate {
    fn is_empty(&self) -> bool {
        self.seq.is_empty() && self.unseq.is_empty()
    }

    fn all(&self) -> Vec<Arc<FileResource>> {
        let mut all: Vec<Arc<FileResource>> = self.seq.iter().chain(self.unseq.iter()).cloned().collect();
        all.sort_by(|a, b| a.path().cmp(b.path()));
        all
    }
}

/// Orders merge candidates before the shared budget/feasibility pass.
/// Implementations differ only in objective (maximize files absorbed vs.
/// minimize output size); the loose-then-tight feasibility protocol itself
/// lives in [`select_candidate`].
pub trait MergeFileSelector {
    fn order(&self, seq: &mut [Arc<FileResource>], unseq: &mut [Arc<FileResource>]);
}

/// Shared by both INPLACE and SQUEEZE: smallest files first, to maximize how
/// many fit under budget. Both strategies pay the identical full-rewrite
/// cost (every source is re-read and every sample re-written into a brand
/// new output file) regardless of selection order; they differ only in
/// which path that output lands at (`run_merge_task`'s `reuse_primary`
/// handling reuses the primary sequence file's own path for INPLACE,
/// allocates a fresh one for SQUEEZE). INPLACE used to carry its own
/// selector here, ordered identically, so the two were collapsed into
/// this one.
pub struct SqueezeMaxFileSelector;
impl MergeFileSelector for SqueezeMaxFileSelector {
    fn order(&self, seq: &mut [Arc<FileResource>], unseq: &mut [Arc<FileResource>]) {
        unseq.sort_by_key(FileResource::file_size);
        seq.sort_by_key(FileResource::file_size);
    }
}

/// Picks by total estimated output size: largest files first, to retire as
/// many bytes of fragmentation as possible per merge.
pub struct IndependenceMaxFileSelector;
impl MergeFileSelector for IndependenceMaxFileSelector {
    fn order(&self, seq: &mut [Arc<FileResource>], unseq: &mut [Arc<FileResource>]) {
        seq.sort_by_key(|r| std::cmp::Reverse(r.file_size()));
        unseq.sort_by_key(|r| std::cmp::Reverse(r.file_size()));
    }
}

/// Cheap per-file overhead used for the "loose" feasibility estimate before
/// falling back to the accurate, more expensive "tight" bound (actual
/// on-disk sizes).
const LOOSE_PER_FILE_ESTIMATE: usize = 4 * 1024 * 1024;

fn estimate_cost(seq: &[Arc<FileResource>], unseq: &[Arc<FileResource>], tight: bool) -> usize {
    if tight {
        seq.iter().chain(unseq.iter()).map(|r| r.file_size() as usize).sum()
    } else {
        (seq.len() + unseq.len()) * LOOSE_PER_FILE_ESTIMATE
    }
}

/// Greedily selects an overlapping (seq, unseq) subset that fits `budget`,
/// trying the loose bound first and retrying with the tight bound if
/// nothing fit loosely. Returns an empty candidate if still infeasible.
fn select_candidate(
    selector: &dyn MergeFileSelector,
    seq_pool: &[Arc<FileResource>],
    unseq_pool: &[Arc<FileResource>],
    budget: usize,
    time_lower_bound: i64,
) -> MergeCandidate {
    let mut seq: Vec<Arc<FileResource>> = seq_pool
        .iter()
        .filter(|r| r.still_lives(time_lower_bound) && !r.is_merging())
        .cloned()
        .collect();
    let mut unseq: Vec<Arc<FileResource>> = unseq_pool
        .iter()
        .filter(|r| r.still_lives(time_lower_bound) && !r.is_merging())
        .cloned()
        .collect();
    selector.order(&mut seq, &mut unseq);

    for tight in [false, true] {
        let mut chosen_seq = Vec::new();
        let mut chosen_unseq = Vec::new();

        for r in &seq {
            chosen_seq.push(Arc::clone(r));
            if estimate_cost(&chosen_seq, &chosen_unseq, tight) > budget {
                chosen_seq.pop();
                break;
            }
        }
        for r in &unseq {
            chosen_unseq.push(Arc::clone(r));
            if estimate_cost(&chosen_seq, &chosen_unseq, tight) > budget {
                chosen_unseq.pop();
                break;
            }
        }

        if !chosen_seq.is_empty() || !chosen_unseq.is_empty() {
            return MergeCandidate { seq: chosen_seq, unseq: chosen_unseq };
        }
    }

    MergeCandidate::default()
}

impl StorageGroupProcessor {
    /// Selects and runs one merge task per partition that has candidates.
    /// `full_merge` also merges partitions with no unsequence files (pure
    /// sequence-file consolidation), which the incremental path skips.
    pub fn merge(&self, full_merge: bool) -> Result<()> {
        let partitions: Vec<Arc<PartitionState>> = self.partitions.read().values().cloned().collect();

        let selector: Box<dyn MergeFileSelector> = match self.config.merge_strategy {
            MergeStrategy::Inplace | MergeStrategy::Squeeze => Box::new(SqueezeMaxFileSelector),
            MergeStrategy::IndependenceSize => Box::new(IndependenceMaxFileSelector),
        };

        for part in partitions {
            part.reap_closed();
            let seq_pool = part.seq_sealed.read().clone();
            let unseq_pool = part.unseq_sealed.read().clone();

            if unseq_pool.is_empty() && !full_merge {
                continue;
            }

            let candidate = select_candidate(
                selector.as_ref(),
                &seq_pool,
                &unseq_pool,
                self.config.merge_memory_budget,
                self.config.time_lower_bound_ms,
            );
            if candidate.is_empty() {
                continue;
            }

            self.run_merge_task(&part, candidate)?;
        }

        Ok(())
    }

    fn run_merge_task(&self, part: &PartitionState, candidate: MergeCandidate) -> Result<()> {
        let log_path = self.dir.join("merge.log");
        let mut log = MergeLogWriter::create(&log_path)?;

        let all = candidate.all();
        let seq_paths: Vec<PathBuf> = candidate.seq.iter().map(|r| r.path().to_path_buf()).collect();
        let unseq_paths: Vec<PathBuf> = candidate.unseq.iter().map(|r| r.path().to_path_buf()).collect();
        log::info!(
            "merging partition {} ({} seq + {} unseq sources)",
            part.partition,
            seq_paths.len(),
            unseq_paths.len()
        );
        log.append(&MergeLogRecord::Source { seq_paths, unseq_paths })?;

        for r in &all {
            r.set_merging(true);
        }
        log.append(&MergeLogRecord::MergeStart)?;

        // INPLACE keeps the first (smallest, by the selector's ordering)
        // sequence file's identity and rewrites it; everything else in
        // `all` is decommissioned. SQUEEZE/IndependenceSize always produce
        // a brand-new file and decommission every input.
        let reuse_primary = matches!(self.config.merge_strategy, MergeStrategy::Inplace)
            .then(|| candidate.seq.first().cloned())
            .flatten();

        let output_version = self.next_version(part.partition);
        let output_path = match &reuse_primary {
            Some(primary) => primary.path().to_path_buf(),
            None => self
                .dir
                .join(part.partition.to_string())
                .join(format!("seq-{output_version}.tsfile")),
        };

        let readers: Vec<(Arc<FileResource>, TsFileReader)> = all
            .iter()
            .map(|r| Ok((Arc::clone(r), TsFileReader::open(r.path())?)))
            .collect::<Result<Vec<_>>>()?;

        let mut devices: BTreeSet<String> = BTreeSet::new();
        for (r, _) in &readers {
            devices.extend(r.devices());
        }

        let mut writer = TsFileWriter::create(&output_path, devices.len().max(1) * 4, self.config.max_degree_of_index_node)?;

        for device in &devices {
            let per_file: Vec<(&Arc<FileResource>, std::collections::HashMap<String, Vec<tsfile::ChunkMetadata>>)> = readers
                .iter()
                .filter(|(r, _)| r.contains_device(device))
                .map(|(r, reader)| Ok((r, reader.all_chunk_metadata_for_device(device)?)))
                .collect::<Result<Vec<_>>>()?;

            let measurements: BTreeSet<String> = per_file.iter().flat_map(|(_, m)| m.keys().cloned()).collect();
            let mut columns: BTreeMap<String, Vec<(i64, DataValue)>> = BTreeMap::new();

            for measurement in &measurements {
                let mut sources = Vec::new();
                let mut mods_files = Vec::new();

                for (r, reader_idx) in per_file.iter().map(|(r, m)| (r, m)) {
                    let Some(metas) = reader_idx.get(measurement) else { continue };
                    let (_, reader) = readers.iter().find(|(rr, _)| Arc::ptr_eq(rr, r)).unwrap();
                    let mut samples = Vec::new();
                    for m in metas {
                        samples.extend(reader.read_chunk(m)?);
                    }
                    samples.sort_by_key(|(t, _)| *t);
                    if !samples.is_empty() {
                        let version = r.historical_versions().iter().copied().max().unwrap_or(0);
                        sources.push(SampleSource::new(version, samples));
                    }
                    mods_files.push(ModificationFile::open(r.path())?);
                }

                let series_path = format!("{device}.{measurement}");
                let is_deleted = |ts: i64, version: u64| mods_files.iter().any(|m| m.is_deleted(&series_path, ts, version));
                let merged = merge_samples(sources, is_deleted);
                if !merged.is_empty() {
                    columns.insert(measurement.clone(), merged);
                }

                log.append(&MergeLogRecord::TsEnd { device: device.clone(), measurement: measurement.clone() })?;
            }

            if !columns.is_empty() {
                writer.write_chunk_group(device, &columns, output_version)?;
            }
        }

        log.append(&MergeLogRecord::AllTsMerged)?;

        drop(readers);

        // Held across the swap (finalize, for INPLACE renaming straight over
        // the primary's own path) and the removal of every decommissioned
        // source below: a query must not be able to open a path this merge
        // has just unlinked, or read a primary file mid-rename.
        let _write_guards: Vec<_> = all.iter().map(|r| r.write_lock()).collect();

        let final_path = writer.finalize()?;

        let union_versions: BTreeSet<u64> = all.iter().flat_map(|r| r.historical_versions()).collect();

        let output_resource = match &reuse_primary {
            Some(primary) => Arc::clone(primary),
            None => Arc::new(FileResource::new_unsealed(final_path.clone(), part.partition, output_version)),
        };
        output_resource.union_historical_versions(&union_versions);
        for device in &devices {
            if let Some((start, end)) = all
                .iter()
                .filter_map(|r| r.device_time_range(device))
                .reduce(|(s0, e0), (s1, e1)| (s0.min(s1), e0.max(e1)))
            {
                output_resource.update_start_time(device, start);
                output_resource.update_end_time(device, end);
            }
        }
        output_resource.mark_closed();
        output_resource.set_merging(false);
        output_resource.serialize()?;

        for r in &all {
            if reuse_primary.as_ref().map(|p| Arc::ptr_eq(p, r)).unwrap_or(false) {
                log.append(&MergeLogRecord::FileEnd { path: r.path().to_path_buf() })?;
                continue;
            }
            r.remove()?;
            log.append(&MergeLogRecord::FileEnd { path: r.path().to_path_buf() })?;
        }

        drop(_write_guards);

        log.append(&MergeLogRecord::MergeEnd)?;
        drop(log);
        mergelog::remove_log(&log_path)?;

        let decommissioned: HashSet<PathBuf> = all
            .iter()
            .filter(|r| !reuse_primary.as_ref().map(|p| Arc::ptr_eq(p, r)).unwrap_or(false))
            .map(|r| r.path().to_path_buf())
            .collect();

        part.seq_sealed.write().retain(|r| !decommissioned.contains(r.path()));
        part.unseq_sealed.write().retain(|r| !decommissioned.contains(r.path()));
        if reuse_primary.is_none() {
            part.seq_sealed.write().push(output_resource);
        }

        self.cache.clear();
        log::info!("merge of partition {} complete", part.partition);
        Ok(())
    }
}

/// Classifies an interrupted merge log left over from a crash and either
/// aborts it (no output was ever swapped in) or finishes removing sources
/// the log shows were already superseded, then deletes the log.
pub(crate) fn recover_merge(sg: &StorageGroupProcessor) -> Result<()> {
    let log_path = sg.dir.join("merge.log");
    let (analysis, state) = MergeLogAnalysis::analyze(&log_path)?;

    match state {
        RecoveryState::None => {}
        RecoveryState::MergeStart => {
            log::error!(
                "aborting merge interrupted before any series completed ({} seq + {} unseq sources untouched)",
                analysis.seq_paths.len(),
                analysis.unseq_paths.len()
            );
        }
        RecoveryState::AllTsMerged => {
            let swapped: HashSet<&PathBuf> = analysis.swapped_files.iter().collect();
            let stale: Vec<PathBuf> = analysis
                .seq_paths
                .iter()
                .chain(analysis.unseq_paths.iter())
                .filter(|p| !swapped.contains(*p) && p.exists())
                .cloned()
                .collect();

            for path in &stale {
                log::error!("removing stale merge source {} (output already sealed)", path.display());
                remove_stale_file(path);
            }

            if !stale.is_empty() {
                let stale: HashSet<PathBuf> = stale.into_iter().collect();
                for part in sg.partitions.read().values() {
                    part.seq_sealed.write().retain(|r| !stale.contains(r.path()));
                    part.unseq_sealed.write().retain(|r| !stale.contains(r.path()));
                }
            }
        }
        RecoveryState::MergeEnd => {}
    }

    if !matches!(state, RecoveryState::None) || log_path.exists() {
        mergelog::remove_log(&log_path)?;
    }
    Ok(())
}

fn remove_stale_file(path: &std::path::Path) {
    for suffix in [".resource", ".mods", ".closing"] {
        let mut s = path.as_os_str().to_owned();
        s.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(s));
    }
    let _ = std::fs::remove_file(path);
}
