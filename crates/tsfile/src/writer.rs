//! Writes one sealed (or flush-in-progress) time-series file.
//!
//! A writer accumulates one or more chunk groups via
//! [`TsFileWriter::write_chunk_group`] and, once the caller has no more data,
//! calls [`TsFileWriter::finalize`] to append the metadata-index tree, file
//! metadata, and tail, then atomically publish the file (write-temp,
//! fsync, rename, so a crash never leaves a half-written file at its final
//! path).

use crate::chunk::{self, ChunkMetadata, CHUNK_METADATA_RECORD_LEN};
use crate::format::{self, IndexNodeKind, Result, CHUNK_GROUP_FOOTER, CHUNK_HEADER, FORMAT_VERSION, MAGIC, SEPARATOR, VERSION_MARKER};
use crate::index::{self, BranchEntry, MeasurementEntry};
use bloom::BloomFilter;
use byteorder::{LittleEndian, WriteBytesExt};
use memtable::DataValue;
use std::collections::BTreeMap;
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

/// Default bloom filter false positive rate over `device.measurement` keys.
const BLOOM_FPR: f64 = 0.01;

pub struct TsFileWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: BufWriter<File>,
    /// device -> measurement -> chunk metadata accumulated across every
    /// `write_chunk_group` call so far.
    chunk_metas: BTreeMap<String, BTreeMap<String, Vec<ChunkMetadata>>>,
    bloom: BloomFilter,
    max_degree: usize,
}

impl TsFileWriter {
    /// Creates a new file at `path`, writing the head magic + version tag.
    /// `expected_series` sizes the bloom filter.
    pub fn create(path: &Path, expected_series: usize, max_degree: usize) -> Result<Self> {
        let tmp_path = path.with_extension("tmp");
        let raw = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        let mut file = BufWriter::new(raw);

        file.write_u32::<LittleEndian>(MAGIC)?;
        file.write_u8(FORMAT_VERSION)?;

        Ok(Self {
            tmp_path,
            final_path: path.to_path_buf(),
            file,
            chunk_metas: BTreeMap::new(),
            bloom: BloomFilter::new(expected_series.max(1), BLOOM_FPR),
            max_degree: max_degree.max(2),
        })
    }

    /// Writes one device's chunk group: one chunk per measurement (already
    /// sorted by `columns` being a `BTreeMap`), a chunk-group footer, and a
    /// version record.
    pub fn write_chunk_group(
        &mut self,
        device: &str,
        columns: &BTreeMap<String, Vec<(i64, DataValue)>>,
        version: u64,
    ) -> Result<()> {
        for (measurement, samples) in columns {
            if samples.is_empty() {
                continue;
            }
            let data_type = samples[0].1.type_tag();
            let start_time = samples.first().map(|(t, _)| *t).unwrap();
            let end_time = samples.last().map(|(t, _)| *t).unwrap();
            let payload = chunk::encode_samples(samples);

            let chunk_offset = self.file.stream_position()?;
            self.file.write_u8(CHUNK_HEADER)?;
            self.file.write_u16::<LittleEndian>(measurement.len() as u16)?;
            self.file.write_all(measurement.as_bytes())?;
            self.file.write_u8(data_type)?;
            self.file.write_i64::<LittleEndian>(start_time)?;
            self.file.write_i64::<LittleEndian>(end_time)?;
            self.file.write_u64::<LittleEndian>(samples.len() as u64)?;
            self.file.write_u32::<LittleEndian>(payload.len() as u32)?;
            self.file.write_u32::<LittleEndian>(payload.len() as u32)?;
            self.file.write_all(&payload)?;

            self.chunk_metas
                .entry(device.to_string())
                .or_default()
                .entry(measurement.to_string())
                .or_default()
                .push(ChunkMetadata {
                    offset: chunk_offset,
                    compressed_size: payload.len() as u32,
                    uncompressed_size: payload.len() as u32,
                    start_time,
                    end_time,
                    point_count: samples.len() as u64,
                    data_type,
                });

            let mut bloom_key = Vec::with_capacity(device.len() + measurement.len() + 1);
            bloom_key.extend_from_slice(device.as_bytes());
            bloom_key.push(b'.');
            bloom_key.extend_from_slice(measurement.as_bytes());
            self.bloom.insert(&bloom_key);
        }

        let footer_start = self.file.stream_position()?;
        self.file.write_u8(CHUNK_GROUP_FOOTER)?;
        self.file.write_u16::<LittleEndian>(device.len() as u16)?;
        self.file.write_all(device.as_bytes())?;
        self.file.write_u32::<LittleEndian>(columns.len() as u32)?;
        let footer_len = self.file.stream_position()? - footer_start;
        self.file.write_u32::<LittleEndian>(footer_len as u32)?;

        self.file.write_u8(VERSION_MARKER)?;
        self.file.write_u64::<LittleEndian>(version)?;

        Ok(())
    }

    /// Appends the end-of-data separator, the chunk-metadata region, the
    /// metadata-index tree, the file metadata, and the tail, then publishes
    /// the file via fsync + atomic rename. Returns the final path.
    pub fn finalize(mut self) -> Result<PathBuf> {
        self.file.write_u8(SEPARATOR)?;

        let mut device_entries: Vec<BranchEntry> = Vec::with_capacity(self.chunk_metas.len());

        for (device, measurements) in &self.chunk_metas {
            let mut measurement_entries: Vec<MeasurementEntry> = Vec::with_capacity(measurements.len());

            for (measurement, metas) in measurements {
                let chunk_list_offset = self.file.stream_position()?;
                for m in metas {
                    chunk::write_chunk_metadata(&mut self.file, m)?;
                }
                let start_time = metas.iter().map(|m| m.start_time).min().unwrap();
                let end_time = metas.iter().map(|m| m.end_time).max().unwrap();
                measurement_entries.push(MeasurementEntry {
                    name: measurement.clone(),
                    data_type: metas[0].data_type,
                    chunk_list_offset,
                    chunk_list_len: metas.len() as u32,
                    start_time,
                    end_time,
                });
                debug_assert_eq!(
                    self.file.stream_position()? - chunk_list_offset,
                    metas.len() as u64 * CHUNK_METADATA_RECORD_LEN
                );
            }

            measurement_entries.sort_by(|a, b| a.name.cmp(&b.name));
            let (root_offset, root_kind) = index::build_measurement_tree(&mut self.file, measurement_entries, self.max_degree)?;
            device_entries.push(BranchEntry {
                name: device.clone(),
                offset: root_offset,
                kind: root_kind,
            });
        }

        let (device_root_offset, device_root_kind) = if device_entries.is_empty() {
            // An empty file (flush of a device with no series) still needs a
            // root to point at; write a trivial empty leaf-device node.
            let offset = index::write_branch_node(&mut self.file, IndexNodeKind::LeafDevice, &[])?;
            (offset, IndexNodeKind::LeafDevice)
        } else {
            index::build_layer(
                &mut self.file,
                device_entries,
                IndexNodeKind::LeafDevice,
                IndexNodeKind::InternalDevice,
                self.max_degree,
            )?
        };

        let file_metadata_start = self.file.stream_position()?;
        let file_metadata = format::FileMetadata {
            root_offset: device_root_offset,
            root_kind: device_root_kind,
            bloom: self.bloom,
        };
        file_metadata.write(&mut self.file)?;
        let file_metadata_size = self.file.stream_position()? - file_metadata_start;

        self.file.write_i32::<LittleEndian>(file_metadata_size as i32)?;
        self.file.write_u32::<LittleEndian>(MAGIC)?;

        self.file.flush()?;
        self.file.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        rename(&self.tmp_path, &self.final_path)?;
        if let Some(parent) = self.final_path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(self.final_path)
    }
}
