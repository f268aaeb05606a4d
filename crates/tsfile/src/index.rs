//! The metadata-index tree: a B-tree-like structure with four entry kinds
//! (`INTERNAL_DEVICE`, `LEAF_DEVICE`, `INTERNAL_MEASUREMENT`,
//! `LEAF_MEASUREMENT`) that lets the reader locate a `(device, measurement)`
//! pair's chunk-metadata run without scanning the whole file.
//!
//! Building and traversal are both generic over "name-keyed children", since
//! the device layer and the measurement layer use the same branching
//! structure; only the leaf shape differs (a measurement leaf points
//! directly at a chunk-metadata run instead of at another node).

use crate::format::{IndexNodeKind, Result, TsFileError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

/// One child pointer in an internal or leaf-device node: a name and the
/// offset of the node it points to.
#[derive(Debug, Clone)]
pub struct BranchEntry {
    pub name: String,
    pub offset: u64,
    pub kind: IndexNodeKind,
}

/// One series entry in a leaf-measurement node: points at a contiguous run
/// of [`crate::ChunkMetadata`] records rather than at another tree node.
#[derive(Debug, Clone)]
pub struct MeasurementEntry {
    pub name: String,
    pub data_type: u8,
    pub chunk_list_offset: u64,
    pub chunk_list_len: u32,
    pub start_time: i64,
    pub end_time: i64,
}

/// Writes a branch node (`InternalDevice`, `LeafDevice`, or
/// `InternalMeasurement`) at the writer's current position and returns that
/// position.
pub fn write_branch_node<W: Write + Seek>(w: &mut W, kind: IndexNodeKind, entries: &[BranchEntry]) -> Result<u64> {
    let offset = w.stream_position()?;
    w.write_u8(kind as u8)?;
    w.write_u32::<LittleEndian>(entries.len() as u32)?;
    for e in entries {
        w.write_u16::<LittleEndian>(e.name.len() as u16)?;
        w.write_all(e.name.as_bytes())?;
        w.write_u64::<LittleEndian>(e.offset)?;
        w.write_u8(e.kind as u8)?;
    }
    Ok(offset)
}

/// Writes a `LeafMeasurement` node and returns its offset.
pub fn write_measurement_leaf<W: Write + Seek>(w: &mut W, entries: &[MeasurementEntry]) -> Result<u64> {
    let offset = w.stream_position()?;
    w.write_u8(IndexNodeKind::LeafMeasurement as u8)?;
    w.write_u32::<LittleEndian>(entries.len() as u32)?;
    for e in entries {
        w.write_u16::<LittleEndian>(e.name.len() as u16)?;
        w.write_all(e.name.as_bytes())?;
        w.write_u8(e.data_type)?;
        w.write_u64::<LittleEndian>(e.chunk_list_offset)?;
        w.write_u32::<LittleEndian>(e.chunk_list_len)?;
        w.write_i64::<LittleEndian>(e.start_time)?;
        w.write_i64::<LittleEndian>(e.end_time)?;
    }
    Ok(offset)
}

/// Wraps already-written node pointers in successive `internal_kind` layers
/// until a single root remains, grouping at most `max_degree` entries per
/// node. If only one pointer is given, it is returned as the root directly —
/// the tree omits the internal layer entirely, which the traversal contract
/// allows.
pub fn wrap_pointers<W: Write + Seek>(
    w: &mut W,
    mut level: Vec<BranchEntry>,
    internal_kind: IndexNodeKind,
    max_degree: usize,
) -> Result<(u64, IndexNodeKind)> {
    assert!(max_degree >= 2, "max_degree_of_index_node must be >= 2");
    assert!(!level.is_empty());

    if level.len() == 1 {
        let only = level.remove(0);
        return Ok((only.offset, only.kind));
    }

    loop {
        if level.len() <= max_degree {
            let offset = write_branch_node(w, internal_kind, &level)?;
            return Ok((offset, internal_kind));
        }

        let mut next_level = Vec::with_capacity(level.len() / max_degree + 1);
        for chunk in level.chunks(max_degree) {
            let first_name = chunk[0].name.clone();
            let offset = write_branch_node(w, internal_kind, chunk)?;
            next_level.push(BranchEntry {
                name: first_name,
                offset,
                kind: internal_kind,
            });
        }
        level = next_level;
    }
}

/// Groups raw per-child entries (each already pointing at a written node —
/// a device's measurement-subtree root) into one or more `leaf_kind` nodes of
/// at most `max_degree` entries, then wraps those via [`wrap_pointers`].
pub fn build_layer<W: Write + Seek>(
    w: &mut W,
    entries: Vec<BranchEntry>,
    leaf_kind: IndexNodeKind,
    internal_kind: IndexNodeKind,
    max_degree: usize,
) -> Result<(u64, IndexNodeKind)> {
    assert!(max_degree >= 2, "max_degree_of_index_node must be >= 2");
    assert!(!entries.is_empty());

    if entries.len() <= max_degree {
        let offset = write_branch_node(w, leaf_kind, &entries)?;
        return Ok((offset, leaf_kind));
    }

    let mut level = Vec::with_capacity(entries.len() / max_degree + 1);
    for chunk in entries.chunks(max_degree) {
        let first_name = chunk[0].name.clone();
        let offset = write_branch_node(w, leaf_kind, chunk)?;
        level.push(BranchEntry {
            name: first_name,
            offset,
            kind: leaf_kind,
        });
    }

    wrap_pointers(w, level, internal_kind, max_degree)
}

/// Builds a device's measurement subtree from its (sorted) measurement
/// entries, splitting into `LeafMeasurement` nodes and wrapping with
/// `InternalMeasurement` layers as needed.
pub fn build_measurement_tree<W: Write + Seek>(
    w: &mut W,
    entries: Vec<MeasurementEntry>,
    max_degree: usize,
) -> Result<(u64, IndexNodeKind)> {
    assert!(!entries.is_empty());

    if entries.len() <= max_degree {
        let offset = write_measurement_leaf(w, &entries)?;
        return Ok((offset, IndexNodeKind::LeafMeasurement));
    }

    let mut level = Vec::with_capacity(entries.len() / max_degree + 1);
    for chunk in entries.chunks(max_degree) {
        let first_name = chunk[0].name.clone();
        let offset = write_measurement_leaf(w, chunk)?;
        level.push(BranchEntry {
            name: first_name,
            offset,
            kind: IndexNodeKind::LeafMeasurement,
        });
    }

    wrap_pointers(w, level, IndexNodeKind::InternalMeasurement, max_degree)
}

fn read_branch_node<R: Read + Seek>(r: &mut R, offset: u64) -> Result<(IndexNodeKind, Vec<BranchEntry>)> {
    r.seek(SeekFrom::Start(offset))?;
    let kind = IndexNodeKind::from_u8(r.read_u8()?)?;
    if kind == IndexNodeKind::LeafMeasurement {
        return Err(TsFileError::Corrupt("expected branch node, found leaf-measurement".into()));
    }
    let count = r.read_u32::<LittleEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_len = r.read_u16::<LittleEndian>()?;
        let mut name_buf = vec![0u8; name_len as usize];
        r.read_exact(&mut name_buf)?;
        let name = String::from_utf8(name_buf).map_err(|e| TsFileError::Corrupt(e.to_string()))?;
        let child_offset = r.read_u64::<LittleEndian>()?;
        let child_kind = IndexNodeKind::from_u8(r.read_u8()?)?;
        entries.push(BranchEntry {
            name,
            offset: child_offset,
            kind: child_kind,
        });
    }
    Ok((kind, entries))
}

fn read_measurement_leaf<R: Read + Seek>(r: &mut R, offset: u64) -> Result<Vec<MeasurementEntry>> {
    r.seek(SeekFrom::Start(offset))?;
    let kind = IndexNodeKind::from_u8(r.read_u8()?)?;
    if kind != IndexNodeKind::LeafMeasurement {
        return Err(TsFileError::Corrupt("expected leaf-measurement node".into()));
    }
    let count = r.read_u32::<LittleEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_len = r.read_u16::<LittleEndian>()?;
        let mut name_buf = vec![0u8; name_len as usize];
        r.read_exact(&mut name_buf)?;
        let name = String::from_utf8(name_buf).map_err(|e| TsFileError::Corrupt(e.to_string()))?;
        let data_type = r.read_u8()?;
        let chunk_list_offset = r.read_u64::<LittleEndian>()?;
        let chunk_list_len = r.read_u32::<LittleEndian>()?;
        let start_time = r.read_i64::<LittleEndian>()?;
        let end_time = r.read_i64::<LittleEndian>()?;
        entries.push(MeasurementEntry {
            name,
            data_type,
            chunk_list_offset,
            chunk_list_len,
            start_time,
            end_time,
        });
    }
    Ok(entries)
}

/// Binary-searches `entries` (sorted by name) for the greatest entry whose
/// name is `<= target`, per the traversal rule in the metadata-index
/// contract.
fn floor_entry<'a>(entries: &'a [BranchEntry], target: &str) -> Option<&'a BranchEntry> {
    match entries.binary_search_by(|e| e.name.as_str().cmp(target)) {
        Ok(idx) => Some(&entries[idx]),
        Err(0) => None,
        Err(idx) => Some(&entries[idx - 1]),
    }
}

/// Descends from `root` looking for `device`. Stops and returns the entry
/// once its declared kind is no longer `InternalDevice`/`LeafDevice` (i.e.
/// the tree omitted the device layer, or we reached the device's own leaf).
pub fn find_device<R: Read + Seek>(
    r: &mut R,
    root_offset: u64,
    root_kind: IndexNodeKind,
    device: &str,
) -> Result<Option<BranchEntry>> {
    let mut offset = root_offset;
    let mut kind = root_kind;

    loop {
        match kind {
            IndexNodeKind::InternalDevice | IndexNodeKind::LeafDevice => {
                let (_, entries) = read_branch_node(r, offset)?;
                let Some(found) = floor_entry(&entries, device) else {
                    return Ok(None);
                };
                if kind == IndexNodeKind::LeafDevice || found.kind != IndexNodeKind::InternalDevice {
                    return Ok(Some(found.clone()));
                }
                offset = found.offset;
                kind = found.kind;
            }
            _ => return Ok(None),
        }
    }
}

/// Descends from a device's measurement-tree root looking for `measurement`.
pub fn find_measurement<R: Read + Seek>(
    r: &mut R,
    root_offset: u64,
    root_kind: IndexNodeKind,
    measurement: &str,
) -> Result<Option<MeasurementEntry>> {
    let mut offset = root_offset;
    let mut kind = root_kind;

    loop {
        match kind {
            IndexNodeKind::LeafMeasurement => {
                let entries = read_measurement_leaf(r, offset)?;
                return Ok(entries.into_iter().find(|e| e.name == measurement));
            }
            IndexNodeKind::InternalMeasurement => {
                let (_, entries) = read_branch_node(r, offset)?;
                let Some(found) = floor_entry(&entries, measurement) else {
                    return Ok(None);
                };
                offset = found.offset;
                kind = found.kind;
            }
            _ => return Ok(None),
        }
    }
}

/// Returns every measurement leaf's entries under a device's measurement
/// subtree, for the bulk-read path (`|measurements| > D / ln D`).
pub fn collect_all_measurements<R: Read + Seek>(
    r: &mut R,
    root_offset: u64,
    root_kind: IndexNodeKind,
) -> Result<Vec<MeasurementEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![(root_offset, root_kind)];

    while let Some((offset, kind)) = stack.pop() {
        match kind {
            IndexNodeKind::LeafMeasurement => {
                out.extend(read_measurement_leaf(r, offset)?);
            }
            IndexNodeKind::InternalMeasurement => {
                let (_, entries) = read_branch_node(r, offset)?;
                for e in entries {
                    stack.push((e.offset, e.kind));
                }
            }
            _ => return Err(TsFileError::Corrupt("expected measurement subtree".into())),
        }
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// The bulk-read cost heuristic from the metadata-index contract: worth
/// switching to a full subtree scan once the number of measurements being
/// looked up exceeds `max_degree / ln(max_degree)`.
#[must_use]
pub fn bulk_read_is_cheaper(measurement_count: usize, max_degree: usize) -> bool {
    if max_degree < 2 {
        return false;
    }
    let threshold = max_degree as f64 / (max_degree as f64).ln();
    measurement_count as f64 > threshold
}
