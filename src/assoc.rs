//! Dynamic per-object attributes: `FilenameAssociations` map a symbolic
//! name to either a single filename or an ordered sequence of filenames;
//! `BlockAssociations` carry the same shape but with 3-D numeric array
//! payloads per block (spec §3).
//!
//! Design-note mapping (spec §9): names known only at run time map to a
//! struct holding `HashMap<String, FileEntry>` with accessors supporting
//! both `(name)` and `(name, seq)` indexing, rather than Python's dynamic
//! attribute access.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A single symbolic name's association: one path, or an ordered list.
#[derive(Debug, Clone, PartialEq)]
pub enum FileEntry {
    Single(PathBuf),
    List(Vec<PathBuf>),
}

/// A mapping from symbolic name to filename(s); used for both InputSpec
/// and OutputSpec.
#[derive(Debug, Clone, Default)]
pub struct FilenameAssociations {
    entries: BTreeMap<String, FileEntry>,
}

impl FilenameAssociations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_single(&mut self, name: impl Into<String>, path: PathBuf) {
        self.entries.insert(name.into(), FileEntry::Single(path));
    }

    pub fn set_list(&mut self, name: impl Into<String>, paths: Vec<PathBuf>) {
        self.entries.insert(name.into(), FileEntry::List(paths));
    }

    pub fn get(&self, name: &str) -> Option<&FileEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iteration yields `(symbolicName, seqNum|None, filename)`: for a
    /// single path `seqNum` is absent; for a list it is the zero-based
    /// index (spec §3).
    pub fn iter_slots(&self) -> impl Iterator<Item = (&str, Option<usize>, &PathBuf)> {
        self.entries.iter().flat_map(|(name, entry)| -> Box<dyn Iterator<Item = (&str, Option<usize>, &PathBuf)>> {
            match entry {
                FileEntry::Single(path) => Box::new(std::iter::once((name.as_str(), None, path))),
                FileEntry::List(paths) => {
                    Box::new(paths.iter().enumerate().map(move |(i, p)| (name.as_str(), Some(i), p)))
                }
            }
        })
    }
}

/// A single input/output slot's identity within a block: symbolic name
/// plus an optional sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub name: String,
    pub seq: Option<usize>,
}

impl SlotKey {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seq: None,
        }
    }

    pub fn indexed(name: impl Into<String>, seq: usize) -> Self {
        Self {
            name: name.into(),
            seq: Some(seq),
        }
    }
}

/// A 3-D numeric array `(bands, rows, cols)`, stored row-major within each
/// band. Kept generic over pixel storage via `f64` so the engine itself
/// never needs to know about GDAL-style datatype enums: the concrete
/// Raster Driver converts to/from its native type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockArray {
    pub bands: usize,
    pub rows: usize,
    pub cols: usize,
    data: Vec<f64>,
}

impl BlockArray {
    pub fn zeros(bands: usize, rows: usize, cols: usize) -> Self {
        Self {
            bands,
            rows,
            cols,
            data: vec![0.0; bands * rows * cols],
        }
    }

    pub fn from_vec(bands: usize, rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), bands * rows * cols);
        Self { bands, rows, cols, data }
    }

    #[inline]
    pub fn get(&self, band: usize, row: usize, col: usize) -> f64 {
        self.data[self.index(band, row, col)]
    }

    #[inline]
    pub fn set(&mut self, band: usize, row: usize, col: usize, value: f64) {
        let idx = self.index(band, row, col);
        self.data[idx] = value;
    }

    #[inline]
    fn index(&self, band: usize, row: usize, col: usize) -> usize {
        (band * self.rows + row) * self.cols + col
    }

    pub fn band(&self, band: usize) -> &[f64] {
        let start = band * self.rows * self.cols;
        &self.data[start..start + self.rows * self.cols]
    }

    /// Sub-sample this block at stride `level`, offset `level/2`, matching
    /// the pyramid accumulator's sampling rule (spec §4.10): `arr[L/2 ::
    /// L, L/2 :: L]`.
    pub fn subsample(&self, level: u64) -> BlockArray {
        let level = level as usize;
        let offset = level / 2;
        let sub_rows = if self.rows > offset { (self.rows - offset).div_ceil(level) } else { 0 };
        let sub_cols = if self.cols > offset { (self.cols - offset).div_ceil(level) } else { 0 };
        let mut out = BlockArray::zeros(self.bands, sub_rows, sub_cols);
        for b in 0..self.bands {
            for (sr, r) in (offset..self.rows).step_by(level).enumerate() {
                for (sc, c) in (offset..self.cols).step_by(level).enumerate() {
                    out.set(b, sr, sc, self.get(b, r, c));
                }
            }
        }
        out
    }
}

/// Per-block container with the same shape as a `FilenameAssociations`:
/// each leaf is a [`BlockArray`]. Pre-allocated empty from a spec; leaves
/// become populated as reads complete.
#[derive(Debug, Clone, Default)]
pub struct BlockAssociations {
    slots: BTreeMap<SlotKey, Option<BlockArray>>,
}

impl BlockAssociations {
    /// Pre-allocate empty slots matching `spec`'s shape.
    pub fn from_spec(spec: &FilenameAssociations) -> Self {
        let mut slots = BTreeMap::new();
        for (name, entry) in &spec.entries {
            match entry {
                FileEntry::Single(_) => {
                    slots.insert(SlotKey::single(name.clone()), None);
                }
                FileEntry::List(paths) => {
                    for i in 0..paths.len() {
                        slots.insert(SlotKey::indexed(name.clone(), i), None);
                    }
                }
            }
        }
        Self { slots }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_missing(&self) -> usize {
        self.slots.values().filter(|v| v.is_none()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.num_missing() == 0
    }

    /// Fill one slot. Returns `true` if this transitioned a previously
    /// empty slot to populated (the `addBlockData` contract of spec §3).
    pub fn fill(&mut self, key: SlotKey, array: BlockArray) -> bool {
        let was_missing = matches!(self.slots.get(&key), Some(None));
        self.slots.insert(key, Some(array));
        was_missing
    }

    pub fn get(&self, key: &SlotKey) -> Option<&BlockArray> {
        self.slots.get(key).and_then(|v| v.as_ref())
    }

    pub fn get_mut(&mut self, key: &SlotKey) -> Option<&mut BlockArray> {
        self.slots.get_mut(key).and_then(|v| v.as_mut())
    }

    pub fn keys(&self) -> impl Iterator<Item = &SlotKey> {
        self.slots.keys()
    }

    pub fn iter_populated(&self) -> impl Iterator<Item = (&SlotKey, &BlockArray)> {
        self.slots.iter().filter_map(|(k, v)| v.as_ref().map(|a| (k, a)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_list_slots_iterate_with_correct_seq() {
        let mut spec = FilenameAssociations::new();
        spec.set_single("dem", PathBuf::from("dem.tif"));
        spec.set_list("bands", vec![PathBuf::from("b1.tif"), PathBuf::from("b2.tif")]);

        let mut slots: Vec<_> = spec.iter_slots().collect();
        slots.sort();
        assert_eq!(slots.len(), 3);
        assert!(slots.contains(&("bands", Some(0), &PathBuf::from("b1.tif"))));
        assert!(slots.contains(&("dem", None, &PathBuf::from("dem.tif"))));
    }

    #[test]
    fn block_associations_tracks_missing_until_filled() {
        let mut spec = FilenameAssociations::new();
        spec.set_single("dem", PathBuf::from("dem.tif"));
        spec.set_list("bands", vec![PathBuf::from("b1.tif"), PathBuf::from("b2.tif")]);

        let mut assoc = BlockAssociations::from_spec(&spec);
        assert_eq!(assoc.num_missing(), 3);
        assert!(!assoc.is_complete());

        assoc.fill(SlotKey::single("dem"), BlockArray::zeros(1, 4, 4));
        assoc.fill(SlotKey::indexed("bands", 0), BlockArray::zeros(1, 4, 4));
        assert_eq!(assoc.num_missing(), 1);

        assoc.fill(SlotKey::indexed("bands", 1), BlockArray::zeros(1, 4, 4));
        assert!(assoc.is_complete());
    }

    #[test]
    fn subsample_matches_stride_rule() {
        let mut arr = BlockArray::zeros(1, 4, 4);
        for r in 0..4 {
            for c in 0..4 {
                arr.set(0, r, c, (r * 4 + c) as f64);
            }
        }
        let sub = arr.subsample(2);
        // offset = 1, stride = 2 -> rows/cols {1, 3}
        assert_eq!(sub.rows, 2);
        assert_eq!(sub.cols, 2);
        assert_eq!(sub.get(0, 0, 0), arr.get(0, 1, 1));
        assert_eq!(sub.get(0, 1, 1), arr.get(0, 3, 3));
    }
}
