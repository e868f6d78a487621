//! Block coordinates and deterministic tiling of the working grid
//! (spec §3, §4.2).

use crate::grid::PixelGrid;
use serde::{Deserialize, Serialize};

/// A rectangular tile of the working grid, in working-grid-relative pixel
/// coordinates. Totally ordered by (top, left, nrows, ncols).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockDefn {
    pub top: u64,
    pub left: u64,
    pub nrows: u64,
    pub ncols: u64,
}

impl BlockDefn {
    pub fn new(top: u64, left: u64, nrows: u64, ncols: u64) -> Self {
        Self {
            top,
            left,
            nrows,
            ncols,
        }
    }

    pub fn bottom(&self) -> u64 {
        self.top + self.nrows
    }

    pub fn right(&self) -> u64 {
        self.left + self.ncols
    }
}

/// An ordered, deterministic sequence of blocks covering a working grid.
#[derive(Debug, Clone)]
pub struct BlockList {
    blocks: Vec<BlockDefn>,
}

impl BlockList {
    /// Generate the block list in row-major order, with edge blocks
    /// truncated to fit. Deterministic: the same `(grid, block_width,
    /// block_height)` always yields the same list (spec §4.2).
    pub fn tile(grid: &PixelGrid, block_width: u64, block_height: u64) -> Self {
        assert!(block_width > 0 && block_height > 0, "block size must be positive");

        let mut blocks = Vec::new();
        let mut top = 0u64;
        while top < grid.rows {
            let nrows = block_height.min(grid.rows - top);
            let mut left = 0u64;
            while left < grid.cols {
                let ncols = block_width.min(grid.cols - left);
                blocks.push(BlockDefn::new(top, left, nrows, ncols));
                left += block_width;
            }
            top += block_height;
        }
        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockDefn> {
        self.blocks.iter()
    }

    pub fn as_slice(&self) -> &[BlockDefn] {
        &self.blocks
    }

    /// Partition the block list into `num_workers` sublists by modular
    /// stride: worker *i* receives blocks at indices `i, i+N, i+2N, ...`
    /// (spec §4.4). Gives each worker a uniform spatial distribution and
    /// keeps disjoint write sets.
    pub fn partition_by_stride(&self, num_workers: usize) -> Vec<Vec<BlockDefn>> {
        assert!(num_workers > 0);
        let mut out = vec![Vec::new(); num_workers];
        for (idx, block) in self.blocks.iter().enumerate() {
            out[idx % num_workers].push(*block);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GeoTransform;

    fn grid(rows: u64, cols: u64) -> PixelGrid {
        PixelGrid::new(
            "EPSG:32601",
            GeoTransform::new(0.0, 1.0, 0.0, 0.0, 0.0, -1.0),
            rows,
            cols,
        )
        .unwrap()
    }

    #[test]
    fn tiling_covers_the_grid_exactly_once() {
        let g = grid(1000, 1000);
        let list = BlockList::tile(&g, 256, 256);
        assert_eq!(list.len(), 4 * 4);

        let mut covered = vec![false; (g.rows * g.cols) as usize];
        for b in list.iter() {
            for r in b.top..b.bottom() {
                for c in b.left..b.right() {
                    let idx = (r * g.cols + c) as usize;
                    assert!(!covered[idx], "pixel ({r},{c}) covered twice");
                    covered[idx] = true;
                }
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn non_multiple_dimensions_truncate_edge_blocks() {
        let g = grid(10, 10);
        let list = BlockList::tile(&g, 4, 4);
        // ceil(10/4) x ceil(10/4) = 3 x 3
        assert_eq!(list.len(), 9);
        let last = list.iter().max_by_key(|b| (b.top, b.left)).unwrap();
        assert_eq!(last.bottom(), 10);
        assert_eq!(last.right(), 10);
        assert_eq!(last.nrows, 2);
        assert_eq!(last.ncols, 2);
    }

    #[test]
    fn stride_partition_is_disjoint_and_complete() {
        let g = grid(100, 100);
        let list = BlockList::tile(&g, 10, 10);
        let parts = list.partition_by_stride(3);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, list.len());
        for (i, part) in parts.iter().enumerate() {
            for b in part {
                let idx = list.as_slice().iter().position(|x| x == b).unwrap();
                assert_eq!(idx % 3, i);
            }
        }
    }
}
