//! Overview (pyramid) accumulation: each configured level receives a
//! sub-sampled copy of every block written, at the matching offset, so no
//! second read pass over the full-resolution output is needed (spec §4.10,
//! §8).

use crate::assoc::BlockArray;

/// One overview level, identified by its sub-sampling factor.
#[derive(Debug, Clone)]
pub struct OverviewLevel {
    pub factor: u64,
    pub bands: usize,
    pub rows: usize,
    pub cols: usize,
    data: Vec<f64>,
}

impl OverviewLevel {
    pub fn new(factor: u64, bands: usize, full_rows: usize, full_cols: usize) -> Self {
        let rows = full_rows.div_ceil(factor as usize).max(1);
        let cols = full_cols.div_ceil(factor as usize).max(1);
        Self {
            factor,
            bands,
            rows,
            cols,
            data: vec![0.0; bands * rows * cols],
        }
    }

    #[inline]
    fn index(&self, band: usize, row: usize, col: usize) -> usize {
        (band * self.rows + row) * self.cols + col
    }

    /// Write a sub-sampled block at the overview offset corresponding to
    /// `(x_off, y_off)` in full-resolution pixel coordinates, clipping to
    /// this level's extent (spec §4.10).
    pub fn write_block(&mut self, x_off: u64, y_off: u64, block: &BlockArray) {
        let sub = block.subsample(self.factor);
        let ov_row_off = (y_off / self.factor) as usize;
        let ov_col_off = (x_off / self.factor) as usize;
        for b in 0..sub.bands.min(self.bands) {
            for r in 0..sub.rows {
                let row = ov_row_off + r;
                if row >= self.rows {
                    break;
                }
                for c in 0..sub.cols {
                    let col = ov_col_off + c;
                    if col >= self.cols {
                        break;
                    }
                    let idx = self.index(b, row, col);
                    self.data[idx] = sub.get(b, r, c);
                }
            }
        }
    }

    pub fn get(&self, band: usize, row: usize, col: usize) -> f64 {
        self.data[self.index(band, row, col)]
    }
}

/// Collects overview levels for one output, receiving a sub-sampled write
/// for each block as it passes through the single pass.
pub struct PyramidAccumulator {
    levels: Vec<OverviewLevel>,
}

impl PyramidAccumulator {
    pub fn new(factors: &[u64], bands: usize, full_rows: usize, full_cols: usize) -> Self {
        let levels = factors
            .iter()
            .map(|&f| OverviewLevel::new(f, bands, full_rows, full_cols))
            .collect();
        Self { levels }
    }

    pub fn levels(&self) -> &[OverviewLevel] {
        &self.levels
    }

    /// Feed one output block into every configured overview level.
    pub fn write_block(&mut self, x_off: u64, y_off: u64, block: &BlockArray) {
        for level in &mut self.levels {
            level.write_block(x_off, y_off, block);
        }
    }
}
