//! Per-band running min/max/sum/ssq/count plus a direct-binned integer
//! histogram (spec §3 `SinglePassAccumulator`, §4.10, §8).

use super::DataType;
use serde::{Deserialize, Serialize};

/// A sentinel used internally in place of a missing null value, chosen
/// outside the representable data range so it never collides with a real
/// sample (spec §3 `histNullval`).
const NO_NULL_SENTINEL: f64 = f64::NAN;

/// Histogram configuration fixed at first write.
#[derive(Debug, Clone, Copy)]
pub struct HistogramConfig {
    pub min_bin_value: i64,
    pub num_bins: u32,
}

impl HistogramConfig {
    pub fn for_datatype(dt: DataType) -> Option<Self> {
        dt.histogram_bins().map(|(min_bin_value, num_bins)| Self {
            min_bin_value,
            num_bins,
        })
    }
}

/// Running accumulator state for a single band of a single output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandAccumulator {
    min: f64,
    max: f64,
    sum: f64,
    sum_sq: f64,
    count: u64,
    #[serde(skip)]
    histogram: Option<Vec<u64>>,
    #[serde(skip)]
    hist_config: Option<(i64, u32)>,
    null_value: Option<f64>,
}

impl BandAccumulator {
    pub fn new(null_value: Option<f64>, histogram: Option<HistogramConfig>) -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            sum_sq: 0.0,
            count: 0,
            histogram: histogram.map(|h| vec![0u64; h.num_bins as usize]),
            hist_config: histogram.map(|h| (h.min_bin_value, h.num_bins)),
            null_value,
        }
    }

    /// Fold one band-plane of a block into the running accumulator
    /// (spec §4.10 "per block, per band"). `samples` is the flattened
    /// row-major plane for this band.
    pub fn update(&mut self, samples: &[f64]) {
        let effective_null = self.null_value.unwrap_or(NO_NULL_SENTINEL);
        let hist_config = self.hist_config;
        for &v in samples {
            if !effective_null.is_nan() && v == effective_null {
                continue;
            }
            self.count += 1;
            self.sum += v;
            self.sum_sq += v * v;
            if v < self.min {
                self.min = v;
            }
            if v > self.max {
                self.max = v;
            }
            if let (Some((min_bin, num_bins)), Some(hist)) = (hist_config, self.histogram.as_mut()) {
                let idx = v as i64 - min_bin;
                if idx >= 0 && (idx as u32) < num_bins {
                    hist[idx as usize] += 1;
                }
            }
        }
    }

    pub fn merge(&mut self, other: &BandAccumulator) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        if let (Some(a), Some(b)) = (self.histogram.as_mut(), other.histogram.as_ref()) {
            for (x, y) in a.iter_mut().zip(b.iter()) {
                *x += y;
            }
        }
    }

    /// Finalise: mean and population standard deviation, clamping a
    /// possibly-negative variance (floating point error) to zero before
    /// the square root (spec §3, §8).
    pub fn finalize(&self) -> FinalizedStats {
        if self.count == 0 {
            return FinalizedStats {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                stddev: 0.0,
                count: 0,
                histogram: None,
                mode: None,
                median: None,
            };
        }
        let mean = self.sum / self.count as f64;
        let variance = (self.sum_sq / self.count as f64) - mean * mean;
        let stddev = variance.max(0.0).sqrt();

        let (histogram, mode, median) = match (&self.histogram, self.hist_config) {
            (Some(hist), Some((min_bin, _))) => {
                let narrowed = narrow_to_nonzero_range(hist);
                let mode_bin = hist.iter().enumerate().max_by_key(|(_, &c)| c).map(|(i, _)| i);
                let half = self.count / 2;
                let mut cumulative = 0u64;
                let mut median_bin = None;
                for (i, &c) in hist.iter().enumerate() {
                    cumulative += c;
                    if cumulative >= half {
                        median_bin = Some(i);
                        break;
                    }
                }
                (
                    Some(narrowed),
                    mode_bin.map(|i| i as i64 + min_bin),
                    median_bin.map(|i| i as i64 + min_bin),
                )
            }
            _ => (None, None, None),
        };

        FinalizedStats {
            min: self.min,
            max: self.max,
            mean,
            stddev,
            count: self.count,
            histogram,
            mode,
            median,
        }
    }
}

/// Histogram limits narrowed to the first and last non-zero bins before
/// writing (spec §4.10).
fn narrow_to_nonzero_range(hist: &[u64]) -> Vec<u64> {
    let first = hist.iter().position(|&c| c > 0);
    let last = hist.iter().rposition(|&c| c > 0);
    match (first, last) {
        (Some(f), Some(l)) => hist[f..=l].to_vec(),
        _ => Vec::new(),
    }
}

/// Finalised per-band result, ready to be written to the output band.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub count: u64,
    pub histogram: Option<Vec<u64>>,
    pub mode: Option<i64>,
    pub median: Option<i64>,
}

/// All per-band accumulators for one output, plus the pyramid accumulator
/// sharing the same block-write pass.
pub struct SinglePassAccumulator {
    pub bands: Vec<BandAccumulator>,
}

impl SinglePassAccumulator {
    pub fn new(num_bands: usize, null_values: &[Option<f64>], histogram: Option<HistogramConfig>) -> Self {
        let bands = (0..num_bands)
            .map(|i| BandAccumulator::new(null_values.get(i).copied().flatten(), histogram))
            .collect();
        Self { bands }
    }

    pub fn merge(&mut self, other: &SinglePassAccumulator) {
        for (a, b) in self.bands.iter_mut().zip(other.bands.iter()) {
            a.merge(b);
        }
    }

    pub fn finalize(&self) -> Vec<FinalizedStats> {
        self.bands.iter().map(BandAccumulator::finalize).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_stddev_match_definition() {
        let mut acc = BandAccumulator::new(None, None);
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        acc.update(&data);
        let stats = acc.finalize();
        assert_eq!(stats.count, 5);
        assert!((stats.mean - 3.0).abs() < 1e-9);
        let expected_var = data.iter().map(|v| (v - 3.0).powi(2)).sum::<f64>() / 5.0;
        assert!((stats.stddev - expected_var.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn null_value_excludes_matching_samples_only_when_set() {
        let mut with_null = BandAccumulator::new(Some(0.0), None);
        with_null.update(&[0.0, 1.0, 2.0]);
        assert_eq!(with_null.finalize().count, 2);

        let mut without_null = BandAccumulator::new(None, None);
        without_null.update(&[0.0, 1.0, 2.0]);
        assert_eq!(without_null.finalize().count, 3);
    }

    #[test]
    fn histogram_bins_and_mode_median() {
        let config = HistogramConfig::for_datatype(DataType::Byte).unwrap();
        let mut acc = BandAccumulator::new(None, Some(config));
        acc.update(&[0.0, 0.0, 1.0, 1.0, 1.0, 255.0]);
        let stats = acc.finalize();
        assert_eq!(stats.mode, Some(1));
        assert_eq!(stats.count, 6);
        let hist = stats.histogram.unwrap();
        assert_eq!(hist.first().copied(), Some(2));
        assert_eq!(hist.last().copied(), Some(1));
    }

    #[test]
    fn merge_is_equivalent_to_single_pass_over_concatenated_data() {
        let mut a = BandAccumulator::new(None, None);
        let mut b = BandAccumulator::new(None, None);
        a.update(&[1.0, 2.0, 3.0]);
        b.update(&[4.0, 5.0, 6.0]);
        a.merge(&b);

        let mut whole = BandAccumulator::new(None, None);
        whole.update(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        assert_eq!(a.finalize(), whole.finalize());
    }

    #[test]
    fn signed_byte_histogram_covers_negative_range() {
        let config = HistogramConfig::for_datatype(DataType::SignedByte).unwrap();
        let mut acc = BandAccumulator::new(None, Some(config));
        let samples: Vec<f64> = (-128..=127).map(|v| v as f64).collect();
        acc.update(&samples);
        let stats = acc.finalize();
        assert_eq!(stats.min, -128.0);
        assert_eq!(stats.max, 127.0);
        let hist = stats.histogram.unwrap();
        assert_eq!(hist.len(), 256);
        assert!(hist.iter().all(|&c| c == 1));
    }

    #[test]
    fn sample_out_of_histogram_range_is_skipped() {
        let config = HistogramConfig::for_datatype(DataType::Byte).unwrap();
        let mut acc = BandAccumulator::new(None, Some(config));
        acc.update(&[-1.0, 256.0, 5.0]);
        let stats = acc.finalize();
        // stats count includes all non-null samples, histogram only counts in-range ones
        assert_eq!(stats.count, 3);
        let hist = stats.histogram.unwrap();
        assert_eq!(hist.iter().sum::<u64>(), 1);
    }
}
