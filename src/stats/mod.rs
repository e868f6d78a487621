//! Single-pass statistics, histogram and pyramid accumulation (spec §3,
//! §4.10). Decisions about whether to run each of the three are made once,
//! per output, at first write, then held fixed for the run.

mod accumulator;
mod pyramid;

pub use accumulator::{BandAccumulator, FinalizedStats, HistogramConfig, SinglePassAccumulator};
pub use pyramid::{OverviewLevel, PyramidAccumulator};

/// Element datatype of an output band, as far as the single-pass engine
/// needs to know: whether (and how) a direct-binned histogram applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Byte,
    SignedByte,
    Int16,
    UInt16,
    Wider,
}

impl DataType {
    /// Number of histogram bins for this type, or `None` if a single-pass
    /// histogram is disabled for it (spec §3 `SinglePassAccumulator`).
    pub fn histogram_bins(self) -> Option<(i64, u32)> {
        match self {
            DataType::Byte => Some((0, 256)),
            DataType::SignedByte => Some((-128, 256)),
            DataType::Int16 => Some((i16::MIN as i64, 65_536)),
            DataType::UInt16 => Some((0, 65_536)),
            DataType::Wider => None,
        }
    }
}

/// Tri-state control for an optional single-pass action (spec §6): run it
/// in the single pass, delegate to the driver's own post-pass facility, or
/// omit it entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionMode {
    SinglePass,
    Driver,
    #[default]
    Omit,
}
