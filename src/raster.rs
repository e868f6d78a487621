//! Raster Driver abstraction.
//!
//! This module defines the interface the engine needs from whatever
//! concrete raster I/O library backs it (GDAL being the usual choice). The
//! engine itself never links against a specific raster library; it only
//! calls through [`RasterDriver`] and [`RasterDataset`].
//!
//! # Architecture
//!
//! Reads happen on the read-worker pool, writes happen on the (single)
//! output-writing path, and both go through the same trait so a test
//! double can stand in for a real driver without touching any other
//! module.
//!
//! # Error-as-value scope
//!
//! Some raster libraries (GDAL among them) offer a global switch between
//! raising exceptions and returning error codes. [`ErrorsAsValues`] is a
//! scope guard mirroring that switch: entering the scope requests
//! errors-as-values behaviour from the driver, and leaving it restores
//! whatever was in effect before, even on an early return or panic.

use crate::error::RiosError;
use crate::grid::PixelGrid;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Element datatype of a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    Byte,
    SignedByte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl PixelType {
    pub fn stats_datatype(self) -> crate::stats::DataType {
        match self {
            PixelType::Byte => crate::stats::DataType::Byte,
            PixelType::SignedByte => crate::stats::DataType::SignedByte,
            PixelType::Int16 => crate::stats::DataType::Int16,
            PixelType::UInt16 => crate::stats::DataType::UInt16,
            _ => crate::stats::DataType::Wider,
        }
    }
}

/// A raster dataset opened for reading or writing, abstracting over the
/// concrete driver. One instance is held per input/output per worker.
pub trait RasterDataset: Send {
    fn grid(&self) -> &PixelGrid;
    fn num_bands(&self) -> usize;
    fn pixel_type(&self, band: usize) -> PixelType;
    fn null_value(&self, band: usize) -> Option<f64>;

    /// Read a block in the dataset's own pixel space.
    fn read_block(
        &self,
        band: usize,
        x_off: u64,
        y_off: u64,
        width: u64,
        height: u64,
    ) -> Result<crate::assoc::BlockArray, RiosError>;

    /// Write a block in the dataset's own pixel space.
    fn write_block(
        &mut self,
        band: usize,
        x_off: u64,
        y_off: u64,
        block: &crate::assoc::BlockArray,
    ) -> Result<(), RiosError>;

    fn set_null_value(&mut self, band: usize, value: f64) -> Result<(), RiosError>;
    fn set_band_name(&mut self, band: usize, name: &str) -> Result<(), RiosError>;

    fn write_statistics(&mut self, band: usize, stats: &crate::stats::FinalizedStats) -> Result<(), RiosError>;
    fn write_overview(&mut self, band: usize, level: &crate::stats::OverviewLevel) -> Result<(), RiosError>;

    fn close(&mut self) -> Result<(), RiosError>;
}

/// Creation options for a new output dataset: driver short name plus
/// arbitrary key/value creation options (spec §6, e.g. GDAL's `-co`).
#[derive(Debug, Clone, Default)]
pub struct CreationOptions {
    pub driver_name: String,
    pub options: Vec<(String, String)>,
}

/// Opens and creates datasets. One instance per run, shared (behind an
/// `Arc`) across read workers; creation of outputs happens once up front
/// on the driving thread.
pub trait RasterDriver: Send + Sync {
    fn open_read(&self, path: &Path) -> Result<Box<dyn RasterDataset>, RiosError>;

    fn create(
        &self,
        path: &Path,
        grid: &PixelGrid,
        num_bands: usize,
        pixel_type: PixelType,
        options: &CreationOptions,
    ) -> Result<Box<dyn RasterDataset>, RiosError>;
}

/// RAII scope guard requesting errors-as-values behaviour from the
/// underlying driver for its lifetime, restoring the previous setting on
/// drop. Grounded in the original library's global
/// `UseExceptions`/`DontUseExceptions` toggle, which this replaces with a
/// non-global, panic-safe scope.
pub struct ErrorsAsValues {
    restore: Box<dyn FnOnce() + Send>,
}

impl ErrorsAsValues {
    /// `enter` is called to request errors-as-values mode and must return
    /// a closure that restores the previous mode.
    pub fn enter<F>(enter: impl FnOnce() -> F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let restore = enter();
        Self {
            restore: Box::new(restore),
        }
    }
}

impl Drop for ErrorsAsValues {
    fn drop(&mut self) {
        let restore = std::mem::replace(&mut self.restore, Box::new(|| {}));
        restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn errors_as_values_restores_previous_state_on_drop() {
        let using_exceptions = Arc::new(AtomicBool::new(true));
        {
            let flag = using_exceptions.clone();
            let _guard = ErrorsAsValues::enter(move || {
                let was = flag.swap(false, Ordering::SeqCst);
                let flag = flag.clone();
                move || {
                    flag.store(was, Ordering::SeqCst);
                }
            });
            assert!(!using_exceptions.load(Ordering::SeqCst));
        }
        assert!(using_exceptions.load(Ordering::SeqCst));
    }
}
