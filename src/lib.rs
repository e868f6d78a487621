//! riostream - Concurrent raster block-pipeline engine
//!
//! riostream applies a user-supplied per-block function across one or more
//! input rasters, reconciling heterogeneous extents/resolutions/projections
//! onto a common working grid, and drives a concurrent block pipeline (read
//! workers -> bounded buffers -> compute workers -> ordered writer) with
//! single-pass statistics, histograms and pyramids.
//!
//! # Architecture
//!
//! - **Working grid & tiling**: `grid`, `block`
//! - **Named multi-file inputs/outputs**: `assoc`
//! - **Bounded producer/consumer buffers**: `buffer`
//! - **Read and compute worker pools** in three concurrency styles
//!   (threads, subprocess, batch): `worker`
//! - **Networked compute workers**: `network`
//! - **Single-pass statistics, histograms, pyramids**: `stats`
//! - **Raster driver abstraction**: `raster`
//! - **Vector-to-raster rasterisation cache**: `rasterize`
//! - **Raster attribute tables**: `rat`
//! - **Top-level orchestration**: `applier`

pub mod applier;
pub mod assoc;
pub mod block;
pub mod buffer;
pub mod control;
pub mod error;
pub mod grid;
pub mod network;
pub mod raster;
pub mod rasterize;
pub mod rat;
pub mod stats;
pub mod tempfiles;
pub mod timers;
pub mod worker;

// Re-export commonly used types
pub use applier::{apply, ApplierReturn};
pub use control::Control;
pub use error::RiosError;

/// Result type used throughout riostream
pub type Result<T> = std::result::Result<T, RiosError>;
