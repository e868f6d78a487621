//! Top-level orchestration (spec §4.1, §4.2, §4.10, §4.11, §7): resolves
//! inputs, builds the working grid, tiles it, runs the read/compute
//! worker pipeline, writes outputs in order, and finalises statistics,
//! histograms and pyramids.
//!
//! `apply` always drives compute through a
//! [`crate::worker::thread_manager::ThreadComputeManager`], regardless of
//! `control.concurrency_style`. Subprocess and batch styles need a worker
//! command line and network addresses `Control` doesn't carry, so they
//! are not auto-wired here: build a
//! `SubprocessComputeManager`/`BatchComputeManager` directly and drive the
//! block loop with the lower-level pieces this module also exposes
//! (`build_working_grid`, `strip_overlap`).

use crate::assoc::{BlockArray, BlockAssociations, FilenameAssociations, SlotKey};
use crate::block::{BlockDefn, BlockList};
use crate::buffer::BlockBuffer;
use crate::control::{ActionMode, Control};
use crate::error::RiosError;
use crate::grid::{find_common_region, PixelGrid};
use crate::raster::{CreationOptions, PixelType, RasterDataset, RasterDriver};
use crate::stats::{HistogramConfig, PyramidAccumulator, SinglePassAccumulator};
use crate::timers::TimerMap;
use crate::worker::compute::{resolve_worker_count, AuxState, ComputeWorkerManager, UserFunction};
use crate::worker::read_pool::{build_tasks, ReadWorkerPool};
use crate::worker::thread_manager::{InputMetadata, ThreadComputeManager};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// What the caller gets back after a successful run: merged worker
/// timers, keyed the same way `TimerMap` already is, plus each worker's
/// final aux-state copy when one was requested (spec §6 `ApplierReturn`).
pub struct ApplierReturn {
    pub timers: TimerMap,
    pub other_args_list: Option<Vec<Box<dyn AuxState>>>,
}

/// Open every raster input once to gather the per-slot filename and
/// null value `ReaderInfo` exposes to the user function (spec §6
/// "info exposes... filename and null value... by array identity").
fn collect_input_metadata(driver: &dyn RasterDriver, inputs: &FilenameAssociations) -> Result<InputMetadata, RiosError> {
    let mut metadata = InputMetadata::new();
    for (name, seq, path) in inputs.iter_slots() {
        let key = match seq {
            Some(i) => SlotKey::indexed(name, i),
            None => SlotKey::single(name),
        };
        let band = seq.map(|s| s + 1).unwrap_or(1);
        let mut dataset = driver.open_read(path)?;
        let null_value = dataset.null_value(band);
        dataset.close()?;
        metadata.insert(key, (path.clone(), null_value));
    }
    Ok(metadata)
}

/// Open every raster input and derive the working grid (spec §4.1).
/// Vector inputs do not contribute and are not opened here; callers with
/// vector inputs should rasterise them onto the eventual grid via
/// [`crate::rasterize::RasterisationMgr`] before calling `apply`.
pub fn build_working_grid(driver: &dyn RasterDriver, inputs: &FilenameAssociations, control: &Control) -> Result<PixelGrid, RiosError> {
    let mut grids = Vec::new();
    for (_, _, path) in inputs.iter_slots() {
        let mut dataset = driver.open_read(path)?;
        grids.push(dataset.grid().clone());
        dataset.close()?;
    }
    let reference = match &control.reference_image {
        Some(path) => {
            let mut dataset = driver.open_read(path)?;
            let grid = dataset.grid().clone();
            dataset.close()?;
            Some(grid)
        }
        None => None,
    };
    find_common_region(&grids, control.footprint.into(), reference.as_ref())
}

/// Crop the core, unpadded region back out of a block array that was
/// read with an `overlap`-pixel halo, using only `(block, overlap)` —
/// the same quantities `padded_read_bounds` widened by (spec §6
/// "overlap / margin... stripped before writing").
pub fn strip_overlap(array: &BlockArray, block: &BlockDefn, overlap: u64) -> BlockArray {
    if overlap == 0 {
        return array.clone();
    }
    let row_off = block.top.min(overlap) as usize;
    let col_off = block.left.min(overlap) as usize;
    let core_rows = block.nrows as usize;
    let core_cols = block.ncols as usize;

    let mut out = BlockArray::zeros(array.bands, core_rows, core_cols);
    for b in 0..array.bands {
        for r in 0..core_rows {
            for c in 0..core_cols {
                out.set(b, r, c, array.get(b, row_off + r, col_off + c));
            }
        }
    }
    out
}

fn band_slice(array: &BlockArray, band: usize) -> BlockArray {
    let mut out = BlockArray::zeros(1, array.rows, array.cols);
    for r in 0..array.rows {
        for c in 0..array.cols {
            out.set(0, r, c, array.get(band, r, c));
        }
    }
    out
}

/// Per-output bookkeeping created lazily at the first block written to
/// that output (spec §4.11): the open dataset, and whichever of
/// statistics/histogram/pyramids are running in this pass.
struct OutputState {
    dataset: Box<dyn RasterDataset>,
    stats: Option<SinglePassAccumulator>,
    pyramid: Option<PyramidAccumulator>,
}

fn open_output(
    driver: &dyn RasterDriver,
    path: &std::path::Path,
    grid: &PixelGrid,
    array: &BlockArray,
    control: &Control,
    output_name: &str,
    pixel_type: PixelType,
) -> Result<OutputState, RiosError> {
    let options = CreationOptions {
        driver_name: control.driver_name_for(output_name).to_string(),
        options: control.creation_options.clone(),
    };
    let mut dataset = driver.create(path, grid, array.bands, pixel_type, &options)?;

    let null_value = control.null_value_for(output_name);
    if let Some(nv) = null_value {
        for band in 1..=array.bands {
            dataset.set_null_value(band, nv)?;
        }
    }

    let stats = match control.calc_stats_for(output_name) {
        ActionMode::SinglePass => {
            let null_values = vec![null_value; array.bands];
            let histogram = match control.calc_histogram_for(output_name) {
                ActionMode::SinglePass => HistogramConfig::for_datatype(pixel_type.stats_datatype()),
                _ => None,
            };
            Some(SinglePassAccumulator::new(array.bands, &null_values, histogram))
        }
        _ => None,
    };

    let pyramid = match control.calc_pyramids_for(output_name) {
        ActionMode::SinglePass if !control.overview_levels.is_empty() => Some(PyramidAccumulator::new(
            &control.overview_levels,
            array.bands,
            grid.rows as usize,
            grid.cols as usize,
        )),
        _ => None,
    };

    Ok(OutputState {
        dataset,
        stats,
        pyramid,
    })
}

fn write_output_block(state: &mut OutputState, block: &BlockDefn, array: &BlockArray) -> Result<(), RiosError> {
    for band in 0..array.bands {
        let plane = band_slice(array, band);
        state.dataset.write_block(band + 1, block.left, block.top, &plane)?;
        if let Some(stats) = state.stats.as_mut() {
            stats.bands[band].update(plane.band(0));
        }
    }
    if let Some(pyramid) = state.pyramid.as_mut() {
        pyramid.write_block(block.left, block.top, array);
    }
    Ok(())
}

/// Write out accumulated statistics and overviews and close the dataset
/// (spec §4.11 finalisation sequence). Colour-table, RAT and thematic/
/// layer-name finalisation are not handled here yet.
fn finalize_output(mut state: OutputState, _control: &Control, _output_name: &str) -> Result<(), RiosError> {
    if let Some(stats) = state.stats.take() {
        for (band, finalized) in stats.finalize().into_iter().enumerate() {
            state.dataset.write_statistics(band + 1, &finalized)?;
        }
    }
    if let Some(pyramid) = state.pyramid.take() {
        for level in pyramid.levels() {
            for band in 1..=level.bands {
                state.dataset.write_overview(band, level)?;
            }
        }
    }
    state.dataset.close()
}

/// Run the full pipeline (spec §2 data-flow paragraph): build the
/// working grid, tile it, start read and compute workers, pop completed
/// output blocks in block-list order, write and accumulate them, then
/// finalise every output.
///
/// Uses a [`ThreadComputeManager`] regardless of
/// `control.concurrency_style`; single-threaded operation is obtained by
/// partitioning into one sublist (spec §4.6 applies equally when there
/// is exactly one worker).
#[allow(clippy::too_many_arguments)]
pub fn apply(
    control: &Control,
    driver: Arc<dyn RasterDriver>,
    inputs: &FilenameAssociations,
    outputs: &FilenameAssociations,
    output_pixel_type: PixelType,
    user_fn: Arc<UserFunction>,
    aux_prototype: Option<Box<dyn AuxState>>,
) -> Result<ApplierReturn, RiosError> {
    crate::control::validate_control(control)?;

    let grid = build_working_grid(driver.as_ref(), inputs, control)?;
    let blocks = BlockList::tile(&grid, control.block_width, control.block_height);
    let input_metadata = Arc::new(collect_input_metadata(driver.as_ref(), inputs)?);

    let num_compute_workers = resolve_worker_count(control, blocks.len());
    let sublists = blocks.partition_by_stride(num_compute_workers);

    let input_buffer = Arc::new(BlockBuffer::new(num_compute_workers));
    let output_buffer = Arc::new(BlockBuffer::new(num_compute_workers));
    let empty_input_shape = BlockAssociations::from_spec(inputs);

    let buffer_timeout = Duration::from_secs(10);

    let read_pool = Arc::new(ReadWorkerPool::new(
        control.num_read_workers,
        build_tasks(blocks.as_slice(), inputs),
        driver.clone(),
        empty_input_shape,
        input_buffer.clone(),
        control.overlap,
        grid.rows,
        grid.cols,
        buffer_timeout,
    ));
    let read_handle = {
        let read_pool = read_pool.clone();
        std::thread::spawn(move || read_pool.run())
    };

    let mut compute = ThreadComputeManager::new(
        sublists,
        grid.clone(),
        blocks.len(),
        user_fn,
        Some(input_buffer.clone()),
        output_buffer.clone(),
        input_metadata,
        aux_prototype,
        buffer_timeout,
    );
    compute.start_workers(Duration::from_secs(60))?;

    let output_paths: BTreeMap<SlotKey, PathBuf> = outputs
        .iter_slots()
        .map(|(name, seq, path)| {
            let key = match seq {
                Some(i) => SlotKey::indexed(name, i),
                None => SlotKey::single(name),
            };
            (key, path.clone())
        })
        .collect();
    let mut open_outputs: BTreeMap<SlotKey, OutputState> = BTreeMap::new();

    let mut write_err = None;
    for &block in blocks.iter() {
        let result = output_buffer.pop_complete_block(block, buffer_timeout);
        let block_outputs = match result {
            Ok(v) => v,
            Err(e) => {
                write_err = Some(e);
                break;
            }
        };

        for key in block_outputs.keys().cloned().collect::<Vec<_>>() {
            let array = match block_outputs.get(&key) {
                Some(a) => a,
                None => continue,
            };
            let stripped = strip_overlap(array, &block, control.overlap);

            if !open_outputs.contains_key(&key) {
                let path = output_paths.get(&key).ok_or_else(|| RiosError::KeyMismatch {
                    name: key.name.clone(),
                })?;
                let state = open_output(driver.as_ref(), path, &grid, &stripped, control, &key.name, output_pixel_type)?;
                open_outputs.insert(key.clone(), state);
            }
            let state = open_outputs.get_mut(&key).expect("just inserted");
            if let Err(e) = write_output_block(state, &block, &stripped) {
                write_err = Some(e);
                break;
            }
        }
        if write_err.is_some() {
            break;
        }
    }

    let compute_outcome = compute.shutdown();
    let read_result = read_handle
        .join()
        .unwrap_or_else(|_| Err(RiosError::ProcessCancelled("read worker pool thread panicked".to_string())));

    if let Some(e) = write_err {
        return Err(e);
    }
    read_result?;
    let outcome = compute_outcome?;

    for (key, state) in open_outputs {
        finalize_output(state, control, &key.name)?;
    }

    Ok(ApplierReturn {
        timers: outcome.timers,
        other_args_list: outcome.other_args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GeoTransform;
    use crate::stats::{FinalizedStats, OverviewLevel};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemDataset {
        grid: PixelGrid,
        bands: usize,
        data: Vec<f64>,
    }

    impl MemDataset {
        fn new(grid: PixelGrid, bands: usize) -> Self {
            let len = bands * grid.rows as usize * grid.cols as usize;
            Self { grid, bands, data: vec![0.0; len] }
        }

        fn index(&self, band: usize, row: u64, col: u64) -> usize {
            let rows = self.grid.rows as usize;
            let cols = self.grid.cols as usize;
            (band * rows + row as usize) * cols + col as usize
        }
    }

    impl RasterDataset for MemDataset {
        fn grid(&self) -> &PixelGrid {
            &self.grid
        }
        fn num_bands(&self) -> usize {
            self.bands
        }
        fn pixel_type(&self, _band: usize) -> PixelType {
            PixelType::Float64
        }
        fn null_value(&self, _band: usize) -> Option<f64> {
            None
        }
        fn read_block(&self, band: usize, x_off: u64, y_off: u64, width: u64, height: u64) -> Result<BlockArray, RiosError> {
            let mut out = BlockArray::zeros(1, height as usize, width as usize);
            for r in 0..height {
                for c in 0..width {
                    let v = self.data[self.index(band - 1, y_off + r, x_off + c)];
                    out.set(0, r as usize, c as usize, v);
                }
            }
            Ok(out)
        }
        fn write_block(&mut self, band: usize, x_off: u64, y_off: u64, block: &BlockArray) -> Result<(), RiosError> {
            for r in 0..block.rows as u64 {
                for c in 0..block.cols as u64 {
                    let idx = self.index(band - 1, y_off + r, x_off + c);
                    self.data[idx] = block.get(0, r as usize, c as usize);
                }
            }
            Ok(())
        }
        fn set_null_value(&mut self, _band: usize, _value: f64) -> Result<(), RiosError> {
            Ok(())
        }
        fn set_band_name(&mut self, _band: usize, _name: &str) -> Result<(), RiosError> {
            Ok(())
        }
        fn write_statistics(&mut self, _band: usize, _stats: &FinalizedStats) -> Result<(), RiosError> {
            Ok(())
        }
        fn write_overview(&mut self, _band: usize, _level: &OverviewLevel) -> Result<(), RiosError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), RiosError> {
            Ok(())
        }
    }

    struct MemDriver {
        grid: PixelGrid,
        inputs: Mutex<HashMap<PathBuf, Vec<f64>>>,
    }

    impl RasterDriver for MemDriver {
        fn open_read(&self, path: &std::path::Path) -> Result<Box<dyn RasterDataset>, RiosError> {
            let inputs = self.inputs.lock().unwrap();
            let data = inputs.get(path).cloned().ok_or_else(|| RiosError::FileOpen {
                path: path.display().to_string(),
                reason: "no such input registered".to_string(),
            })?;
            Ok(Box::new(MemDataset {
                grid: self.grid.clone(),
                bands: 1,
                data,
            }))
        }
        fn create(&self, _path: &std::path::Path, grid: &PixelGrid, num_bands: usize, _pixel_type: PixelType, _options: &CreationOptions) -> Result<Box<dyn RasterDataset>, RiosError> {
            Ok(Box::new(MemDataset::new(grid.clone(), num_bands)))
        }
    }

    fn test_grid() -> PixelGrid {
        PixelGrid::new("EPSG:32601", GeoTransform::new(0.0, 1.0, 0.0, 0.0, 0.0, -1.0), 8, 8).unwrap()
    }

    #[test]
    fn identity_function_round_trips_pixel_values() {
        let grid = test_grid();
        let mut data = vec![0.0; 64];
        for (i, v) in data.iter_mut().enumerate() {
            *v = i as f64;
        }
        let mut inputs_map = HashMap::new();
        inputs_map.insert(PathBuf::from("in.tif"), data.clone());
        let driver: Arc<dyn RasterDriver> = Arc::new(MemDriver {
            grid: grid.clone(),
            inputs: Mutex::new(inputs_map),
        });

        let mut inputs = FilenameAssociations::new();
        inputs.set_single("in", PathBuf::from("in.tif"));
        let mut outputs = FilenameAssociations::new();
        outputs.set_single("out", PathBuf::from("out.tif"));

        let mut control = Control::default();
        control.block_width = 4;
        control.block_height = 4;
        control.num_compute_workers = 2;
        control.num_read_workers = 2;

        let user_fn: Arc<UserFunction> = Arc::new(|info, inputs, outputs, _aux| {
            assert_eq!(info.filename_for(&SlotKey::single("in")), Some(&PathBuf::from("in.tif")));
            let arr = inputs.get(&SlotKey::single("in")).unwrap().clone();
            outputs.fill(SlotKey::single("out"), arr);
            Ok(())
        });

        let result = apply(&control, driver, &inputs, &outputs, PixelType::Float64, user_fn, None).unwrap();
        assert!(result.timers.names().iter().any(|n| n == "userFunction"));
        assert!(result.other_args_list.is_none());
    }
}
