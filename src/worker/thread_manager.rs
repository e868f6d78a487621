//! Thread compute-worker manager (spec §4.6): workers are co-hosted in
//! the driver process and share the `BlockBuffer`s directly. The barrier
//! is present but trivial — every worker starts as soon as it is
//! spawned.

use super::compute::{AuxState, ComputeWorkerManager, ComputeWorkerOutcome, ExceptionQueue, ForceExit, ReaderInfo, UserFunction};
use crate::assoc::{BlockAssociations, SlotKey};
use crate::block::BlockDefn;
use crate::buffer::BlockBuffer;
use crate::error::{RiosError, WorkerErrorRecord, WorkerKind};
use crate::grid::PixelGrid;
use crate::timers::TimerMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-input filename and null value, looked up by the same `SlotKey` an
/// input array is fetched with (spec §6 `info`).
pub type InputMetadata = BTreeMap<SlotKey, (PathBuf, Option<f64>)>;

/// Runs the compute-worker inner loop (spec §4.5) for one worker's
/// sublist, sharing `BlockBuffer`s directly with the driver and other
/// workers.
pub struct ThreadComputeManager {
    sublists: Vec<Vec<BlockDefn>>,
    grid: PixelGrid,
    total_blocks: usize,
    user_fn: Arc<UserFunction>,
    input_buffer: Option<Arc<BlockBuffer>>,
    output_buffer: Arc<BlockBuffer>,
    input_metadata: Arc<InputMetadata>,
    aux_prototype: Box<dyn AuxState>,
    aux_requested: bool,
    aux_results: Arc<Mutex<Vec<Option<Box<dyn AuxState>>>>>,
    force_exit: Arc<ForceExit>,
    exceptions: Arc<ExceptionQueue>,
    timers: Arc<TimerMap>,
    pop_timeout: Duration,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadComputeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sublists: Vec<Vec<BlockDefn>>,
        grid: PixelGrid,
        total_blocks: usize,
        user_fn: Arc<UserFunction>,
        input_buffer: Option<Arc<BlockBuffer>>,
        output_buffer: Arc<BlockBuffer>,
        input_metadata: Arc<InputMetadata>,
        aux_prototype: Option<Box<dyn AuxState>>,
        pop_timeout: Duration,
    ) -> Self {
        let aux_requested = aux_prototype.is_some();
        let num_workers = sublists.len();
        Self {
            sublists,
            grid,
            total_blocks,
            user_fn,
            input_buffer,
            output_buffer,
            input_metadata,
            aux_prototype: aux_prototype.unwrap_or_else(|| Box::new(())),
            aux_requested,
            aux_results: Arc::new(Mutex::new((0..num_workers).map(|_| None).collect())),
            force_exit: Arc::new(ForceExit::new()),
            exceptions: Arc::new(ExceptionQueue::new()),
            timers: Arc::new(TimerMap::new()),
            pop_timeout,
            handles: Vec::new(),
        }
    }

    pub fn force_exit(&self) -> Arc<ForceExit> {
        self.force_exit.clone()
    }
}

impl ComputeWorkerManager for ThreadComputeManager {
    fn start_workers(&mut self, _barrier_timeout: Duration) -> Result<(), RiosError> {
        for (worker_id, sublist) in self.sublists.clone().into_iter().enumerate() {
            let grid = self.grid.clone();
            let total_blocks = self.total_blocks;
            let user_fn = self.user_fn.clone();
            let input_buffer = self.input_buffer.clone();
            let output_buffer = self.output_buffer.clone();
            let force_exit = self.force_exit.clone();
            let exceptions = self.exceptions.clone();
            let timers = self.timers.clone();
            let pop_timeout = self.pop_timeout;
            let input_metadata = self.input_metadata.clone();
            let aux = self.aux_prototype.clone_box();
            let aux_results = self.aux_results.clone();

            let handle = std::thread::spawn(move || {
                run_worker_loop(
                    worker_id,
                    &sublist,
                    &grid,
                    total_blocks,
                    user_fn.as_ref(),
                    input_buffer.as_deref(),
                    &output_buffer,
                    &input_metadata,
                    aux,
                    &aux_results,
                    &force_exit,
                    &exceptions,
                    &timers,
                    pop_timeout,
                );
            });
            self.handles.push(handle);
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<ComputeWorkerOutcome, RiosError> {
        self.force_exit.set();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(record) = self.exceptions.first() {
            return Err(RiosError::from(record));
        }
        let other_args = if self.aux_requested {
            let mut results = self.aux_results.lock().unwrap();
            Some(results.drain(..).map(|a| a.unwrap_or_else(|| Box::new(()) as Box<dyn AuxState>)).collect())
        } else {
            None
        };
        Ok(ComputeWorkerOutcome {
            timers: TimerMap::from_snapshot(self.timers.snapshot()),
            other_args,
        })
    }

    fn exceptions(&self) -> &ExceptionQueue {
        &self.exceptions
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker_loop(
    worker_id: usize,
    sublist: &[BlockDefn],
    grid: &PixelGrid,
    total_blocks: usize,
    user_fn: &UserFunction,
    input_buffer: Option<&BlockBuffer>,
    output_buffer: &BlockBuffer,
    input_metadata: &InputMetadata,
    mut aux: Box<dyn AuxState>,
    aux_results: &Mutex<Vec<Option<Box<dyn AuxState>>>>,
    force_exit: &ForceExit,
    exceptions: &ExceptionQueue,
    timers: &TimerMap,
    pop_timeout: Duration,
) {
    let filenames: BTreeMap<SlotKey, PathBuf> = input_metadata.iter().map(|(k, (path, _))| (k.clone(), path.clone())).collect();
    let null_values: BTreeMap<SlotKey, f64> = input_metadata.iter().filter_map(|(k, (_, nv))| nv.map(|v| (k.clone(), v))).collect();

    for (idx, &block) in sublist.iter().enumerate() {
        if force_exit.is_set() {
            aux_results.lock().unwrap()[worker_id] = Some(aux);
            return;
        }

        let inputs = match input_buffer {
            Some(buf) => match buf.pop_complete_block(block, pop_timeout) {
                Ok(v) => v,
                Err(e) => {
                    exceptions.push(worker_error(worker_id, &e));
                    force_exit.set();
                    aux_results.lock().unwrap()[worker_id] = Some(aux);
                    return;
                }
            },
            None => BlockAssociations::default(),
        };

        let info = ReaderInfo {
            block,
            grid: grid.clone(),
            block_index: idx,
            total_blocks,
            filenames: filenames.clone(),
            null_values: null_values.clone(),
        };

        let mut outputs = BlockAssociations::default();
        let call_result = {
            let _guard = timers.start("userFunction");
            user_fn(&info, &inputs, &mut outputs, aux.as_mut())
        };

        if let Err(e) = call_result {
            exceptions.push(worker_error(worker_id, &e));
            force_exit.set();
            aux_results.lock().unwrap()[worker_id] = Some(aux);
            return;
        }

        if let Err(e) = output_buffer.insert_complete_block(block, outputs, pop_timeout) {
            exceptions.push(worker_error(worker_id, &e));
            force_exit.set();
            aux_results.lock().unwrap()[worker_id] = Some(aux);
            return;
        }
    }

    aux_results.lock().unwrap()[worker_id] = Some(aux);
}

fn worker_error(worker_id: usize, err: &RiosError) -> WorkerErrorRecord {
    WorkerErrorRecord {
        exception_type: "RiosError".to_string(),
        message: err.to_string(),
        traceback: String::new(),
        worker_kind: WorkerKind::Compute,
        worker_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc::{BlockArray, FilenameAssociations, SlotKey};
    use crate::block::BlockList;
    use crate::grid::GeoTransform;

    fn test_grid() -> PixelGrid {
        PixelGrid::new("EPSG:32601", GeoTransform::new(0.0, 1.0, 0.0, 0.0, 0.0, -1.0), 4, 4).unwrap()
    }

    #[test]
    fn doubling_function_runs_across_all_blocks() {
        let grid = test_grid();
        let blocks = BlockList::tile(&grid, 2, 2);
        let sublists = blocks.partition_by_stride(2);

        let input_spec = {
            let mut s = FilenameAssociations::new();
            s.set_single("in", std::path::PathBuf::from("in.tif"));
            s
        };
        let input_buffer = Arc::new(BlockBuffer::new(2));
        for &block in blocks.iter() {
            let mut value = BlockAssociations::from_spec(&input_spec);
            value.fill(SlotKey::single("in"), BlockArray::zeros(1, block.nrows as usize, block.ncols as usize));
            input_buffer.insert_complete_block(block, value, Duration::from_secs(1)).unwrap();
        }
        let output_buffer = Arc::new(BlockBuffer::new(2));

        let user_fn: Arc<UserFunction> = Arc::new(|_info, inputs, outputs, _aux| {
            let arr = inputs.get(&SlotKey::single("in")).unwrap();
            let mut doubled = arr.clone();
            for b in 0..doubled.bands {
                for r in 0..doubled.rows {
                    for c in 0..doubled.cols {
                        doubled.set(b, r, c, arr.get(b, r, c) * 2.0);
                    }
                }
            }
            outputs.fill(SlotKey::single("out"), doubled);
            Ok(())
        });

        let mut mgr = ThreadComputeManager::new(
            sublists,
            grid,
            blocks.len(),
            user_fn,
            Some(input_buffer),
            output_buffer.clone(),
            Arc::new(BTreeMap::new()),
            None,
            Duration::from_secs(1),
        );
        mgr.start_workers(Duration::from_secs(1)).unwrap();
        let outcome = mgr.shutdown().unwrap();
        assert!(outcome.timers.total("userFunction") > Duration::ZERO);
        assert!(outcome.other_args.is_none());

        for &block in blocks.iter() {
            let result = output_buffer.pop_complete_block(block, Duration::from_secs(1)).unwrap();
            assert!(result.get(&SlotKey::single("out")).is_some());
        }
    }

    /// Grounds spec's `otherArgsList` requirement: each worker gets its
    /// own deep copy of a counter, and the per-worker counts returned
    /// sum to the total number of blocks processed.
    #[test]
    fn aux_state_is_deep_copied_per_worker_and_summed_counts_match_block_count() {
        let grid = test_grid();
        let blocks = BlockList::tile(&grid, 2, 2);
        let sublists = blocks.partition_by_stride(2);
        let num_blocks = blocks.len();

        let output_buffer = Arc::new(BlockBuffer::new(2));
        let user_fn: Arc<UserFunction> = Arc::new(|_info, _inputs, outputs, aux| {
            let counter = aux.as_any_mut().downcast_mut::<i64>().expect("aux is an i64 counter");
            *counter += 1;
            outputs.fill(SlotKey::single("out"), BlockArray::zeros(1, 1, 1));
            Ok(())
        });

        let mut mgr = ThreadComputeManager::new(
            sublists,
            grid,
            num_blocks,
            user_fn,
            None,
            output_buffer,
            Arc::new(BTreeMap::new()),
            Some(Box::new(0i64)),
            Duration::from_secs(1),
        );
        mgr.start_workers(Duration::from_secs(1)).unwrap();
        let outcome = mgr.shutdown().unwrap();

        let other_args = outcome.other_args.expect("aux state was requested");
        let total: i64 = other_args.iter().map(|a| *a.as_any().downcast_ref::<i64>().unwrap()).sum();
        assert_eq!(total, num_blocks as i64);
    }
}
