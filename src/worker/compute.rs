//! Shared compute-worker contract (spec §4.4, §4.5).
//!
//! [`ComputeWorkerManager`] is the abstract interface every concrete
//! manager (thread, subprocess, batch) implements; [`ReaderInfo`] is the
//! view handed to the user function each time it is called; [`UserFunction`]
//! is the user function's signature.

use crate::assoc::{BlockAssociations, SlotKey};
use crate::block::BlockDefn;
use crate::control::Control;
use crate::error::{RiosError, WorkerErrorRecord};
use crate::grid::PixelGrid;
use crate::timers::TimerMap;
use std::any::Any;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::time::Duration;

/// Block-local metadata handed to the user function alongside `inputs`
/// and `outputs` (spec §6 `info`): bounds, indices, the working grid,
/// first/last-block predicates, and per-input filename/null-value
/// lookup by array identity (spec §6 "info exposes the filename and
/// null value of each input, looked up by the same key used to fetch
/// its array").
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    pub block: BlockDefn,
    pub grid: PixelGrid,
    pub block_index: usize,
    pub total_blocks: usize,
    pub filenames: BTreeMap<SlotKey, PathBuf>,
    pub null_values: BTreeMap<SlotKey, f64>,
}

impl ReaderInfo {
    pub fn is_first_block(&self) -> bool {
        self.block_index == 0
    }

    pub fn is_last_block(&self) -> bool {
        self.block_index + 1 == self.total_blocks
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_blocks == 0 {
            100.0
        } else {
            100.0 * (self.block_index + 1) as f64 / self.total_blocks as f64
        }
    }

    /// The source filename the input at `key` was read from.
    pub fn filename_for(&self, key: &SlotKey) -> Option<&PathBuf> {
        self.filenames.get(key)
    }

    /// The null/no-data value of the input at `key`, if it has one.
    pub fn null_value_for(&self, key: &SlotKey) -> Option<f64> {
        self.null_values.get(key).copied()
    }

    /// Convert a pixel offset within the working grid to world
    /// coordinates using the grid's geotransform.
    pub fn pixel_to_world(&self, row: f64, col: f64) -> (f64, f64) {
        let t = &self.grid.transform;
        let x = t.origin_x + col * t.pixel_width + row * t.col_skew;
        let y = t.origin_y + col * t.row_skew + row * t.pixel_height;
        (x, y)
    }
}

/// Arbitrary per-worker auxiliary state the caller passes as a prototype
/// and gets back one (possibly mutated) copy per worker (spec §4.5
/// `otherArgs`). Deep-copied once per worker, not once per block, so a
/// worker's writes to its own copy never race another worker's —
/// grounded in the original library's `copy.deepcopy(otherArgs)` done
/// once before a worker's sublist starts.
pub trait AuxState: Any + Send {
    fn clone_box(&self) -> Box<dyn AuxState>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> AuxState for T
where
    T: Clone + Send + 'static,
{
    fn clone_box(&self) -> Box<dyn AuxState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Signature of the per-block callback supplied by the caller, with an
/// auxiliary-state argument deep-copied per worker so writes stay
/// worker-local (spec §4.5). Callers with no use for it pass `&mut ()`
/// through unused `_aux` parameters.
pub type UserFunction =
    dyn Fn(&ReaderInfo, &BlockAssociations, &mut BlockAssociations, &mut dyn AuxState) -> Result<(), RiosError> + Send + Sync;

/// Shared cancellation flag all workers poll between blocks (spec §5).
#[derive(Default)]
pub struct ForceExit(AtomicBool);

impl ForceExit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Collects `WorkerErrorRecord`s from any worker; the driver polls this
/// between block pops and aborts the run on the first entry (spec §5).
#[derive(Default)]
pub struct ExceptionQueue(Mutex<Vec<WorkerErrorRecord>>);

impl ExceptionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: WorkerErrorRecord) {
        self.0.lock().unwrap().push(record);
    }

    pub fn first(&self) -> Option<WorkerErrorRecord> {
        self.0.lock().unwrap().first().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}

/// Result of a finished compute-worker pool: merged timers plus, when
/// the caller supplied an aux-state prototype, each worker's final copy
/// in worker-index order (spec §6 `ApplierReturn.otherArgsList`).
/// `None` when no aux state was requested, matching the original
/// library leaving `otherArgsList` unset in that case.
pub struct ComputeWorkerOutcome {
    pub timers: TimerMap,
    pub other_args: Option<Vec<Box<dyn AuxState>>>,
}

/// Abstract contract every compute-worker manager implements (spec
/// §4.4): start a pool, wait at a barrier, then shut down collecting
/// outcomes.
pub trait ComputeWorkerManager {
    /// Start `num_workers` workers against their (already partitioned)
    /// sublists, and block until they either reach the start barrier or
    /// the manager decides not to use one (thread manager typically
    /// skips it; spec §4.6).
    fn start_workers(&mut self, barrier_timeout: Duration) -> Result<(), RiosError>;

    /// Signal force-exit, wait for all workers to finish, and drain the
    /// outbound queue into an ordered outcome.
    fn shutdown(&mut self) -> Result<ComputeWorkerOutcome, RiosError>;

    fn exceptions(&self) -> &ExceptionQueue;
}

/// Partition `control`'s worker count against a block list length,
/// defaulting to at least one worker (shared helper for every manager).
pub fn resolve_worker_count(control: &Control, block_count: usize) -> usize {
    control.num_compute_workers.max(1).min(block_count.max(1))
}
