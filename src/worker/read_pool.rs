//! Read-worker pool (spec §4.3): populates the input `BlockBuffer` by
//! reading one `(block, symbolicName, seqNum)` task at a time from the
//! concrete raster driver.
//!
//! Tasks are generated once, up front, for the entire block list and
//! handed out from a shared `crossbeam_channel` queue. Each worker owns
//! its own raster driver handles; handles are never shared across
//! workers (spec §4.3 concurrency note).

use super::compute::{ExceptionQueue, ForceExit};
use crate::assoc::{BlockAssociations, FilenameAssociations, SlotKey};
use crate::block::BlockDefn;
use crate::buffer::BlockBuffer;
use crate::error::{RiosError, WorkerErrorRecord, WorkerKind};
use crate::raster::RasterDriver;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One unit of read work: a block, the symbolic slot it fills, and the
/// file it must be read from.
#[derive(Debug, Clone)]
pub struct ReadTask {
    pub block: BlockDefn,
    pub key: SlotKey,
    pub path: PathBuf,
}

/// Build the up-front task list for every block in `blocks` against
/// every slot named in `inputs` (spec §4.3: "tasks are generated once,
/// up-front, for the entire block list").
pub fn build_tasks(blocks: &[BlockDefn], inputs: &FilenameAssociations) -> Vec<ReadTask> {
    let mut tasks = Vec::with_capacity(blocks.len() * inputs.names().count().max(1));
    for &block in blocks {
        for (name, seq, path) in inputs.iter_slots() {
            let key = match seq {
                Some(i) => SlotKey::indexed(name, i),
                None => SlotKey::single(name),
            };
            tasks.push(ReadTask {
                block,
                key,
                path: path.clone(),
            });
        }
    }
    tasks
}

/// The rectangle a read task actually pulls from the driver: the block's
/// own bounds widened by `overlap` pixels on every side and clipped to
/// the working grid, so the user function sees a halo of neighbouring
/// context (spec §6 "overlap margin"). Returns `(top, left, nrows,
/// ncols)`.
pub fn padded_read_bounds(block: &BlockDefn, overlap: u64, grid_rows: u64, grid_cols: u64) -> (u64, u64, u64, u64) {
    let top = block.top.saturating_sub(overlap);
    let left = block.left.saturating_sub(overlap);
    let bottom = (block.bottom() + overlap).min(grid_rows);
    let right = (block.right() + overlap).min(grid_cols);
    (top, left, bottom - top, right - left)
}

/// Runs a pool of read workers against an up-front task list, each
/// reading through its own raster driver instance and calling
/// `add_block_data` into the shared input buffer.
pub struct ReadWorkerPool {
    num_workers: usize,
    tasks: Vec<ReadTask>,
    driver: Arc<dyn RasterDriver>,
    empty_shape: BlockAssociations,
    buffer: Arc<BlockBuffer>,
    overlap: u64,
    grid_rows: u64,
    grid_cols: u64,
    force_exit: Arc<ForceExit>,
    exceptions: Arc<ExceptionQueue>,
    add_timeout: Duration,
}

impl ReadWorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_workers: usize,
        tasks: Vec<ReadTask>,
        driver: Arc<dyn RasterDriver>,
        empty_shape: BlockAssociations,
        buffer: Arc<BlockBuffer>,
        overlap: u64,
        grid_rows: u64,
        grid_cols: u64,
        add_timeout: Duration,
    ) -> Self {
        Self {
            num_workers,
            tasks,
            driver,
            empty_shape,
            buffer,
            overlap,
            grid_rows,
            grid_cols,
            force_exit: Arc::new(ForceExit::new()),
            exceptions: Arc::new(ExceptionQueue::new()),
            add_timeout,
        }
    }

    pub fn force_exit(&self) -> Arc<ForceExit> {
        self.force_exit.clone()
    }

    pub fn exceptions(&self) -> &ExceptionQueue {
        &self.exceptions
    }

    /// Run the pool to completion, inline in the calling thread if
    /// `num_workers == 0` (spec §4.3: "0 means inline reading in the
    /// driver thread").
    pub fn run(&self) -> Result<(), RiosError> {
        let (sender, receiver): (Sender<ReadTask>, Receiver<ReadTask>) = bounded(self.tasks.len().max(1));
        for task in self.tasks.clone() {
            sender.send(task).expect("queue sized to task count");
        }
        drop(sender);

        let ctx = ReadContext {
            empty_shape: &self.empty_shape,
            buffer: &self.buffer,
            overlap: self.overlap,
            grid_rows: self.grid_rows,
            grid_cols: self.grid_cols,
            force_exit: &self.force_exit,
            exceptions: &self.exceptions,
            add_timeout: self.add_timeout,
        };

        if self.num_workers == 0 {
            run_worker(0, &receiver, self.driver.as_ref(), &ctx);
        } else {
            std::thread::scope(|scope| {
                for worker_id in 0..self.num_workers {
                    let receiver = receiver.clone();
                    let driver = self.driver.clone();
                    let ctx = &ctx;
                    scope.spawn(move || {
                        run_worker(worker_id, &receiver, driver.as_ref(), ctx);
                    });
                }
            });
        }

        if let Some(record) = self.exceptions.first() {
            return Err(RiosError::from(record));
        }
        Ok(())
    }
}

struct ReadContext<'a> {
    empty_shape: &'a BlockAssociations,
    buffer: &'a BlockBuffer,
    overlap: u64,
    grid_rows: u64,
    grid_cols: u64,
    force_exit: &'a ForceExit,
    exceptions: &'a ExceptionQueue,
    add_timeout: Duration,
}

fn run_worker(worker_id: usize, receiver: &Receiver<ReadTask>, driver: &dyn RasterDriver, ctx: &ReadContext<'_>) {
    while let Ok(task) = receiver.recv() {
        if ctx.force_exit.is_set() {
            return;
        }

        let (top, left, nrows, ncols) = padded_read_bounds(&task.block, ctx.overlap, ctx.grid_rows, ctx.grid_cols);
        let result = driver.open_read(&task.path).and_then(|mut dataset| {
            let band = task.key.seq.map(|s| s + 1).unwrap_or(1);
            let array = dataset.read_block(band, left, top, ncols, nrows)?;
            dataset.close()?;
            Ok(array)
        });

        match result {
            Ok(array) => {
                if let Err(e) = ctx.buffer.add_block_data(task.block, task.key.clone(), array, ctx.empty_shape, ctx.add_timeout) {
                    ctx.exceptions.push(read_error(worker_id, &e));
                    ctx.force_exit.set();
                    return;
                }
            }
            Err(e) => {
                ctx.exceptions.push(read_error(worker_id, &e));
                ctx.force_exit.set();
                return;
            }
        }
    }
}

fn read_error(worker_id: usize, err: &RiosError) -> WorkerErrorRecord {
    WorkerErrorRecord {
        exception_type: "RiosError".to_string(),
        message: err.to_string(),
        traceback: String::new(),
        worker_kind: WorkerKind::Read,
        worker_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc::BlockArray;
    use crate::grid::{GeoTransform, PixelGrid};
    use crate::raster::{CreationOptions, PixelType, RasterDataset};
    use crate::stats::{FinalizedStats, OverviewLevel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDataset {
        grid: PixelGrid,
    }

    impl RasterDataset for FakeDataset {
        fn grid(&self) -> &PixelGrid {
            &self.grid
        }
        fn num_bands(&self) -> usize {
            1
        }
        fn pixel_type(&self, _band: usize) -> PixelType {
            PixelType::Float64
        }
        fn null_value(&self, _band: usize) -> Option<f64> {
            None
        }
        fn read_block(&self, _band: usize, _x_off: u64, _y_off: u64, width: u64, height: u64) -> Result<BlockArray, RiosError> {
            Ok(BlockArray::zeros(1, height as usize, width as usize))
        }
        fn write_block(&mut self, _band: usize, _x_off: u64, _y_off: u64, _block: &BlockArray) -> Result<(), RiosError> {
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

    struct CountingDriver {
        opens: AtomicUsize,
    }

    impl RasterDriver for CountingDriver {
        fn open_read(&self, _path: &std::path::Path) -> Result<Box<dyn RasterDataset>, RiosError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDataset {
                grid: PixelGrid::new("EPSG:32601", GeoTransform::new(0.0, 1.0, 0.0, 0.0, 0.0, -1.0), 4, 4).unwrap(),
            }))
        }
        fn create(&self, _path: &std::path::Path, _grid: &PixelGrid, _num_bands: usize, _pixel_type: PixelType, _options: &CreationOptions) -> Result<Box<dyn RasterDataset>, RiosError> {
            unimplemented!("not exercised by read pool tests")
        }
    }

    #[test]
    fn build_tasks_produces_one_task_per_block_per_slot() {
        let mut inputs = FilenameAssociations::new();
        inputs.set_single("dem", PathBuf::from("dem.tif"));
        inputs.set_list("bands", vec![PathBuf::from("b1.tif"), PathBuf::from("b2.tif")]);

        let blocks = vec![BlockDefn::new(0, 0, 2, 2), BlockDefn::new(0, 2, 2, 2)];
        let tasks = build_tasks(&blocks, &inputs);
        assert_eq!(tasks.len(), 6);
    }

    #[test]
    fn pool_fills_every_block_and_each_worker_opens_its_own_handles() {
        let mut inputs = FilenameAssociations::new();
        inputs.set_single("dem", PathBuf::from("dem.tif"));
        let blocks = vec![BlockDefn::new(0, 0, 2, 2), BlockDefn::new(0, 2, 2, 2), BlockDefn::new(2, 0, 2, 2)];
        let tasks = build_tasks(&blocks, &inputs);

        let driver = Arc::new(CountingDriver { opens: AtomicUsize::new(0) });
        let empty_shape = BlockAssociations::from_spec(&inputs);
        let buffer = Arc::new(BlockBuffer::new(2));

        let pool = ReadWorkerPool::new(2, tasks, driver.clone(), empty_shape, buffer.clone(), 0, 4, 4, Duration::from_secs(1));
        pool.run().unwrap();

        for &block in &blocks {
            let value = buffer.pop_complete_block(block, Duration::from_secs(1)).unwrap();
            assert!(value.is_complete());
        }
        assert_eq!(driver.opens.load(Ordering::SeqCst), 3);
    }
}
