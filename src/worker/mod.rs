//! Read and compute workers (spec §4.3-§4.8): the pools that populate
//! the input buffer from raster files and that run the user function
//! over blocks, in any of the three concurrency styles.

pub mod batch_manager;
pub mod compute;
pub mod read_pool;
pub mod subprocess_manager;
pub mod thread_manager;
