//! Vector rasterisation, memoised per (vector file, options) with
//! per-file locking: only one worker ever rasterises a given vector;
//! others wait and receive the cached raster path (spec §4).

use crate::control::VectorOptions;
use crate::error::RiosError;
use crate::grid::PixelGrid;
use crate::tempfiles::TempfileManager;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

/// Abstraction over "burn this vector layer into a raster on the working
/// grid", kept separate from [`crate::raster::RasterDriver`] since the
/// concrete backend for vector rasterisation (e.g. GDAL's
/// `gdal.RasterizeLayer`) need not be the same object as the raster
/// reader/writer.
pub trait Rasteriser: Send + Sync {
    fn rasterize(&self, vector_path: &Path, grid: &PixelGrid, options: &VectorOptions, out_path: &Path) -> Result<(), RiosError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    vector_path: PathBuf,
    options_digest: String,
}

fn digest_options(options: &VectorOptions) -> String {
    format!(
        "{:?}|{:?}|{:?}|{:?}|{}|{:?}|{:?}|{:?}",
        options.burn_value,
        options.attribute,
        options.null_value,
        options.sql_filter,
        options.all_touched,
        options.datatype,
        options.layer,
        options.layer_selection,
    )
}

enum Entry {
    InProgress,
    Done(PathBuf),
}

/// Per-run manager memoising rasterised vector outputs. Workers call
/// [`RasterisationMgr::get_or_rasterize`]; the first caller for a given
/// key does the work while later callers for the same key block until it
/// finishes, then receive the same cached path.
pub struct RasterisationMgr {
    rasteriser: Arc<dyn Rasteriser>,
    tempfiles: Arc<TempfileManager>,
    state: Mutex<HashMap<CacheKey, Entry>>,
    done: Condvar,
}

impl RasterisationMgr {
    pub fn new(rasteriser: Arc<dyn Rasteriser>, tempfiles: Arc<TempfileManager>) -> Self {
        Self {
            rasteriser,
            tempfiles,
            state: Mutex::new(HashMap::new()),
            done: Condvar::new(),
        }
    }

    /// Return the rasterised-raster path for `(vector_path, options)` on
    /// `grid`, rasterising once and caching the result for subsequent
    /// callers with the same key.
    pub fn get_or_rasterize(&self, vector_path: &Path, grid: &PixelGrid, options: &VectorOptions) -> Result<PathBuf, RiosError> {
        let key = CacheKey {
            vector_path: vector_path.to_path_buf(),
            options_digest: digest_options(options),
        };

        let mut state = self.state.lock().unwrap();
        loop {
            match state.get(&key) {
                Some(Entry::Done(path)) => return Ok(path.clone()),
                Some(Entry::InProgress) => {
                    state = self.done.wait(state).unwrap();
                }
                None => {
                    state.insert(key.clone(), Entry::InProgress);
                    break;
                }
            }
        }
        drop(state);

        let label = vector_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("vector");
        let out_path = self.tempfiles.reserve(label, "tif");
        let result = self.rasteriser.rasterize(vector_path, grid, options, &out_path);

        let mut state = self.state.lock().unwrap();
        match &result {
            Ok(()) => {
                state.insert(key, Entry::Done(out_path.clone()));
            }
            Err(_) => {
                state.remove(&key);
            }
        }
        drop(state);
        self.done.notify_all();

        result.map(|()| out_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRasteriser {
        calls: AtomicUsize,
    }

    impl Rasteriser for CountingRasteriser {
        fn rasterize(&self, _vector_path: &Path, _grid: &PixelGrid, _options: &VectorOptions, out_path: &Path) -> Result<(), RiosError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            std::fs::write(out_path, b"raster").map_err(RiosError::from)
        }
    }

    fn test_grid() -> PixelGrid {
        PixelGrid::new(
            "EPSG:4326".to_string(),
            crate::grid::GeoTransform::new(0.0, 1.0, 0.0, 0.0, 0.0, -1.0),
            10,
            10,
        )
        .unwrap()
    }

    #[test]
    fn concurrent_callers_for_same_key_only_rasterize_once() {
        let rasteriser = Arc::new(CountingRasteriser { calls: AtomicUsize::new(0) });
        let tempfiles = Arc::new(TempfileManager::new(None, "rz").unwrap());
        let mgr = Arc::new(RasterisationMgr::new(rasteriser.clone(), tempfiles));
        let grid = test_grid();
        let options = VectorOptions::default();
        let vector_path = PathBuf::from("parcels.shp");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mgr = mgr.clone();
                let grid = grid.clone();
                let options = options.clone();
                let vector_path = vector_path.clone();
                std::thread::spawn(move || mgr.get_or_rasterize(&vector_path, &grid, &options).unwrap())
            })
            .collect();

        let paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(rasteriser.calls.load(Ordering::SeqCst), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }
}
