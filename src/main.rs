//! riostream CLI entry point.
//!
//! Builds a [`riostream::control::Control`] from defaults, an optional TOML
//! file, and CLI flags (CLI wins — mirrors `config/toml.rs::merge_cli_with_config`),
//! validates it eagerly, and resolves named input/output files. This
//! binary has no built-in `RasterDriver`, so it validates configuration
//! and naming but stops short of running a pipeline; an embedding picks
//! its own driver and user function and calls [`riostream::apply`]
//! directly from library code.

use anyhow::{bail, Context, Result};
use clap::Parser;
use riostream::assoc::FilenameAssociations;
use riostream::control::{ActionMode, Control, FootprintMode};
use std::path::PathBuf;
use std::time::Instant;

/// riostream - concurrent raster block-pipeline engine
#[derive(Parser, Debug)]
#[command(name = "riostream")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Optional TOML configuration file, overlaid on defaults and overlaid
    /// in turn by any of the flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Named input, given as `name=path`; repeatable.
    #[arg(long = "input", value_name = "NAME=PATH")]
    inputs: Vec<String>,

    /// Named output, given as `name=path`; repeatable.
    #[arg(long = "output", value_name = "NAME=PATH")]
    outputs: Vec<String>,

    #[arg(long)]
    block_width: Option<u64>,

    #[arg(long)]
    block_height: Option<u64>,

    #[arg(long)]
    overlap: Option<u64>,

    #[arg(long, value_enum)]
    footprint: Option<FootprintMode>,

    #[arg(long)]
    driver_name: Option<String>,

    #[arg(long)]
    num_read_workers: Option<usize>,

    #[arg(long)]
    num_compute_workers: Option<usize>,

    #[arg(long, value_enum)]
    calc_stats: Option<ActionMode>,

    #[arg(long, value_enum)]
    calc_pyramids: Option<ActionMode>,

    /// Validate and print the resolved configuration without running.
    #[arg(long)]
    dry_run: bool,

    /// Print per-stage timing to stderr.
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let start = Instant::now();

    let mut control = match &cli.config {
        Some(path) => riostream::control::load_toml(path).context("failed to load --config")?,
        None => Control::default(),
    };
    apply_cli_overrides(&mut control, &cli);

    riostream::control::validate_control(&control).context("invalid configuration")?;
    if cli.debug {
        eprintln!("riostream: configuration valid after {:.3}s", start.elapsed().as_secs_f64());
    }

    println!("{control:#?}");
    if cli.dry_run {
        println!("dry run: configuration validated, not running");
        return Ok(());
    }

    let inputs = parse_associations(&cli.inputs, "--input")?;
    let outputs = parse_associations(&cli.outputs, "--output")?;
    if inputs.is_empty() || outputs.is_empty() {
        bail!("at least one --input and one --output are required to run");
    }

    bail!(
        "riostream-cli validates configuration but has no built-in RasterDriver; \
         embed this crate and call riostream::apply with a concrete driver to run a pipeline"
    );
}

fn apply_cli_overrides(control: &mut Control, cli: &Cli) {
    if let Some(v) = cli.block_width {
        control.block_width = v;
    }
    if let Some(v) = cli.block_height {
        control.block_height = v;
    }
    if let Some(v) = cli.overlap {
        control.overlap = v;
    }
    if let Some(v) = cli.footprint {
        control.footprint = v;
    }
    if let Some(v) = &cli.driver_name {
        control.driver_name = v.clone();
    }
    if let Some(v) = cli.num_read_workers {
        control.num_read_workers = v;
    }
    if let Some(v) = cli.num_compute_workers {
        control.num_compute_workers = v;
    }
    if let Some(v) = cli.calc_stats {
        control.calc_stats = v;
    }
    if let Some(v) = cli.calc_pyramids {
        control.calc_pyramids = v;
    }
}

fn parse_associations(entries: &[String], flag: &str) -> Result<FilenameAssociations> {
    let mut assoc = FilenameAssociations::new();
    for entry in entries {
        let (name, path) = entry
            .split_once('=')
            .with_context(|| format!("{flag} expects NAME=PATH, got {entry:?}"))?;
        assoc.set_single(name, PathBuf::from(path));
    }
    Ok(assoc)
}
