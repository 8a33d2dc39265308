/// Batch driver: runs every brick under the data directory through
/// preprocess -> subset -> per-tile classification -> merge.
///
/// Tiles run in separate `classify_tile` processes with a hard deadline.
/// A failing tile or brick is logged and the run continues; the outcome of
/// every brick and tile lands in `<run_log_dir>/run_summary.json`.
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use gapfill_core::config::PipelineConfig;
use gapfill_core::logging::{init_logging, RUN_LOG_FILE};
use gapfill_core::pipeline::{discover_bricks, BrickDriver, ScriptStep, RUN_SUMMARY_FILE};
use gapfill_core::scheduler::{default_worker_path, ProcessLauncher};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "classify_bricks", about = "Gap-fill classification over a directory of bricks")]
struct Args {
    /// JSON run configuration (all fields optional)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory with one sub-directory per brick
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Tile edge length in pixels
    #[arg(long)]
    tile_size: Option<usize>,

    /// Tiles running at once
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Per-tile deadline in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Process only this brick (repeatable)
    #[arg(long = "brick")]
    bricks: Vec<String>,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Cannot load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(size) = args.tile_size {
        config.tile_size = size;
    }
    if let Some(k) = args.max_parallel {
        config.max_parallel_tiles = k;
    }
    if let Some(secs) = args.timeout_secs {
        config.tile_timeout_secs = secs;
    }
    if !args.bricks.is_empty() {
        config.bricks = Some(args.bricks.clone());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let _guard = init_logging(&config.run_log_dir, RUN_LOG_FILE)
        .with_context(|| format!("Cannot open log in {}", config.run_log_dir.display()))?;
    let started = Instant::now();
    info!(data_dir = %config.data_dir.display(), tile_size = config.tile_size, "starting main run");

    let worker = match &config.worker_bin {
        Some(path) => path.clone(),
        None => default_worker_path().context("Cannot locate classify_tile")?,
    };

    let bricks = discover_bricks(&config.data_dir, config.bricks.as_deref())
        .with_context(|| format!("Cannot list bricks in {}", config.data_dir.display()))?;
    info!(bricks = bricks.len(), "bricks discovered");

    let driver = BrickDriver {
        preprocess: ScriptStep::new("preprocess", config.preprocess.clone()).with_log_dir(&config.pre_log_dir),
        merge: ScriptStep::new("merge", config.merge.clone()),
        launcher: ProcessLauncher::new(worker, &config.tile_log_dir, config.zero_quota),
        extractor: config.extractor.build(),
        scheduler: config.scheduler(),
        tile_size: config.tile_size,
        result_suffix: config.result_suffix.clone(),
    };
    let summary = driver.run(&bricks);

    let summary_path = config.run_log_dir.join(RUN_SUMMARY_FILE);
    summary
        .write_json(&summary_path)
        .with_context(|| format!("Cannot write {}", summary_path.display()))?;

    info!(
        bricks = summary.bricks.len(),
        completed = summary.completed(),
        tiles_classified = summary.tiles_classified(),
        summary = %summary_path.display(),
        "main run finished"
    );
    info!(runtime = ?started.elapsed(), "total runtime");
    Ok(())
}
