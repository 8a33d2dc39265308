/// Tile worker: classifies one raw/train window pair in its own process.
///
/// Exit status is the contract with the scheduler: 0 when the tile was
/// classified and written, 3 when it had nothing to learn from, 1 on error.
/// The scheduler may kill this process at any time.
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use gapfill_core::classify::{TileClassifier, TileOutcome};
use gapfill_core::forest::ForestParams;
use gapfill_core::logging::init_tile_logging;
use gapfill_core::scheduler::{EXIT_CLASSIFIED, EXIT_SKIPPED};
use gapfill_core::selection::DEFAULT_ZERO_QUOTA;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "classify_tile", about = "Fill one tile with random-forest predictions")]
struct Args {
    /// Raw (feature) window extract
    #[arg(long)]
    raw: PathBuf,

    /// Training-label window extract, co-registered with --raw
    #[arg(long)]
    train: PathBuf,

    /// Directory receiving the classified tile (created if absent)
    #[arg(long)]
    out_dir: PathBuf,

    /// Output file name, e.g. T32UMU_0.1_sub.tif
    #[arg(long)]
    name: String,

    /// Directory for the per-tile log file
    #[arg(long, default_value = "../logs/subsetLogs")]
    log_dir: PathBuf,

    /// Cap on all-zero background samples
    #[arg(long, default_value_t = DEFAULT_ZERO_QUOTA)]
    zero_quota: usize,
}

fn run(args: &Args) -> Result<TileOutcome> {
    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Cannot create {}", args.out_dir.display()))?;
    let output = args.out_dir.join(&args.name);

    let classifier = TileClassifier::new(ForestParams::default(), args.zero_quota);
    classifier
        .classify_tile(&args.raw, &args.train, &output)
        .with_context(|| format!("Tile {} failed", args.raw.display()))
}

fn main() -> ExitCode {
    let args = Args::parse();
    let tile = Path::new(&args.name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&args.name)
        .to_string();

    let _guard = match init_tile_logging(&args.log_dir, &tile) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("[classify_tile] cannot open log in {}: {e}", args.log_dir.display());
            None
        }
    };

    let started = Instant::now();
    info!(%tile, raw = %args.raw.display(), train = %args.train.display(), "tile started");

    match run(&args) {
        Ok(TileOutcome::Classified { output, stats }) => {
            info!(
                %tile,
                output = %output.display(),
                samples = stats.training_samples,
                oob_score = ?stats.oob_score,
                elapsed = ?started.elapsed(),
                "tile classified"
            );
            ExitCode::from(EXIT_CLASSIFIED as u8)
        }
        Ok(TileOutcome::Skipped(reason)) => {
            info!(%tile, %reason, elapsed = ?started.elapsed(), "tile skipped");
            ExitCode::from(EXIT_SKIPPED as u8)
        }
        Err(e) => {
            error!(%tile, error = ?e, "tile failed");
            ExitCode::FAILURE
        }
    }
}
