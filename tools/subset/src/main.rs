/// Partition one raster into tile windows.
///
/// Prints the window list as JSON on stdout. With --extract-to, every window
/// is also written as a standalone GeoTIFF named `<prefix>_<row>.<col><suffix>.tif`.
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, Level};

use gapfill_core::config::ExtractorKind;
use gapfill_core::partition::{partition_named, NamePattern, Window};
use gapfill_core::raster::geotiff::read_dimensions;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Extractor {
    Native,
    GdalTranslate,
}

impl From<Extractor> for ExtractorKind {
    fn from(e: Extractor) -> Self {
        match e {
            Extractor::Native => ExtractorKind::Native,
            Extractor::GdalTranslate => ExtractorKind::GdalTranslate,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "subset", about = "Partition a raster into fixed-size tile windows")]
struct Args {
    /// Raster to partition
    input: PathBuf,

    /// Maximum tile edge in pixels
    #[arg(long, default_value_t = 5490)]
    tile_size: usize,

    /// Name prefix (defaults to the input file stem)
    #[arg(long)]
    prefix: Option<String>,

    /// Name suffix placed after the tile index
    #[arg(long, default_value = "_sub")]
    suffix: String,

    /// Write every window into this directory
    #[arg(long)]
    extract_to: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "native")]
    extractor: Extractor,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct Entry<'a> {
    name: &'a str,
    #[serde(flatten)]
    window: &'a Window,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let (width, height) = read_dimensions(&args.input)
        .with_context(|| format!("Cannot read {}", args.input.display()))?;
    let prefix = match &args.prefix {
        Some(p) => p.clone(),
        None => args
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Input has no usable file stem; pass --prefix")?
            .to_string(),
    };
    let pattern = NamePattern::new(prefix, args.suffix.clone());
    let windows = partition_named(width, height, args.tile_size, &pattern)?;
    info!(width, height, tile_size = args.tile_size, windows = windows.len(), "raster partitioned");

    if let Some(dir) = &args.extract_to {
        fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
        let targets: Vec<(Window, PathBuf)> = windows.iter().map(|(w, name)| (*w, dir.join(name))).collect();
        ExtractorKind::from(args.extractor)
            .build()
            .extract_many(&args.input, &targets)
            .context("Extraction failed")?;
        info!(dir = %dir.display(), "windows extracted");
    }

    let entries: Vec<Entry<'_>> = windows
        .iter()
        .map(|(window, name)| Entry { name, window })
        .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
