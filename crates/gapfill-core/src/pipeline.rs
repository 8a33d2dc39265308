//! Multi-brick batch driver: preprocess, subset, schedule tiles, merge.
//!
//! Each stage reports a typed outcome. A failed preprocess or subset skips the
//! brick; a failed merge is recorded and the run moves on. No brick can abort
//! the run.
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ScriptConfig;
use crate::error::{Error, Result};
use crate::partition::{partition_named, NamePattern, Window};
use crate::raster::geotiff::read_dimensions;
use crate::raster::WindowExtractor;
use crate::scheduler::{ScheduleReport, TileJob, TileScheduler, UnitLauncher};

pub const RESULTS_DIR: &str = "subsetResults";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

// ── Bricks ────────────────────────────────────────────────────────────────────

/// One brick directory holding `<name>_brick.tif` and `<name>_lc_UTM.tif`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Brick {
    pub name: String,
    pub dir: PathBuf,
}

impl Brick {
    pub fn new(dir: impl Into<PathBuf>) -> Option<Self> {
        let dir = dir.into();
        let name = dir.file_name()?.to_str()?.to_string();
        Some(Self { name, dir })
    }

    pub fn raw_path(&self) -> PathBuf {
        self.dir.join(format!("{}_brick.tif", self.name))
    }

    pub fn train_path(&self) -> PathBuf {
        self.dir.join(format!("{}_lc_UTM.tif", self.name))
    }

    pub fn results_dir(&self) -> PathBuf {
        self.dir.join(RESULTS_DIR)
    }

    pub fn raw_pattern(&self) -> NamePattern {
        NamePattern::new(&self.name, "_sub")
    }

    pub fn train_pattern(&self) -> NamePattern {
        NamePattern::new(&self.name, "_tr")
    }
}

/// Sub-directories of `data_dir` sorted by name, restricted to `only` if given.
pub fn discover_bricks(data_dir: &Path, only: Option<&[String]>) -> Result<Vec<Brick>> {
    let mut bricks = Vec::new();
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(brick) = Brick::new(entry.path()) {
            bricks.push(brick);
        }
    }
    bricks.sort_by(|a, b| a.name.cmp(&b.name));

    if let Some(only) = only {
        for wanted in only {
            if !bricks.iter().any(|b| &b.name == wanted) {
                warn!(brick = %wanted, data_dir = %data_dir.display(), "requested brick not found");
            }
        }
        bricks.retain(|b| only.contains(&b.name));
    }
    Ok(bricks)
}

// ── External steps ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
}

/// A per-brick external stage.
pub trait BrickStep {
    fn name(&self) -> &str;

    fn run(&self, brick: &Brick) -> StepOutcome;
}

/// Runs `program args... <brick>`; a non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub label: String,
    pub script: ScriptConfig,
    /// When set, stdout and stderr go to `<log_dir>/<brick>_rLog.txt`.
    pub log_dir: Option<PathBuf>,
}

impl ScriptStep {
    pub fn new(label: impl Into<String>, script: ScriptConfig) -> Self {
        Self {
            label: label.into(),
            script,
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn log_path(&self, brick: &Brick) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_rLog.txt", brick.name)))
    }

    fn execute(&self, brick: &Brick) -> Result<StepOutcome> {
        let mut cmd = Command::new(&self.script.program);
        cmd.args(&self.script.args).arg(&brick.name).stdin(Stdio::null());

        if let Some(log_path) = self.log_path(brick) {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let log = File::create(&log_path)?;
            cmd.stdout(log.try_clone()?).stderr(log);
        }

        let status = cmd.status().map_err(|e| Error::ExternalStep {
            program: self.script.program.clone(),
            reason: e.to_string(),
        })?;
        Ok(if status.success() {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed(format!("{} {status}", self.script.program))
        })
    }
}

impl BrickStep for ScriptStep {
    fn name(&self) -> &str {
        &self.label
    }

    fn run(&self, brick: &Brick) -> StepOutcome {
        self.execute(brick)
            .unwrap_or_else(|e| StepOutcome::Failed(e.to_string()))
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum BrickStatus {
    Completed,
    PreprocessFailed(String),
    SubsetFailed(String),
    MergeFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrickReport {
    pub brick: String,
    pub status: BrickStatus,
    pub tiles: ScheduleReport,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub bricks: Vec<BrickReport>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.bricks.iter().filter(|b| b.status == BrickStatus::Completed).count()
    }

    pub fn tiles_classified(&self) -> usize {
        self.bricks.iter().map(|b| b.tiles.classified()).sum()
    }

    /// Pretty JSON at `path`, creating parent directories.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

pub struct BrickDriver<P, M, L> {
    pub preprocess: P,
    pub merge: M,
    pub launcher: L,
    pub extractor: Box<dyn WindowExtractor>,
    pub scheduler: TileScheduler,
    pub tile_size: usize,
    pub result_suffix: String,
}

impl<P: BrickStep, M: BrickStep, L: UnitLauncher> BrickDriver<P, M, L> {
    /// Process every brick in order.
    pub fn run(&self, bricks: &[Brick]) -> RunSummary {
        let started = Instant::now();
        info!(bricks = bricks.len(), "starting run");
        let reports = bricks.iter().map(|b| self.run_brick(b)).collect();
        RunSummary {
            bricks: reports,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }

    pub fn run_brick(&self, brick: &Brick) -> BrickReport {
        let started = Instant::now();
        let report = |status, tiles| BrickReport {
            brick: brick.name.clone(),
            status,
            tiles,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };

        info!(brick = %brick.name, step = self.preprocess.name(), "preprocessing brick");
        if let StepOutcome::Failed(reason) = self.preprocess.run(brick) {
            error!(brick = %brick.name, %reason, "preprocessing failed, skipping brick");
            return report(BrickStatus::PreprocessFailed(reason), ScheduleReport::default());
        }

        info!(brick = %brick.name, tile_size = self.tile_size, "creating subsets");
        let jobs = match self.subset(brick) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(brick = %brick.name, error = %e, "subsetting failed, skipping brick");
                return report(BrickStatus::SubsetFailed(e.to_string()), ScheduleReport::default());
            }
        };
        info!(brick = %brick.name, tiles = jobs.len(), "subsets created");

        let tiles = self.scheduler.run(&self.launcher, &jobs);
        info!(
            brick = %brick.name,
            classified = tiles.classified(),
            skipped = tiles.skipped(),
            failed = tiles.failed(),
            timed_out = tiles.timed_out(),
            "tiles finished"
        );

        info!(brick = %brick.name, step = self.merge.name(), "merging results");
        match self.merge.run(brick) {
            StepOutcome::Succeeded => {
                info!(brick = %brick.name, "merge done");
                report(BrickStatus::Completed, tiles)
            }
            StepOutcome::Failed(reason) => {
                error!(brick = %brick.name, %reason, "merge failed");
                report(BrickStatus::MergeFailed(reason), tiles)
            }
        }
    }

    /// Partition both rasters, materialize the extracts next to them, and
    /// pair the windows into tile jobs.
    pub fn subset(&self, brick: &Brick) -> Result<Vec<TileJob>> {
        let raw_path = brick.raw_path();
        let train_path = brick.train_path();
        let (raw_w, raw_h) = read_dimensions(&raw_path)?;
        let (train_w, train_h) = read_dimensions(&train_path)?;

        let raw = partition_named(raw_w, raw_h, self.tile_size, &brick.raw_pattern())?;
        let train = partition_named(train_w, train_h, self.tile_size, &brick.train_pattern())?;
        let aligned = raw.len() == train.len() && raw.iter().zip(&train).all(|((a, _), (b, _))| a.same_extent(b));
        if !aligned {
            return Err(Error::FootprintMismatch {
                expected_rows: raw_h,
                expected_cols: raw_w,
                actual_rows: train_h,
                actual_cols: train_w,
            });
        }

        let targets = |windows: &[(Window, String)]| -> Vec<(Window, PathBuf)> {
            windows.iter().map(|(w, name)| (*w, brick.dir.join(name))).collect()
        };
        let raw_targets = targets(&raw);
        let train_targets = targets(&train);
        self.extractor.extract_many(&raw_path, &raw_targets)?;
        self.extractor.extract_many(&train_path, &train_targets)?;

        let results = brick.results_dir();
        fs::create_dir_all(&results)?;

        let stems = NamePattern::new(&brick.name, "");
        Ok(raw_targets
            .into_iter()
            .zip(train_targets)
            .map(|((window, raw), (_, train))| TileJob {
                raw,
                train,
                output_dir: results.clone(),
                output_name: format!("{}{}.tif", stems.stem(&window), self.result_suffix),
            })
            .collect())
    }
}
