//! Batch-run configuration, loaded from JSON with every field defaulted.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::raster::{GdalTranslateExtractor, NativeExtractor, WindowExtractor};
use crate::scheduler::TileScheduler;
use crate::selection::DEFAULT_ZERO_QUOTA;

/// An external program invoked once per brick with the brick name appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl ScriptConfig {
    pub fn rscript(script: &str) -> Self {
        Self {
            program: "Rscript".into(),
            args: vec!["--vanilla".into(), script.into()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    #[default]
    Native,
    GdalTranslate,
}

impl ExtractorKind {
    pub fn build(self) -> Box<dyn WindowExtractor> {
        match self {
            ExtractorKind::Native => Box::new(NativeExtractor),
            ExtractorKind::GdalTranslate => Box::new(GdalTranslateExtractor::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// One sub-directory per brick.
    pub data_dir: PathBuf,
    pub pre_log_dir: PathBuf,
    pub tile_log_dir: PathBuf,
    pub run_log_dir: PathBuf,
    pub tile_size: usize,
    pub tile_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_parallel_tiles: usize,
    pub zero_quota: usize,
    /// Restrict the run to these bricks; all discovered bricks when unset.
    pub bricks: Option<Vec<String>>,
    pub preprocess: ScriptConfig,
    pub merge: ScriptConfig,
    pub extractor: ExtractorKind,
    /// Tile worker binary; `classify_tile` next to the driver when unset.
    pub worker_bin: Option<PathBuf>,
    /// Appended to `<brick>_<r>.<c>` to name per-tile outputs.
    pub result_suffix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("../data/inputData"),
            pre_log_dir: PathBuf::from("../logs/preLogs"),
            tile_log_dir: PathBuf::from("../logs/subsetLogs"),
            run_log_dir: PathBuf::from("../logs"),
            tile_size: 5490,
            tile_timeout_secs: 36_000,
            poll_interval_ms: 500,
            max_parallel_tiles: 1,
            zero_quota: DEFAULT_ZERO_QUOTA,
            bricks: None,
            preprocess: ScriptConfig::rscript("./preprocess_tiles_gdal.R"),
            merge: ScriptConfig::rscript("./result_merge.R"),
            extractor: ExtractorKind::Native,
            worker_bin: None,
            result_suffix: "_sub".into(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(Error::InvalidArgument("tile_size must be positive".into()));
        }
        if self.max_parallel_tiles == 0 {
            return Err(Error::InvalidArgument("max_parallel_tiles must be positive".into()));
        }
        if self.tile_timeout_secs == 0 {
            return Err(Error::InvalidArgument("tile_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn tile_timeout(&self) -> Duration {
        Duration::from_secs(self.tile_timeout_secs)
    }

    pub fn scheduler(&self) -> TileScheduler {
        TileScheduler {
            timeout: self.tile_timeout(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_parallel: self.max_parallel_tiles,
        }
    }
}
