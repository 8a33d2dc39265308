//! Materializing partition windows as standalone raster files.
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use super::geotiff::GeoTiffReader;
use crate::error::{Error, Result};
use crate::partition::Window;

/// Writes the pixels of a [`Window`] of `source` to `dest` as a new raster.
pub trait WindowExtractor {
    fn extract(&self, source: &Path, window: &Window, dest: &Path) -> Result<()>;

    /// Extract several windows of the same source.
    fn extract_many(&self, source: &Path, targets: &[(Window, PathBuf)]) -> Result<()> {
        for (window, dest) in targets {
            self.extract(source, window, dest)?;
        }
        Ok(())
    }
}

/// Pure-Rust extractor. Each window is decoded chunk by chunk and written one
/// band at a time, so memory stays bounded by a single window band no matter
/// how large the source is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeExtractor;

impl WindowExtractor for NativeExtractor {
    fn extract(&self, source: &Path, window: &Window, dest: &Path) -> Result<()> {
        GeoTiffReader::open(source)?.write_window(window, dest)
    }

    fn extract_many(&self, source: &Path, targets: &[(Window, PathBuf)]) -> Result<()> {
        let mut reader = GeoTiffReader::open(source)?;
        for (window, dest) in targets {
            reader.write_window(window, dest)?;
            debug!(source = %source.display(), dest = %dest.display(), "window extracted");
        }
        Ok(())
    }
}

/// Delegates to `gdal_translate -srcwin`.
#[derive(Debug, Clone)]
pub struct GdalTranslateExtractor {
    pub program: String,
}

impl Default for GdalTranslateExtractor {
    fn default() -> Self {
        Self {
            program: "gdal_translate".to_string(),
        }
    }
}

impl WindowExtractor for GdalTranslateExtractor {
    fn extract(&self, source: &Path, window: &Window, dest: &Path) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("-srcwin")
            .arg(window.col_offset.to_string())
            .arg(window.row_offset.to_string())
            .arg(window.col_size.to_string())
            .arg(window.row_size.to_string())
            .arg(source)
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| Error::ExternalStep {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;
        if !status.success() {
            return Err(Error::ExternalStep {
                program: self.program.clone(),
                reason: format!("{status}"),
            });
        }
        Ok(())
    }
}
