//! Grid partitioning of a raster into fixed-size pixel windows.
//!
//! Windows come out row-major (outer loop rows, inner loop columns) so that two
//! rasters with the same dimensions partitioned with the same tile size yield
//! index-aligned window lists.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A pixel rectangle inside a source raster, tagged with its grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub row_offset: usize,
    pub col_offset: usize,
    pub row_size: usize,
    pub col_size: usize,
    /// Position of this window in the tile grid.
    pub row_index: usize,
    pub col_index: usize,
}

impl Window {
    pub fn pixel_count(&self) -> usize {
        self.row_size * self.col_size
    }

    pub fn row_end(&self) -> usize {
        self.row_offset + self.row_size
    }

    pub fn col_end(&self) -> usize {
        self.col_offset + self.col_size
    }

    /// Same pixel footprint, ignoring grid position.
    pub fn same_extent(&self, other: &Window) -> bool {
        self.row_offset == other.row_offset
            && self.col_offset == other.col_offset
            && self.row_size == other.row_size
            && self.col_size == other.col_size
    }
}

/// File-name pattern for window extracts: `{prefix}_{row}.{col}{suffix}.{extension}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    pub prefix: String,
    pub suffix: String,
    pub extension: String,
}

impl NamePattern {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            extension: "tif".to_string(),
        }
    }

    /// Name without suffix or extension, e.g. `32UMU_1.0`. Identifies the tile.
    pub fn stem(&self, window: &Window) -> String {
        format!("{}_{}.{}", self.prefix, window.row_index, window.col_index)
    }

    pub fn file_name(&self, window: &Window) -> String {
        format!("{}{}.{}", self.stem(window), self.suffix, self.extension)
    }
}

/// Offsets and extents along one axis. The last extent is the remainder; a
/// zero remainder would describe an empty window and is dropped.
fn axis_spans(length: usize, tile_size: usize) -> Vec<(usize, usize)> {
    let offsets: Vec<usize> = (0..length).step_by(tile_size).collect();
    let mut spans: Vec<(usize, usize)> = offsets.iter().map(|&o| (o, tile_size)).collect();
    if let (Some(&last), Some(span)) = (offsets.last(), spans.last_mut()) {
        span.1 = length - last;
        if span.1 == 0 {
            spans.pop();
        }
    }
    spans
}

/// Split a `width` x `height` raster into windows of at most `tile_size` pixels
/// per edge.
pub fn partition(width: usize, height: usize, tile_size: usize) -> Result<Vec<Window>> {
    if tile_size == 0 {
        return Err(Error::InvalidArgument("tile size must be positive".into()));
    }

    let rows = axis_spans(height, tile_size);
    let cols = axis_spans(width, tile_size);

    let mut windows = Vec::with_capacity(rows.len() * cols.len());
    for (row_index, &(row_offset, row_size)) in rows.iter().enumerate() {
        for (col_index, &(col_offset, col_size)) in cols.iter().enumerate() {
            windows.push(Window {
                row_offset,
                col_offset,
                row_size,
                col_size,
                row_index,
                col_index,
            });
        }
    }
    Ok(windows)
}

/// [`partition`], pairing every window with its file name under `pattern`.
pub fn partition_named(
    width: usize,
    height: usize,
    tile_size: usize,
    pattern: &NamePattern,
) -> Result<Vec<(Window, String)>> {
    Ok(partition(width, height, tile_size)?
        .into_iter()
        .map(|w| {
            let name = pattern.file_name(&w);
            (w, name)
        })
        .collect())
}
