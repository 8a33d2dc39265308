//! In-memory rasters plus the GeoTIFF read/write/extract collaborators.
pub mod extract;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod geotiff;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::partition::Window;

pub use extract::{GdalTranslateExtractor, NativeExtractor, WindowExtractor};
pub use geotiff::{read_raster, write_raster, GeoTiffReader};

/// Nodata sentinel declared on classified output rasters.
pub const OUTPUT_NODATA: f64 = -9999.0;

/// Sample type of a raster band, as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl PixelType {
    pub fn is_integral(self) -> bool {
        !matches!(self, PixelType::F32 | PixelType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelType::U8 => "UInt8",
            PixelType::U16 => "UInt16",
            PixelType::U32 => "UInt32",
            PixelType::I8 => "Int8",
            PixelType::I16 => "Int16",
            PixelType::I32 => "Int32",
            PixelType::F32 => "Float32",
            PixelType::F64 => "Float64",
        }
    }
}

/// Affine pixel → world transform in GDAL coefficient order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub col_rotation: f64,
    /// Usually negative (north-up).
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with no rotation.
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            pixel_width,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height,
        }
    }

    pub fn from_gdal(c: [f64; 6]) -> Self {
        Self {
            origin_x: c[0],
            pixel_width: c[1],
            row_rotation: c[2],
            origin_y: c[3],
            col_rotation: c[4],
            pixel_height: c[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            self.row_rotation,
            self.origin_y,
            self.col_rotation,
            self.pixel_height,
        ]
    }

    /// Transform of a window extract: same pixel size, origin moved to the
    /// window's upper-left pixel corner.
    pub fn for_window(&self, window: &Window) -> Self {
        let col = window.col_offset as f64;
        let row = window.row_offset as f64;
        Self {
            origin_x: self.origin_x + col * self.pixel_width + row * self.row_rotation,
            origin_y: self.origin_y + col * self.col_rotation + row * self.pixel_height,
            ..*self
        }
    }
}

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GT_CITATION: u16 = 1026;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;
const USER_DEFINED: u16 = 32767;
const GEO_ASCII_PARAMS: u16 = 34737;

/// GeoTIFF coordinate reference keys: the GeoKeyDirectory (34735),
/// GeoDoubleParams (34736) and GeoAsciiParams (34737) tags.
///
/// Read from a source file and written back unchanged, so whatever CRS GDAL
/// or R put there reaches every derived raster.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoKeys {
    /// Four header shorts, then four shorts per key: id, tag location,
    /// count, value or offset.
    pub directory: Vec<u16>,
    pub doubles: Vec<f64>,
    /// `|`-terminated entries referenced by offset from the directory.
    pub ascii: String,
}

impl GeoKeys {
    /// Keys of a projected CRS identified by its EPSG code.
    pub fn projected(epsg: u16) -> Self {
        Self::coded(1, PROJECTED_CS_TYPE, epsg)
    }

    /// Keys of a geographic CRS identified by its EPSG code.
    pub fn geographic(epsg: u16) -> Self {
        Self::coded(2, GEOGRAPHIC_TYPE, epsg)
    }

    fn coded(model_type: u16, key: u16, epsg: u16) -> Self {
        Self {
            directory: vec![
                1, 1, 0, 3,
                GT_MODEL_TYPE, 0, 1, model_type,
                GT_RASTER_TYPE, 0, 1, 1,
                key, 0, 1, epsg,
            ],
            ..Self::default()
        }
    }

    /// Add a GTCitation key pointing at `text` in GeoAsciiParams.
    pub fn with_citation(mut self, text: &str) -> Result<Self> {
        let offset = u16::try_from(self.ascii.len());
        let count = u16::try_from(text.len() + 1);
        let (Ok(offset), Ok(count)) = (offset, count) else {
            return Err(Error::InvalidArgument(format!(
                "citation of {} bytes does not fit GeoAsciiParams",
                text.len()
            )));
        };
        if self.directory.len() < 4 {
            self.directory = vec![1, 1, 0, 0];
        }
        let keys = self.directory[3]
            .checked_add(1)
            .ok_or_else(|| Error::InvalidArgument("GeoKeyDirectory is full".into()))?;
        self.ascii.push_str(text);
        self.ascii.push('|');

        // Keys stay sorted by id.
        let at = self
            .entries()
            .position(|e| e[0] > GT_CITATION)
            .map_or(self.directory.len(), |i| 4 + i * 4);
        let tail = self.directory.split_off(at);
        self.directory.extend_from_slice(&[GT_CITATION, GEO_ASCII_PARAMS, count, offset]);
        self.directory.extend(tail);
        self.directory[3] = keys;
        Ok(self)
    }

    fn entries(&self) -> impl Iterator<Item = &[u16]> {
        let declared = self.directory.get(3).copied().unwrap_or(0) as usize;
        self.directory
            .get(4..)
            .unwrap_or(&[])
            .chunks_exact(4)
            .take(declared)
    }

    /// Inline short value of `key`.
    pub fn value(&self, key: u16) -> Option<u16> {
        self.entries().find(|e| e[0] == key && e[1] == 0).map(|e| e[3])
    }

    /// EPSG code of the projected or geographic CRS, if the file names one.
    pub fn epsg(&self) -> Option<u16> {
        self.value(PROJECTED_CS_TYPE)
            .or_else(|| self.value(GEOGRAPHIC_TYPE))
            .filter(|&code| code != 0 && code != USER_DEFINED)
    }

    /// GTCitation text without its terminator.
    pub fn citation(&self) -> Option<&str> {
        let entry = self
            .entries()
            .find(|e| e[0] == GT_CITATION && e[1] == GEO_ASCII_PARAMS)?;
        let start = entry[3] as usize;
        let text = self.ascii.get(start..start + entry[2] as usize)?;
        Some(text.trim_end_matches('|'))
    }
}

/// Shape and sample type of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterDescriptor {
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub pixel_type: PixelType,
}

/// A decoded raster. Every band is a row-major `f64` buffer of `width * height`.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub descriptor: RasterDescriptor,
    pub geotransform: Option<GeoTransform>,
    /// Spatial reference, as the GeoTIFF keys of the source file.
    pub geokeys: Option<GeoKeys>,
    pub nodata: Option<f64>,
    pub bands: Vec<Vec<f64>>,
}

impl Raster {
    pub fn new(width: usize, height: usize, pixel_type: PixelType, bands: Vec<Vec<f64>>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!("raster must be non-empty, got {width}x{height}")));
        }
        if bands.is_empty() {
            return Err(Error::InvalidArgument("raster needs at least one band".into()));
        }
        if let Some(bad) = bands.iter().find(|b| b.len() != width * height) {
            return Err(Error::InvalidArgument(format!(
                "band holds {} samples, expected {}",
                bad.len(),
                width * height
            )));
        }
        Ok(Self {
            descriptor: RasterDescriptor {
                width,
                height,
                band_count: bands.len(),
                pixel_type,
            },
            geotransform: None,
            geokeys: None,
            nodata: None,
            bands,
        })
    }

    pub fn width(&self) -> usize {
        self.descriptor.width
    }

    pub fn height(&self) -> usize {
        self.descriptor.height
    }

    pub fn pixel_type(&self) -> PixelType {
        self.descriptor.pixel_type
    }

    /// Band by zero-based index.
    pub fn band(&self, index: usize) -> Option<&[f64]> {
        self.bands.get(index).map(Vec::as_slice)
    }

    #[inline]
    pub fn get(&self, band: usize, row: usize, col: usize) -> f64 {
        self.bands[band][row * self.descriptor.width + col]
    }
}
