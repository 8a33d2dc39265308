//! GeoTIFFs laid out the way GDAL writes them, built directly on the `tiff`
//! encoder instead of this crate's writer.
use std::fs::File;
use std::io::{Seek, Write};
use std::path::Path;

use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{ImageEncoder, TiffEncoder, TiffKindStandard};
use tiff::tags::Tag;

pub const UTM_32N: u16 = 32632;
pub const UTM_32N_CITATION: &str = "WGS 84 / UTM zone 32N|";
pub const ORIGIN: (f64, f64) = (399_960.0, 5_900_040.0);
pub const PIXEL_SIZE: f64 = 10.0;

/// GeoKeyDirectory of a GDAL `EPSG:32632` product.
pub fn utm_32n_keys() -> Vec<u16> {
    vec![
        1, 1, 0, 4,
        1024, 0, 1, 1,
        1025, 0, 1, 1,
        1026, 34737, 22, 0,
        3072, 0, 1, UTM_32N,
    ]
}

fn georeference<W: Write + Seek, C: ColorType>(image: &mut ImageEncoder<'_, W, C, TiffKindStandard>) {
    let dir = image.encoder();
    dir.write_tag(Tag::ModelPixelScaleTag, &[PIXEL_SIZE, PIXEL_SIZE, 0.0][..]).unwrap();
    dir.write_tag(Tag::ModelTiepointTag, &[0.0, 0.0, 0.0, ORIGIN.0, ORIGIN.1, 0.0][..])
        .unwrap();
    dir.write_tag(Tag::GeoKeyDirectoryTag, &utm_32n_keys()[..]).unwrap();
    dir.write_tag(Tag::GeoAsciiParamsTag, UTM_32N_CITATION).unwrap();
    dir.write_tag(Tag::GdalNodata, "0").unwrap();
}

/// Single-band UInt16 file in strips of `rows_per_strip` rows, nodata 0.
pub fn write_utm_u16(path: &Path, width: u32, height: u32, data: &[u16], rows_per_strip: u32) {
    let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
    let mut image = encoder.new_image::<colortype::Gray16>(width, height).unwrap();
    image.rows_per_strip(rows_per_strip).unwrap();
    georeference(&mut image);
    image.write_data(data).unwrap();
}

/// Three pixel-interleaved UInt8 bands in strips of `rows_per_strip` rows,
/// nodata 0.
pub fn write_utm_rgb8(path: &Path, width: u32, height: u32, data: &[u8], rows_per_strip: u32) {
    let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
    let mut image = encoder.new_image::<colortype::RGB8>(width, height).unwrap();
    image.rows_per_strip(rows_per_strip).unwrap();
    georeference(&mut image);
    image.write_data(data).unwrap();
}
