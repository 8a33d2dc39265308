//! GeoTIFF decode/encode on top of the pure-Rust `tiff` crate.
//!
//! Multi-band rasters are accepted as pixel-interleaved samples, planar
//! samples, or one image (IFD) per band; they are always written one IFD per
//! band. Pixels are decoded one chunk (strip or tile) at a time, so reading a
//! window holds one band of that window plus a single decoded chunk.
//!
//! Georeferencing lives on the first IFD: ModelPixelScale + ModelTiepoint or
//! ModelTransformation, the three GeoKey tags (carried through untouched) and
//! GDAL_NODATA.
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKindStandard, TiffValue};
use tiff::tags::Tag;

use super::{GeoKeys, GeoTransform, PixelType, Raster, RasterDescriptor};
use crate::error::{Error, Result};
use crate::partition::Window;

// ── Decode ────────────────────────────────────────────────────────────────────

/// Read every band of a GeoTIFF.
pub fn read_raster(path: impl AsRef<Path>) -> Result<Raster> {
    GeoTiffReader::open(path)?.read_all()
}

/// Width and height of a GeoTIFF without decoding pixel data.
pub fn read_dimensions(path: impl AsRef<Path>) -> Result<(usize, usize)> {
    let file = File::open(path.as_ref())?;
    let mut decoder = Decoder::new(BufReader::new(file))?;
    let (width, height) = decoder.dimensions()?;
    Ok((width as usize, height as usize))
}

/// IFD holding one or more bands.
#[derive(Debug, Clone, Copy)]
struct Page {
    ifd: usize,
    samples: usize,
    planar: bool,
}

/// Chunk-wise reader over the bands of one GeoTIFF.
pub struct GeoTiffReader<R: Read + Seek> {
    decoder: Decoder<R>,
    descriptor: RasterDescriptor,
    /// Page and sample index of every band.
    bands: Vec<(Page, usize)>,
    geotransform: Option<GeoTransform>,
    geokeys: Option<GeoKeys>,
    nodata: Option<f64>,
}

impl GeoTiffReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> GeoTiffReader<R> {
    /// Parse the directories; no pixel data is decoded yet.
    pub fn new(reader: R) -> Result<Self> {
        let mut decoder = Decoder::new(reader)?.with_limits(Limits::unlimited());
        let (width, height) = decoder.dimensions()?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("TIFF holds no image data".into()));
        }

        let geotransform = read_geotransform(&mut decoder);
        let geokeys = read_geokeys(&mut decoder);
        let nodata = read_ascii(&mut decoder, Tag::GdalNodata).and_then(|s| s.trim().parse::<f64>().ok());

        let pixel_type = page_pixel_type(&mut decoder)?;
        let mut bands = Vec::new();
        let mut ifd = 0;
        loop {
            // Trailing IFDs of another size are overviews or masks, not bands.
            if decoder.dimensions()? != (width, height) {
                break;
            }
            let page_type = page_pixel_type(&mut decoder)?;
            if page_type != pixel_type {
                return Err(Error::UnsupportedPixelType(format!(
                    "mixed band types {} and {}",
                    pixel_type.name(),
                    page_type.name()
                )));
            }
            let samples = decoder.find_tag_unsigned::<u16>(Tag::SamplesPerPixel)?.unwrap_or(1);
            let planar = decoder.find_tag_unsigned::<u16>(Tag::PlanarConfiguration)?.unwrap_or(1) == 2;
            let page = Page {
                ifd,
                samples: usize::from(samples),
                planar,
            };
            bands.extend((0..page.samples).map(|sample| (page, sample)));

            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
            ifd += 1;
        }

        Ok(Self {
            decoder,
            descriptor: RasterDescriptor {
                width: width as usize,
                height: height as usize,
                band_count: bands.len(),
                pixel_type,
            },
            bands,
            geotransform,
            geokeys,
            nodata,
        })
    }

    pub fn descriptor(&self) -> RasterDescriptor {
        self.descriptor
    }

    /// Decode the whole raster.
    pub fn read_all(&mut self) -> Result<Raster> {
        let full = Window {
            row_offset: 0,
            col_offset: 0,
            row_size: self.descriptor.height,
            col_size: self.descriptor.width,
            row_index: 0,
            col_index: 0,
        };
        self.read_window(&full)
    }

    /// Decode every band under `window`, georeferenced at the window origin.
    pub fn read_window(&mut self, window: &Window) -> Result<Raster> {
        self.check_window(window)?;
        let bands = (0..self.descriptor.band_count)
            .map(|band| self.read_band_window(band, window))
            .collect::<Result<Vec<_>>>()?;
        let mut raster = Raster::new(window.col_size, window.row_size, self.descriptor.pixel_type, bands)?;
        raster.geotransform = self.geotransform.map(|gt| gt.for_window(window));
        raster.geokeys = self.geokeys.clone();
        raster.nodata = self.nodata;
        Ok(raster)
    }

    /// Write the pixels under `window` to `dest`, one band at a time.
    pub fn write_window(&mut self, window: &Window, dest: &Path) -> Result<()> {
        self.check_window(window)?;
        let geokeys = self.geokeys.clone();
        let tags = GeoTags {
            geotransform: self.geotransform.map(|gt| gt.for_window(window)),
            geokeys: geokeys.as_ref(),
            nodata: self.nodata,
        };

        let mut writer = BufWriter::new(File::create(dest)?);
        let mut out = BandWriter::new(&mut writer, window.col_size, window.row_size, self.descriptor.pixel_type)?;
        for band in 0..self.descriptor.band_count {
            let data = self.read_band_window(band, window)?;
            out.write(&data, (band == 0).then_some(&tags))?;
        }
        drop(out);
        writer.flush()?;
        Ok(())
    }

    /// Decode one band under `window`, touching only the chunks it overlaps.
    pub fn read_band_window(&mut self, band: usize, window: &Window) -> Result<Vec<f64>> {
        self.check_window(window)?;
        let (page, sample) = *self.bands.get(band).ok_or_else(|| {
            Error::InvalidArgument(format!("band {band} out of range, raster has {}", self.bands.len()))
        })?;
        self.decoder.seek_to_image(page.ifd)?;

        let (width, height) = (self.descriptor.width, self.descriptor.height);
        let (chunk_w, chunk_h) = self.decoder.chunk_dimensions();
        let (chunk_w, chunk_h) = (chunk_w as usize, chunk_h as usize);
        if chunk_w == 0 || chunk_h == 0 {
            return Err(Error::InvalidArgument("TIFF declares empty chunks".into()));
        }
        let across = width.div_ceil(chunk_w);
        let down = height.div_ceil(chunk_h);
        // Planar files store each sample as its own run of chunks.
        let (stride, offset, first_chunk) = if page.planar {
            (1, 0, sample * across * down)
        } else {
            (page.samples, sample, 0)
        };

        let mut out = vec![0.0; window.pixel_count()];
        for cy in window.row_offset / chunk_h..=(window.row_end() - 1) / chunk_h {
            for cx in window.col_offset / chunk_w..=(window.col_end() - 1) / chunk_w {
                let index = u32::try_from(first_chunk + cy * across + cx)
                    .map_err(|_| Error::InvalidArgument("chunk index exceeds TIFF limits".into()))?;
                let samples = widen_samples(self.decoder.read_chunk(index)?)?;

                let (x0, y0) = (cx * chunk_w, cy * chunk_h);
                let data_w = chunk_w.min(width - x0);
                let rows = y0.max(window.row_offset)..(y0 + chunk_h).min(window.row_end());
                let cols = x0.max(window.col_offset)..(x0 + data_w).min(window.col_end());
                for r in rows {
                    let src = (r - y0) * data_w;
                    let dst = (r - window.row_offset) * window.col_size;
                    for c in cols.clone() {
                        let value = samples.get((src + c - x0) * stride + offset).ok_or_else(|| {
                            Error::InvalidArgument(format!(
                                "chunk {index} holds {} samples, too few for its extent",
                                samples.len()
                            ))
                        })?;
                        out[dst + c - window.col_offset] = *value;
                    }
                }
            }
        }
        Ok(out)
    }

    fn check_window(&self, window: &Window) -> Result<()> {
        let (width, height) = (self.descriptor.width, self.descriptor.height);
        if window.row_size == 0 || window.col_size == 0 || window.row_end() > height || window.col_end() > width {
            return Err(Error::InvalidArgument(format!(
                "window {}x{}+{}+{} exceeds raster {width}x{height}",
                window.col_size, window.row_size, window.col_offset, window.row_offset
            )));
        }
        Ok(())
    }
}

fn page_pixel_type<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<PixelType> {
    let first = |v: Option<Vec<u16>>| v.and_then(|v| v.first().copied());
    let bits = first(decoder.find_tag_unsigned_vec::<u16>(Tag::BitsPerSample)?).unwrap_or(1);
    let format = first(decoder.find_tag_unsigned_vec::<u16>(Tag::SampleFormat)?).unwrap_or(1);
    Ok(match (format, bits) {
        (1, 8) => PixelType::U8,
        (1, 16) => PixelType::U16,
        (1, 32) => PixelType::U32,
        (2, 8) => PixelType::I8,
        (2, 16) => PixelType::I16,
        (2, 32) => PixelType::I32,
        (3, 32) => PixelType::F32,
        (3, 64) => PixelType::F64,
        _ => {
            return Err(Error::UnsupportedPixelType(format!(
                "sample format {format} with {bits} bits per sample"
            )))
        }
    })
}

fn widen_samples(result: DecodingResult) -> Result<Vec<f64>> {
    fn widen<T: Copy + Into<f64>>(buf: Vec<T>) -> Vec<f64> {
        buf.into_iter().map(Into::into).collect()
    }
    Ok(match result {
        DecodingResult::U8(buf) => widen(buf),
        DecodingResult::U16(buf) => widen(buf),
        DecodingResult::U32(buf) => widen(buf),
        DecodingResult::I8(buf) => widen(buf),
        DecodingResult::I16(buf) => widen(buf),
        DecodingResult::I32(buf) => widen(buf),
        DecodingResult::F32(buf) => widen(buf),
        DecodingResult::F64(buf) => buf,
        _ => {
            return Err(Error::UnsupportedPixelType(
                "64-bit integer samples are not supported".into(),
            ))
        }
    })
}

fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(m) = decoder.get_tag_f64_vec(Tag::ModelTransformationTag) {
        if m.len() >= 8 {
            return Some(GeoTransform::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]]));
        }
    }
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok()?;
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return None;
    }
    // tiepoint: [I, J, K, X, Y, Z]
    Some(GeoTransform::new(
        tiepoint[3] - tiepoint[0] * scale[0],
        tiepoint[4] + tiepoint[1] * scale[1],
        scale[0],
        -scale[1],
    ))
}

fn read_geokeys<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoKeys> {
    let directory = decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag).ok()?;
    if directory.len() < 4 {
        return None;
    }
    Some(GeoKeys {
        directory,
        doubles: decoder.get_tag_f64_vec(Tag::GeoDoubleParamsTag).unwrap_or_default(),
        ascii: read_ascii(decoder, Tag::GeoAsciiParamsTag).unwrap_or_default(),
    })
}

fn read_ascii<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<String> {
    decoder
        .get_tag_ascii_string(tag)
        .ok()
        .map(|s| s.trim_end_matches('\0').to_string())
}

// ── Encode ────────────────────────────────────────────────────────────────────

/// Write `raster` as a GeoTIFF in its own pixel type, one IFD per band.
pub fn write_raster(path: impl AsRef<Path>, raster: &Raster) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    encode_raster(raster, &mut writer)?;
    writer.flush()?;
    Ok(())
}

fn encode_raster<W: Write + Seek>(raster: &Raster, writer: W) -> Result<()> {
    let tags = GeoTags {
        geotransform: raster.geotransform,
        geokeys: raster.geokeys.as_ref(),
        nodata: raster.nodata,
    };
    let mut out = BandWriter::new(writer, raster.width(), raster.height(), raster.pixel_type())?;
    for (i, band) in raster.bands.iter().enumerate() {
        out.write(band, (i == 0).then_some(&tags))?;
    }
    Ok(())
}

/// Georeferencing written on the first IFD.
struct GeoTags<'a> {
    geotransform: Option<GeoTransform>,
    geokeys: Option<&'a GeoKeys>,
    nodata: Option<f64>,
}

/// Appends bands to a TIFF as consecutive single-sample IFDs.
struct BandWriter<W: Write + Seek> {
    encoder: TiffEncoder<W>,
    width: u32,
    height: u32,
    pixel_type: PixelType,
}

macro_rules! write_as {
    ($out:expr, $color:ty, $sample:ty, $band:expr, $tags:expr) => {{
        let data: Vec<$sample> = $band.iter().map(|&v| v as $sample).collect();
        $out.write_page::<$color>(&data, $tags)
    }};
}

impl<W: Write + Seek> BandWriter<W> {
    fn new(writer: W, width: usize, height: usize, pixel_type: PixelType) -> Result<Self> {
        let dim = |n: usize| {
            u32::try_from(n).map_err(|_| Error::InvalidArgument(format!("dimension {n} exceeds TIFF limits")))
        };
        Ok(Self {
            encoder: TiffEncoder::new(writer)?,
            width: dim(width)?,
            height: dim(height)?,
            pixel_type,
        })
    }

    fn write(&mut self, band: &[f64], tags: Option<&GeoTags<'_>>) -> Result<()> {
        match self.pixel_type {
            PixelType::U8 => write_as!(self, colortype::Gray8, u8, band, tags),
            PixelType::U16 => write_as!(self, colortype::Gray16, u16, band, tags),
            PixelType::U32 => write_as!(self, colortype::Gray32, u32, band, tags),
            PixelType::I8 => write_as!(self, colortype::GrayI8, i8, band, tags),
            PixelType::I16 => write_as!(self, colortype::GrayI16, i16, band, tags),
            PixelType::I32 => write_as!(self, colortype::GrayI32, i32, band, tags),
            PixelType::F32 => write_as!(self, colortype::Gray32Float, f32, band, tags),
            PixelType::F64 => write_as!(self, colortype::Gray64Float, f64, band, tags),
        }
    }

    fn write_page<C>(&mut self, data: &[C::Inner], tags: Option<&GeoTags<'_>>) -> Result<()>
    where
        C: ColorType,
        [C::Inner]: TiffValue,
    {
        let mut image = self.encoder.new_image::<C>(self.width, self.height)?;
        if let Some(tags) = tags {
            write_geo_tags(image.encoder(), tags)?;
        }
        image.write_data(data)?;
        Ok(())
    }
}

fn write_geo_tags<W: Write + Seek>(
    dir: &mut DirectoryEncoder<'_, W, TiffKindStandard>,
    tags: &GeoTags<'_>,
) -> Result<()> {
    if let Some(gt) = tags.geotransform {
        if gt.row_rotation == 0.0 && gt.col_rotation == 0.0 {
            let scale = [gt.pixel_width, -gt.pixel_height, 0.0];
            let tiepoint = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
            dir.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
            dir.write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
        } else {
            let matrix = [
                gt.pixel_width, gt.row_rotation, 0.0, gt.origin_x,
                gt.col_rotation, gt.pixel_height, 0.0, gt.origin_y,
                0.0, 0.0, 0.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ];
            dir.write_tag(Tag::ModelTransformationTag, &matrix[..])?;
        }
    }

    if let Some(keys) = tags.geokeys {
        dir.write_tag(Tag::GeoKeyDirectoryTag, &keys.directory[..])?;
        if !keys.doubles.is_empty() {
            dir.write_tag(Tag::GeoDoubleParamsTag, &keys.doubles[..])?;
        }
        if !keys.ascii.is_empty() {
            dir.write_tag(Tag::GeoAsciiParamsTag, keys.ascii.as_str())?;
        }
    }

    if let Some(nodata) = tags.nodata {
        dir.write_tag(Tag::GdalNodata, format_nodata(nodata).as_str())?;
    }
    Ok(())
}

/// GDAL writes integral sentinels without a fractional part.
fn format_nodata(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
