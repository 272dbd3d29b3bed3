//! In-memory DEM rasters and their on-disk formats.
//!
//! Two formats are read:
//! - GeoTIFF, georeferenced through ModelTiepoint/ModelPixelScale and a
//!   GeoKeyDirectory naming the EPSG code.
//! - SRTM `.hgt`, a headerless square grid of big-endian `i16` whose
//!   position comes from the cell name in the filename (`N34W119.hgt`).
//!
//! Output is always a single-band `f32` GeoTIFF.

use crate::crs::Crs;
use crate::geo::BoundingBox;
use crate::locator::GridCell;
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

/// NoData sentinel used by every canonical raster the pipeline produces.
pub const NODATA_VALUE: f32 = -9999.0;

/// Void marker in SRTM `.hgt` payloads.
pub const HGT_VOID: f32 = -32768.0;

// GeoTIFF tag IDs
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

// GeoKey IDs and values
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const RASTER_PIXEL_IS_POINT: u16 = 2;
const USER_DEFINED: u16 = 32767;

/// Interpolation used when sampling a raster at arbitrary coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingMethod {
    Nearest,
    #[default]
    Bilinear,
}

/// On-disk raster encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RasterFormat {
    GeoTiff,
    Hgt,
}

impl RasterFormat {
    /// File extension used when the payload is published to the cache.
    pub const fn extension(&self) -> &'static str {
        match self {
            RasterFormat::GeoTiff => "tif",
            RasterFormat::Hgt => "hgt",
        }
    }

    /// Sniff the format from the file's magic bytes and size.
    pub fn detect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut magic = [0u8; 4];
        let read = file.read(&mut magic)?;

        if read == 4 && is_tiff_magic(&magic) {
            return Ok(RasterFormat::GeoTiff);
        }
        if hgt_side(len).is_some() {
            return Ok(RasterFormat::Hgt);
        }
        Err(DemError::InvalidRaster(format!(
            "{} is neither a TIFF nor an SRTM HGT grid ({} bytes)",
            path.display(),
            len
        )))
    }
}

fn is_tiff_magic(magic: &[u8; 4]) -> bool {
    matches!(
        magic,
        [b'I', b'I', 42, 0] | [b'M', b'M', 0, 42] | [b'I', b'I', 43, 0] | [b'M', b'M', 0, 43]
    )
}

/// SRTM grid sides: 3 arc-second and 1 arc-second cells.
const HGT_SIDES: [u32; 2] = [1201, 3601];

/// Side length of an HGT grid with `len` bytes, if it is one of the SRTM sizes.
fn hgt_side(len: u64) -> Option<u32> {
    HGT_SIDES
        .iter()
        .copied()
        .find(|&side| u64::from(side) * u64::from(side) * 2 == len)
}

/// Dimensions read from a payload without decoding pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterHeader {
    pub format: RasterFormat,
    pub width: u32,
    pub height: u32,
}

/// A georeferenced single-band elevation grid.
///
/// Data is row-major, north to south, west to east. Bounds are the outer
/// pixel edges (pixel-is-area).
#[derive(Debug, Clone)]
pub struct DemRaster {
    /// Human-readable origin, usually the file stem.
    label: String,
    data: Vec<f32>,
    width: u32,
    height: u32,
    bounds: BoundingBox,
    crs: Crs,
    /// Elevations equal to this are treated as missing.
    nodata: Option<f32>,
}

impl DemRaster {
    pub fn new(
        label: String,
        data: Vec<f32>,
        width: u32,
        height: u32,
        bounds: BoundingBox,
        crs: Crs,
        nodata: Option<f32>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(DemError::InvalidRaster(format!(
                "{}: zero dimensions {}x{}",
                label, width, height
            )));
        }
        if data.len() != width as usize * height as usize {
            return Err(DemError::InvalidRaster(format!(
                "{}: {} values for a {}x{} grid",
                label,
                data.len(),
                width,
                height
            )));
        }
        if !(bounds.width() > 0.0 && bounds.height() > 0.0) {
            return Err(DemError::InvalidRaster(format!(
                "{}: degenerate bounds {}",
                label, bounds
            )));
        }
        Ok(Self {
            label,
            data,
            width,
            height,
            bounds,
            crs,
            nodata,
        })
    }

    /// Load a raster, detecting GeoTIFF or HGT from the file contents.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match RasterFormat::detect(path)? {
            RasterFormat::GeoTiff => Self::from_geotiff(path),
            RasterFormat::Hgt => Self::from_hgt(path),
        }
    }

    /// Load a DEM raster from a GeoTIFF file.
    pub fn from_geotiff<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut decoder = Decoder::new(file)?;

        // Large national tiles run to hundreds of MB of f32
        let mut limits = Limits::default();
        limits.decoding_buffer_size = 1024 * 1024 * 1024; // 1 GB
        limits.intermediate_buffer_size = 1024 * 1024 * 1024; // 1 GB
        limits.ifd_value_size = 1024 * 1024 * 1024;
        decoder = decoder.with_limits(limits);

        let (width, height) = decoder.dimensions()?;
        let geokeys = decoder
            .get_tag_u16_vec(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))
            .unwrap_or_default();
        let crs = crs_from_geokeys(&geokeys).unwrap_or(Crs::WGS84);
        let pixel_is_point = geokey_value(&geokeys, GT_RASTER_TYPE_GEO_KEY) == Some(RASTER_PIXEL_IS_POINT);
        let bounds = Self::read_georeference(&mut decoder, path, width, height, pixel_is_point)?;
        let data = Self::decode_elevation_data(&mut decoder)?;
        let nodata = Self::read_nodata_value(&mut decoder);

        Self::new(file_label(path), data, width, height, bounds, crs, nodata)
    }

    /// Load an SRTM `.hgt` cell. The filename must carry the cell name.
    pub fn from_hgt<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let label = file_label(path);
        let cell = GridCell::from_name(&label)
            .ok_or_else(|| DemError::InvalidFilename(path.display().to_string()))?;

        let bytes = std::fs::read(path)?;
        let side = hgt_side(bytes.len() as u64).ok_or_else(|| {
            DemError::InvalidRaster(format!(
                "{}: {} bytes is not a square grid of i16",
                path.display(),
                bytes.len()
            ))
        })?;
        let data: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]) as f32)
            .collect();

        // HGT samples sit on the cell's integer-degree lines (pixel-is-point),
        // so the outer pixel edges reach half a sample past the cell
        let half = 0.5 / (side - 1).max(1) as f64;
        let cell_bounds = cell.bounds();
        let bounds = BoundingBox::new(
            cell_bounds.min_x - half,
            cell_bounds.min_y - half,
            cell_bounds.max_x + half,
            cell_bounds.max_y + half,
        );

        Self::new(label, data, side, side, bounds, Crs::WGS84, Some(HGT_VOID))
    }

    /// Read dimensions only; used to verify a download before publishing it.
    pub fn probe_header<P: AsRef<Path>>(path: P) -> Result<RasterHeader> {
        let path = path.as_ref();
        let format = RasterFormat::detect(path)?;
        let (width, height) = match format {
            RasterFormat::GeoTiff => {
                let mut decoder = Decoder::new(File::open(path)?)?;
                decoder.dimensions()?
            }
            RasterFormat::Hgt => {
                let len = std::fs::metadata(path)?.len();
                let side = hgt_side(len).ok_or_else(|| {
                    DemError::InvalidRaster(format!("{}: not an SRTM HGT grid", path.display()))
                })?;
                (side, side)
            }
        };
        if width == 0 || height == 0 {
            return Err(DemError::InvalidRaster(format!(
                "{}: zero dimensions",
                path.display()
            )));
        }
        Ok(RasterHeader {
            format,
            width,
            height,
        })
    }

    /// Read the georeferencing from ModelTiepoint and ModelPixelScale.
    fn read_georeference<R: Read + Seek>(
        decoder: &mut Decoder<R>,
        path: &Path,
        width: u32,
        height: u32,
        pixel_is_point: bool,
    ) -> Result<BoundingBox> {
        let tiepoint = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT));
        let pixel_scale = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE));

        if let (Ok(tiepoint), Ok(scale)) = (tiepoint, pixel_scale) {
            if tiepoint.len() >= 6 && scale.len() >= 2 {
                // Tiepoint format: [i, j, k, x, y, z] ties raster (i, j) to model (x, y)
                let (scale_x, scale_y) = (scale[0], scale[1]);
                let mut min_x = tiepoint[3] - tiepoint[0] * scale_x;
                let mut max_y = tiepoint[4] + tiepoint[1] * scale_y;
                if pixel_is_point {
                    min_x -= scale_x / 2.0;
                    max_y += scale_y / 2.0;
                }
                return Ok(BoundingBox::new(
                    min_x,
                    max_y - height as f64 * scale_y,
                    min_x + width as f64 * scale_x,
                    max_y,
                ));
            }
        }

        // Fallback: a 1x1 degree cell named in the filename
        let label = file_label(path);
        GridCell::from_name(&label)
            .map(|cell| cell.bounds())
            .ok_or_else(|| {
                DemError::InvalidGeoTiff(format!(
                    "{} has no ModelTiepoint/ModelPixelScale and no cell name",
                    path.display()
                ))
            })
    }

    /// Decode elevation data from the TIFF decoder.
    fn decode_elevation_data<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Vec<f32>> {
        let result = decoder.read_image()?;

        match result {
            DecodingResult::F32(data) => Ok(data),
            DecodingResult::F64(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
            DecodingResult::I16(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
            DecodingResult::I32(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
            DecodingResult::U16(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
            DecodingResult::U32(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
            DecodingResult::U8(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
            DecodingResult::I8(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
            DecodingResult::U64(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
            DecodingResult::I64(data) => Ok(data.into_iter().map(|v| v as f32).collect()),
        }
    }

    /// GDAL_NODATA is stored as ASCII text.
    fn read_nodata_value<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f32> {
        decoder
            .get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_NODATA))
            .ok()
            .and_then(|text| text.trim_matches(char::from(0)).trim().parse().ok())
    }

    /// Write this raster as a single-band f32 GeoTIFF.
    ///
    /// The file is written next to `path` and renamed into place, so readers
    /// never observe a partial file.
    pub fn write_geotiff<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        let partial = std::path::PathBuf::from(partial);

        let result = (|| -> Result<()> {
            let mut writer = BufWriter::new(File::create(&partial)?);
            self.write_geotiff_to(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, path)?;
        Ok(())
    }

    /// Encode this raster as GeoTIFF into any seekable writer.
    pub fn write_geotiff_to<W: Write + Seek>(&self, writer: W) -> Result<()> {
        let mut encoder = TiffEncoder::new(writer)?;
        let mut image = encoder.new_image::<Gray32Float>(self.width, self.height)?;

        let (res_x, res_y) = self.resolution();
        let pixel_scale = [res_x, res_y, 0.0];
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE), &pixel_scale[..])?;

        // Tie raster (0, 0) to the north-west corner
        let tiepoint = [0.0, 0.0, 0.0, self.bounds.min_x, self.bounds.max_y, 0.0];
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(MODEL_TIEPOINT), &tiepoint[..])?;

        let geokeys = self.geokey_directory();
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY), &geokeys[..])?;

        if let Some(nodata) = self.nodata {
            let text = nodata.to_string();
            image
                .encoder()
                .write_tag(Tag::from_u16_exhaustive(GDAL_NODATA), text.as_str())?;
        }

        image.write_data(&self.data)?;
        Ok(())
    }

    fn geokey_directory(&self) -> Vec<u16> {
        let geographic = self.crs.is_geographic();
        // [KeyDirectoryVersion, KeyRevision, MinorRevision, NumberOfKeys]
        let mut keys = vec![1, 1, 0, 3];
        keys.extend_from_slice(&[
            GT_MODEL_TYPE_GEO_KEY,
            0,
            1,
            if geographic {
                MODEL_TYPE_GEOGRAPHIC
            } else {
                MODEL_TYPE_PROJECTED
            },
        ]);
        keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);
        let crs_key = if geographic {
            GEOGRAPHIC_TYPE_GEO_KEY
        } else {
            PROJECTED_CS_TYPE_GEO_KEY
        };
        keys.extend_from_slice(&[crs_key, 0, 1, self.crs.epsg()]);
        keys
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn nodata(&self) -> Option<f32> {
        self.nodata
    }

    /// Get the dimensions of this raster in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pixel size in CRS units, `(x, y)`.
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.bounds.width() / self.width as f64,
            self.bounds.height() / self.height as f64,
        )
    }

    /// Get the approximate resolution in meters at the center of the raster.
    ///
    /// Only meaningful for geographic rasters.
    pub fn resolution_meters(&self) -> (f64, f64) {
        let (lon_deg, lat_deg) = self.resolution();
        let center_lat = self.bounds.center().1;

        // At the equator, 1 degree ≈ 111,320 meters
        // Longitude shrinks by cos(latitude)
        let meters_per_deg_lat = 111_320.0;
        let meters_per_deg_lon = 111_320.0 * center_lat.to_radians().cos();

        (lon_deg * meters_per_deg_lon, lat_deg * meters_per_deg_lat)
    }

    /// Whether `value` is missing data for this raster.
    pub fn is_nodata(&self, value: f32) -> bool {
        value.is_nan()
            || self
                .nodata
                .map_or(false, |nodata| (value - nodata).abs() < 0.001)
    }

    /// Valid elevation at a pixel, `None` for NoData.
    pub fn pixel(&self, col: u32, row: u32) -> Option<f32> {
        let value = self.data[(row as usize) * (self.width as usize) + col as usize];
        (!self.is_nodata(value)).then_some(value)
    }

    /// Number of pixels holding valid elevations.
    pub fn valid_pixel_count(&self) -> u64 {
        self.data.iter().filter(|v| !self.is_nodata(**v)).count() as u64
    }

    /// Sample the raster at `(x, y)` in its own CRS.
    ///
    /// Returns `None` outside the bounds or where the result would be NoData.
    /// Bilinear sampling falls back to the nearest pixel when any of the four
    /// neighbours is NoData.
    pub fn sample(&self, x: f64, y: f64, method: ResamplingMethod) -> Option<f32> {
        if !self.bounds.contains(x, y) {
            return None;
        }
        let (res_x, res_y) = self.resolution();
        let fx = (x - self.bounds.min_x) / res_x;
        let fy = (self.bounds.max_y - y) / res_y;
        let max_col = self.width - 1;
        let max_row = self.height - 1;

        let nearest = || {
            let col = (fx.floor() as u32).min(max_col);
            let row = (fy.floor() as u32).min(max_row);
            self.pixel(col, row)
        };

        match method {
            ResamplingMethod::Nearest => nearest(),
            ResamplingMethod::Bilinear => {
                // Continuous pixel coordinates with centres on integers
                let col = (fx - 0.5).clamp(0.0, max_col as f64);
                let row = (fy - 0.5).clamp(0.0, max_row as f64);
                let c0 = col.floor() as u32;
                let r0 = row.floor() as u32;
                let c1 = (c0 + 1).min(max_col);
                let r1 = (r0 + 1).min(max_row);
                let tx = col - c0 as f64;
                let ty = row - r0 as f64;

                match (
                    self.pixel(c0, r0),
                    self.pixel(c1, r0),
                    self.pixel(c0, r1),
                    self.pixel(c1, r1),
                ) {
                    (Some(v00), Some(v10), Some(v01), Some(v11)) => {
                        let value = v00 as f64 * (1.0 - tx) * (1.0 - ty)
                            + v10 as f64 * tx * (1.0 - ty)
                            + v01 as f64 * (1.0 - tx) * ty
                            + v11 as f64 * tx * ty;
                        Some(value as f32)
                    }
                    _ => nearest(),
                }
            }
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

fn geokey_value(keys: &[u16], id: u16) -> Option<u16> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    keys[4..]
        .chunks_exact(4)
        .take(count)
        // Location 0 means the value is stored inline
        .find(|entry| entry[0] == id && entry[1] == 0)
        .map(|entry| entry[3])
}

fn crs_from_geokeys(keys: &[u16]) -> Option<Crs> {
    [PROJECTED_CS_TYPE_GEO_KEY, GEOGRAPHIC_TYPE_GEO_KEY]
        .iter()
        .filter_map(|id| geokey_value(keys, *id))
        .find(|code| *code != USER_DEFINED && *code != 0)
        .map(Crs::from_epsg)
}
