//! Mosaic and clip engine.
//!
//! Cached tiles are loaded, reprojected into the canonical CRS, resampled
//! onto one pixel grid at the finest resolution present, clipped to the
//! request polygon and written as a single Float32 GeoTIFF.
//!
//! Every source-specific NoData (GDAL_NODATA, HGT voids, NaN) becomes
//! [`NODATA_VALUE`] in the output.

use crate::cache::CacheEntry;
use crate::crs::{ConsistencyWarning, CoordinateNormalizer, Crs};
use crate::geo::{BoundingBox, Polygon};
use crate::raster::{DemRaster, ResamplingMethod, NODATA_VALUE};
use crate::{DemError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Upper bound on output pixels, guarding against runaway grids.
pub const MAX_OUTPUT_PIXELS: u64 = 400_000_000;

/// Finished output raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterArtifact {
    pub path: PathBuf,
    pub crs: Crs,
    pub bounds: BoundingBox,
    /// Pixel size `(x, y)` in CRS units.
    pub resolution: (f64, f64),
    pub nodata_value: f32,
    pub width: u32,
    pub height: u32,
    pub valid_pixels: u64,
}

/// Result of [`MosaicEngine::build`].
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub artifact: RasterArtifact,
    pub warnings: Vec<ConsistencyWarning>,
    pub tiles: usize,
}

/// Combines cached tiles into clipped artifacts.
#[derive(Debug, Clone)]
pub struct MosaicEngine {
    normalizer: CoordinateNormalizer,
    output_dir: PathBuf,
}

impl MosaicEngine {
    pub fn new(normalizer: CoordinateNormalizer, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            normalizer,
            output_dir: output_dir.into(),
        }
    }

    pub fn normalizer(&self) -> &CoordinateNormalizer {
        &self.normalizer
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Read every cached tile from disk.
    pub fn load_tiles(&self, entries: &[CacheEntry]) -> Result<Vec<DemRaster>> {
        entries
            .iter()
            .map(|entry| DemRaster::from_file(&entry.local_path))
            .collect()
    }

    /// Check tile consistency, then bring every tile into the canonical CRS.
    ///
    /// Inconsistencies are returned as warnings and corrected by normalizing
    /// each tile on its own.
    pub fn normalize(
        &self,
        tiles: &[DemRaster],
        method: ResamplingMethod,
    ) -> Result<(Vec<DemRaster>, Vec<ConsistencyWarning>)> {
        let warnings = self.normalizer.validate_consistency(tiles);
        for warning in &warnings {
            warn!("{}", warning);
        }
        let canonical = tiles
            .iter()
            .map(|tile| self.normalizer.to_canonical(tile, method))
            .collect::<Result<Vec<_>>>()?;
        Ok((canonical, warnings))
    }

    /// Resample canonical tiles onto one grid covering `area ∩ tiles`.
    ///
    /// The grid uses the finest tile resolution and its bounds are exactly
    /// the intersection. Where tiles overlap, the first tile with a valid
    /// sample wins. A single tile is sampled with nearest neighbour so its
    /// values pass through unchanged.
    pub fn mosaic(
        &self,
        tiles: &[DemRaster],
        area: &BoundingBox,
        method: ResamplingMethod,
    ) -> Result<DemRaster> {
        let canonical = self.normalizer.canonical();
        if let Some(tile) = tiles.iter().find(|t| t.crs() != canonical) {
            return Err(DemError::Internal(format!(
                "tile {} is in {}, expected {}",
                tile.label(),
                tile.crs(),
                canonical
            )));
        }

        let extent = tiles
            .iter()
            .map(|t| *t.bounds())
            .reduce(|acc, b| acc.union(&b))
            .ok_or(DemError::EmptyResult)?;
        let window = area.intersection(&extent).ok_or(DemError::EmptyResult)?;
        if !(window.width() > 0.0 && window.height() > 0.0) {
            return Err(DemError::EmptyResult);
        }

        let (res_x, res_y) = tiles
            .iter()
            .map(DemRaster::resolution)
            .fold((f64::INFINITY, f64::INFINITY), |(ax, ay), (x, y)| {
                (ax.min(x), ay.min(y))
            });
        let width = ((window.width() / res_x).round() as u64).max(1);
        let height = ((window.height() / res_y).round() as u64).max(1);
        if width * height > MAX_OUTPUT_PIXELS || width > u32::MAX as u64 || height > u32::MAX as u64 {
            return Err(DemError::InvalidRaster(format!(
                "output grid {}x{} exceeds {} pixels",
                width, height, MAX_OUTPUT_PIXELS
            )));
        }
        let (width, height) = (width as u32, height as u32);
        let step_x = window.width() / width as f64;
        let step_y = window.height() / height as f64;

        let method = if tiles.len() == 1 {
            ResamplingMethod::Nearest
        } else {
            method
        };
        debug!(
            "Mosaicking {} tile(s) onto {}x{} grid over {} ({:?})",
            tiles.len(),
            width,
            height,
            window,
            method
        );

        let mut data = vec![NODATA_VALUE; width as usize * height as usize];
        data.par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(row, out)| {
                let y = window.max_y - (row as f64 + 0.5) * step_y;
                for (col, value) in out.iter_mut().enumerate() {
                    let x = window.min_x + (col as f64 + 0.5) * step_x;
                    if let Some(v) = tiles.iter().find_map(|t| t.sample(x, y, method)) {
                        *value = v;
                    }
                }
            });

        DemRaster::new(
            "mosaic".to_string(),
            data,
            width,
            height,
            window,
            canonical,
            Some(NODATA_VALUE),
        )
    }

    /// Set every pixel whose centre is outside `polygon` to NoData.
    ///
    /// Fails with [`DemError::EmptyResult`] when nothing valid remains.
    pub fn clip(&self, raster: &DemRaster, polygon: &Polygon) -> Result<DemRaster> {
        let (width, height) = raster.dimensions();
        let (res_x, res_y) = raster.resolution();
        let bounds = *raster.bounds();

        let mut data = raster.data().to_vec();
        data.par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(row, out)| {
                let y = bounds.max_y - (row as f64 + 0.5) * res_y;
                for (col, value) in out.iter_mut().enumerate() {
                    let x = bounds.min_x + (col as f64 + 0.5) * res_x;
                    if raster.is_nodata(*value) || !polygon.contains(x, y) {
                        *value = NODATA_VALUE;
                    }
                }
            });

        let clipped = DemRaster::new(
            raster.label().to_string(),
            data,
            width,
            height,
            bounds,
            raster.crs(),
            Some(NODATA_VALUE),
        )?;
        if clipped.valid_pixel_count() == 0 {
            return Err(DemError::EmptyResult);
        }
        Ok(clipped)
    }

    /// Write `raster` to `{output_dir}/{name}.tif`.
    pub fn write_artifact(&self, raster: &DemRaster, name: &str) -> Result<RasterArtifact> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(format!("{}.tif", name));
        raster.write_geotiff(&path)?;

        let (width, height) = raster.dimensions();
        let artifact = RasterArtifact {
            path,
            crs: raster.crs(),
            bounds: *raster.bounds(),
            resolution: raster.resolution(),
            nodata_value: NODATA_VALUE,
            width,
            height,
            valid_pixels: raster.valid_pixel_count(),
        };
        info!(
            "Wrote {} ({}x{}, {} valid pixels)",
            artifact.path.display(),
            width,
            height,
            artifact.valid_pixels
        );
        Ok(artifact)
    }

    /// Load, normalize, mosaic, clip and write in one call.
    ///
    /// `polygon` must be in the canonical CRS.
    pub fn build(
        &self,
        entries: &[CacheEntry],
        polygon: &Polygon,
        method: ResamplingMethod,
        name: &str,
    ) -> Result<BuildOutput> {
        let tiles = self.load_tiles(entries)?;
        let (canonical, warnings) = self.normalize(&tiles, method)?;
        let merged = self.mosaic(&canonical, &polygon.bbox(), method)?;
        let clipped = self.clip(&merged, polygon)?;
        let artifact = self.write_artifact(&clipped, name)?;
        Ok(BuildOutput {
            artifact,
            warnings,
            tiles: tiles.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn engine() -> MosaicEngine {
        MosaicEngine::new(CoordinateNormalizer::default(), std::env::temp_dir())
    }

    fn tile(label: &str, bounds: BoundingBox, size: u32, value: f32, nodata: Option<f32>) -> DemRaster {
        DemRaster::new(
            label.to_string(),
            vec![value; (size * size) as usize],
            size,
            size,
            bounds,
            Crs::WGS84,
            nodata,
        )
        .unwrap()
    }

    #[test]
    fn test_mosaic_bounds_are_area_intersection() {
        let t = tile("a", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 100, 5.0, None);
        let out = engine()
            .mosaic(&[t], &BoundingBox::new(0.5, 0.5, 2.0, 2.0), ResamplingMethod::Bilinear)
            .unwrap();
        assert_eq!(*out.bounds(), BoundingBox::new(0.5, 0.5, 1.0, 1.0));
        assert_eq!(out.dimensions(), (50, 50));
        assert_eq!(out.valid_pixel_count(), 2500);
    }

    #[test]
    fn test_mosaic_disjoint_area_is_empty() {
        let t = tile("a", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 10, 5.0, None);
        let err = engine()
            .mosaic(&[t], &BoundingBox::new(3.0, 3.0, 4.0, 4.0), ResamplingMethod::Nearest)
            .unwrap_err();
        assert!(matches!(err, DemError::EmptyResult));
    }

    #[test]
    fn test_mosaic_zero_height_area_is_empty() {
        let t = tile("a", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 10, 5.0, None);
        let err = engine()
            .mosaic(&[t], &BoundingBox::new(0.2, 0.5, 0.8, 0.5), ResamplingMethod::Nearest)
            .unwrap_err();
        assert!(matches!(err, DemError::EmptyResult));
    }

    #[test]
    fn test_mosaic_uses_finest_resolution() {
        let coarse = tile("c", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 10, 1.0, None);
        let fine = tile("f", BoundingBox::new(1.0, 0.0, 2.0, 1.0), 40, 2.0, None);
        let out = engine()
            .mosaic(&[coarse, fine], &BoundingBox::new(0.0, 0.0, 2.0, 1.0), ResamplingMethod::Nearest)
            .unwrap();
        assert_eq!(out.dimensions(), (80, 40));
        assert_relative_eq!(out.resolution().0, 0.025);
    }

    #[test]
    fn test_mosaic_unifies_nodata() {
        let voids = tile("v", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 4, -32768.0, Some(-32768.0));
        let out = engine()
            .mosaic(&[voids], &BoundingBox::new(0.0, 0.0, 1.0, 1.0), ResamplingMethod::Nearest)
            .unwrap();
        assert_eq!(out.nodata(), Some(NODATA_VALUE));
        assert!(out.data().iter().all(|v| *v == NODATA_VALUE));
    }

    #[test]
    fn test_clip_masks_outside_polygon() {
        let t = tile("a", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 10, 7.0, None);
        // Hypotenuse nudged so no pixel centre lies on the edge
        let triangle = Polygon::new(vec![(0.0, 0.0), (1.0, 0.0), (0.0, 0.999)], vec![]).unwrap();
        let clipped = engine().clip(&t, &triangle).unwrap();

        // Centre (0.05, 0.05) is inside, (0.95, 0.95) is not
        assert_eq!(clipped.pixel(0, 9), Some(7.0));
        assert_eq!(clipped.pixel(9, 0), None);
        assert_eq!(clipped.valid_pixel_count(), 45);
    }

    #[test]
    fn test_clip_with_no_valid_pixels_is_empty() {
        let t = tile("a", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 10, 7.0, None);
        // Sliver between pixel centres
        let sliver = Polygon::new(vec![(0.0, 0.01), (1.0, 0.01), (1.0, 0.02), (0.0, 0.02)], vec![]).unwrap();
        let err = engine().clip(&t, &sliver).unwrap_err();
        assert!(matches!(err, DemError::EmptyResult));
    }
}
