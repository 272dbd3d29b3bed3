//! Coordinate reference systems and the normalizer that moves geometries and
//! rasters between a source's native CRS and the canonical CRS.
//!
//! Projection is pure Rust: PROJ.4 definitions come from `crs-definitions`
//! and are executed by `proj4rs`. `proj4rs` works in radians for geographic
//! systems, so degree/radian conversion happens at the [`Projector`] edge.

use crate::geo::{BoundingBox, Polygon};
use crate::raster::{DemRaster, ResamplingMethod, NODATA_VALUE};
use crate::{DemError, Result};
use proj4rs::proj::Proj;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Points sampled per bounding-box edge when projecting a box.
const DEFAULT_DENSIFY_POINTS: usize = 21;

/// Relative resolution difference tolerated within one resolution family.
const RESOLUTION_FAMILY_TOLERANCE: f64 = 0.01;

/// An EPSG coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(u16);

impl Crs {
    /// WGS84 geographic, the canonical CRS for all pipeline output.
    pub const WGS84: Crs = Crs(4326);

    pub const fn from_epsg(code: u16) -> Self {
        Crs(code)
    }

    pub const fn epsg(&self) -> u16 {
        self.0
    }

    /// PROJ.4 definition from the bundled EPSG database.
    pub fn proj_string(&self) -> Option<&'static str> {
        crs_definitions::from_code(self.0).map(|def| def.proj4)
    }

    /// Whether coordinates are longitude/latitude in degrees.
    pub fn is_geographic(&self) -> bool {
        match self.proj_string() {
            Some(def) => def.contains("+proj=longlat"),
            None => (4000..5000).contains(&self.0),
        }
    }

    fn to_proj(self) -> Result<Proj> {
        let def = self.proj_string().ok_or_else(|| {
            DemError::Projection(format!("{} is not in the EPSG database", self))
        })?;
        Proj::from_proj_string(def)
            .map_err(|e| DemError::Projection(format!("invalid definition for {}: {:?}", self, e)))
    }
}

impl Default for Crs {
    fn default() -> Self {
        Crs::WGS84
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

impl FromStr for Crs {
    type Err = DemError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        digits
            .parse::<u16>()
            .map(Crs)
            .map_err(|_| DemError::Projection(format!("cannot parse CRS '{}'", s)))
    }
}

/// A ready-to-use transformation between two CRSs.
///
/// Construction parses both definitions once; identity transforms skip
/// `proj4rs` entirely.
pub struct Projector {
    source: Crs,
    target: Crs,
    projs: Option<(Proj, Proj)>,
    source_geographic: bool,
    target_geographic: bool,
}

impl Projector {
    pub fn new(source: Crs, target: Crs) -> Result<Self> {
        let projs = if source == target {
            None
        } else {
            Some((source.to_proj()?, target.to_proj()?))
        };
        Ok(Self {
            source,
            target,
            projs,
            source_geographic: source.is_geographic(),
            target_geographic: target.is_geographic(),
        })
    }

    pub fn source(&self) -> Crs {
        self.source
    }

    pub fn target(&self) -> Crs {
        self.target
    }

    /// Transform a single point.
    pub fn project(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let Some((from, to)) = &self.projs else {
            return Ok((x, y));
        };

        let mut point = if self.source_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        proj4rs::transform::transform(from, to, &mut point).map_err(|e| {
            DemError::Projection(format!(
                "({}, {}) from {} to {} failed: {:?}",
                x, y, self.source, self.target, e
            ))
        })?;

        let (out_x, out_y) = if self.target_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if !out_x.is_finite() || !out_y.is_finite() {
            return Err(DemError::Projection(format!(
                "({}, {}) has no finite image in {}",
                x, y, self.target
            )));
        }
        Ok((out_x, out_y))
    }

    /// Project a box by projecting its densified outline and taking the
    /// envelope of the results.
    pub fn project_bbox(&self, bbox: &BoundingBox, points_per_edge: usize) -> Result<BoundingBox> {
        if self.projs.is_none() {
            return Ok(*bbox);
        }
        let projected = bbox
            .densified_outline(points_per_edge)
            .into_iter()
            .map(|(x, y)| self.project(x, y))
            .collect::<Result<Vec<_>>>()?;
        BoundingBox::from_points(projected)
            .ok_or_else(|| DemError::Internal("empty outline while projecting bbox".into()))
    }
}

/// Non-fatal disagreement between tiles feeding one mosaic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ConsistencyWarning {
    /// Tiles arrived in more than one CRS.
    MixedCrs { found: Vec<Crs> },
    /// Tile resolutions differ by more than the family tolerance.
    MixedResolution { finest: f64, coarsest: f64 },
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyWarning::MixedCrs { found } => {
                let names: Vec<String> = found.iter().map(Crs::to_string).collect();
                write!(f, "crs_mismatch: tiles use {}", names.join(", "))
            }
            ConsistencyWarning::MixedResolution { finest, coarsest } => write!(
                f,
                "crs_mismatch: tile resolutions range from {:.3} m to {:.3} m",
                finest, coarsest
            ),
        }
    }
}

/// Converts geometries into a source's native CRS and rasters back into the
/// canonical CRS.
#[derive(Debug, Clone)]
pub struct CoordinateNormalizer {
    canonical: Crs,
    densify_points: usize,
}

impl Default for CoordinateNormalizer {
    fn default() -> Self {
        Self::new(Crs::WGS84)
    }
}

impl CoordinateNormalizer {
    pub fn new(canonical: Crs) -> Self {
        Self {
            canonical,
            densify_points: DEFAULT_DENSIFY_POINTS,
        }
    }

    pub fn canonical(&self) -> Crs {
        self.canonical
    }

    /// Project a canonical polygon into `target`.
    pub fn to_native(&self, polygon: &Polygon, target: Crs) -> Result<Polygon> {
        let projector = Projector::new(self.canonical, target)?;
        polygon.try_map(|x, y| projector.project(x, y))
    }

    /// Project a canonical bounding box into `target`, densifying edges.
    pub fn bbox_to_native(&self, bbox: &BoundingBox, target: Crs) -> Result<BoundingBox> {
        Projector::new(self.canonical, target)?.project_bbox(bbox, self.densify_points)
    }

    /// Project a box from `source` into the canonical CRS.
    pub fn bbox_to_canonical(&self, bbox: &BoundingBox, source: Crs) -> Result<BoundingBox> {
        Projector::new(source, self.canonical)?.project_bbox(bbox, self.densify_points)
    }

    /// Reproject a raster into the canonical CRS.
    ///
    /// The output grid covers the projected envelope of the input with the
    /// same pixel count. Each output pixel centre is mapped back into the
    /// source CRS and sampled with `method`; pixels that fall outside the
    /// source or on its NoData become [`NODATA_VALUE`].
    pub fn to_canonical(&self, raster: &DemRaster, method: ResamplingMethod) -> Result<DemRaster> {
        if raster.crs() == self.canonical {
            return Ok(raster.clone());
        }

        let forward = Projector::new(raster.crs(), self.canonical)?;
        let inverse = Projector::new(self.canonical, raster.crs())?;
        let bounds = forward.project_bbox(raster.bounds(), self.densify_points)?;
        let (width, height) = raster.dimensions();
        let res_x = bounds.width() / width as f64;
        let res_y = bounds.height() / height as f64;

        debug!(
            "Reprojecting {} from {} to {} ({}x{}, {:?})",
            raster.label(),
            raster.crs(),
            self.canonical,
            width,
            height,
            method
        );

        let mut data = vec![NODATA_VALUE; (width as usize) * (height as usize)];
        for row in 0..height as usize {
            let y = bounds.max_y - (row as f64 + 0.5) * res_y;
            for col in 0..width as usize {
                let x = bounds.min_x + (col as f64 + 0.5) * res_x;
                // Points with no image in the source CRS stay NoData
                if let Ok((sx, sy)) = inverse.project(x, y) {
                    if let Some(v) = raster.sample(sx, sy, method) {
                        data[row * width as usize + col] = v;
                    }
                }
            }
        }

        DemRaster::new(
            raster.label().to_string(),
            data,
            width,
            height,
            bounds,
            self.canonical,
            Some(NODATA_VALUE),
        )
    }

    /// Check that tiles agree in CRS and resolution family.
    ///
    /// Mismatches are reported, never raised: the mosaic still proceeds.
    pub fn validate_consistency(&self, tiles: &[DemRaster]) -> Vec<ConsistencyWarning> {
        let mut warnings = Vec::new();

        let mut found: Vec<Crs> = tiles.iter().map(DemRaster::crs).collect();
        found.sort();
        found.dedup();
        if found.len() > 1 {
            warnings.push(ConsistencyWarning::MixedCrs { found });
        }

        let resolutions: Vec<f64> = tiles
            .iter()
            .map(|t| {
                if t.crs().is_geographic() {
                    t.resolution_meters().0
                } else {
                    t.resolution().0
                }
            })
            .filter(|r| r.is_finite() && *r > 0.0)
            .collect();
        if let (Some(finest), Some(coarsest)) = (
            resolutions.iter().copied().reduce(f64::min),
            resolutions.iter().copied().reduce(f64::max),
        ) {
            if (coarsest - finest) / finest > RESOLUTION_FAMILY_TOLERANCE {
                warnings.push(ConsistencyWarning::MixedResolution { finest, coarsest });
            }
        }

        warnings
    }
}
