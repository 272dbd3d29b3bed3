//! Planar geometry primitives: bounding boxes and polygons.
//!
//! Coordinates are `(x, y)` pairs. In the canonical CRS that is
//! `(longitude, latitude)` in degrees; in a projected CRS it is
//! `(easting, northing)` in that CRS's units.

use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Axis-aligned rectangle in some CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// West edge.
    pub min_x: f64,
    /// South edge.
    pub min_y: f64,
    /// East edge.
    pub max_x: f64,
    /// North edge.
    pub max_y: f64,
}

impl BoundingBox {
    /// Build a box, swapping edges given in the wrong order.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    /// Smallest box containing every point, or `None` for an empty iterator.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut iter = points.into_iter();
        let (x0, y0) = iter.next()?;
        let mut bbox = Self {
            min_x: x0,
            min_y: y0,
            max_x: x0,
            max_y: y0,
        };
        for (x, y) in iter {
            bbox.expand_to_include(x, y);
        }
        Some(bbox)
    }

    /// Grow the box so that it contains `(x, y)`.
    pub fn expand_to_include(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Centre point.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Check if a point is within the box (edges inclusive).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Whether the two boxes share interior area.
    ///
    /// Boxes that only touch along an edge do not intersect.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }

    /// Overlapping area, if any.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        if !self.intersects(other) {
            return None;
        }
        Some(BoundingBox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        })
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Points spaced along all four edges, corners included.
    ///
    /// Projecting the densified outline rather than the corners alone keeps
    /// curved edges inside the projected box.
    pub fn densified_outline(&self, points_per_edge: usize) -> Vec<(f64, f64)> {
        let n = points_per_edge.max(2);
        let mut out = Vec::with_capacity(4 * n);
        for i in 0..n {
            let t = i as f64 / (n - 1) as f64;
            let x = self.min_x + t * self.width();
            let y = self.min_y + t * self.height();
            out.push((x, self.min_y));
            out.push((x, self.max_y));
            out.push((self.min_x, y));
            out.push((self.max_x, y));
        }
        out
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.6}, {:.6}, {:.6}, {:.6}]",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

/// A simple polygon with optional holes.
///
/// Rings are stored open: the first vertex is not repeated at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    exterior: Vec<(f64, f64)>,
    holes: Vec<Vec<(f64, f64)>>,
}

impl Polygon {
    /// Build a polygon from its rings.
    ///
    /// Each ring needs at least three distinct vertices and finite coordinates.
    pub fn new(exterior: Vec<(f64, f64)>, holes: Vec<Vec<(f64, f64)>>) -> Result<Self> {
        let exterior = normalize_ring(exterior)?;
        let holes = holes
            .into_iter()
            .map(normalize_ring)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { exterior, holes })
    }

    /// Rectangle covering `bbox`.
    pub fn from_bbox(bbox: &BoundingBox) -> Self {
        Self {
            exterior: vec![
                (bbox.min_x, bbox.min_y),
                (bbox.max_x, bbox.min_y),
                (bbox.max_x, bbox.max_y),
                (bbox.min_x, bbox.max_y),
            ],
            holes: Vec::new(),
        }
    }

    /// Parse a GeoJSON `Polygon` geometry, a `Feature` wrapping one, or a
    /// `FeatureCollection` holding exactly one such feature.
    pub fn from_geojson(value: &Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| DemError::InvalidGeometry("GeoJSON object has no \"type\"".into()))?;

        match kind {
            "Polygon" => {
                let rings = value
                    .get("coordinates")
                    .and_then(Value::as_array)
                    .ok_or_else(|| DemError::InvalidGeometry("Polygon has no coordinates".into()))?;
                let mut rings = rings.iter().map(parse_ring);
                let exterior = rings
                    .next()
                    .ok_or_else(|| DemError::InvalidGeometry("Polygon has no rings".into()))??;
                let holes = rings.collect::<Result<Vec<_>>>()?;
                Self::new(exterior, holes)
            }
            "Feature" => {
                let geometry = value
                    .get("geometry")
                    .ok_or_else(|| DemError::InvalidGeometry("Feature has no geometry".into()))?;
                Self::from_geojson(geometry)
            }
            "FeatureCollection" => {
                let features = value
                    .get("features")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        DemError::InvalidGeometry("FeatureCollection has no features".into())
                    })?;
                match features.as_slice() {
                    [single] => Self::from_geojson(single),
                    other => Err(DemError::InvalidGeometry(format!(
                        "expected exactly one feature, found {}",
                        other.len()
                    ))),
                }
            }
            other => Err(DemError::InvalidGeometry(format!(
                "unsupported GeoJSON type '{}'",
                other
            ))),
        }
    }

    /// Parse GeoJSON text.
    pub fn from_geojson_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_geojson(&value)
    }

    /// GeoJSON `Polygon` geometry for this polygon, rings closed.
    pub fn to_geojson(&self) -> Value {
        let ring = |r: &Vec<(f64, f64)>| -> Value {
            let mut coords: Vec<Value> = r.iter().map(|&(x, y)| serde_json::json!([x, y])).collect();
            if let Some(first) = coords.first().cloned() {
                coords.push(first);
            }
            Value::Array(coords)
        };
        let mut rings = vec![ring(&self.exterior)];
        rings.extend(self.holes.iter().map(ring));
        serde_json::json!({ "type": "Polygon", "coordinates": rings })
    }

    pub fn exterior(&self) -> &[(f64, f64)] {
        &self.exterior
    }

    pub fn holes(&self) -> &[Vec<(f64, f64)>] {
        &self.holes
    }

    /// Bounding box of the exterior ring.
    pub fn bbox(&self) -> BoundingBox {
        let (x0, y0) = self.exterior[0];
        let mut bbox = BoundingBox::new(x0, y0, x0, y0);
        for &(x, y) in &self.exterior[1..] {
            bbox.expand_to_include(x, y);
        }
        bbox
    }

    /// Even-odd point-in-polygon test; points inside a hole are outside.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        ring_contains(&self.exterior, x, y)
            && !self.holes.iter().any(|hole| ring_contains(hole, x, y))
    }

    /// Apply a fallible coordinate transform to every vertex.
    pub fn try_map<F>(&self, mut f: F) -> Result<Polygon>
    where
        F: FnMut(f64, f64) -> Result<(f64, f64)>,
    {
        let mut map_ring = |ring: &Vec<(f64, f64)>| -> Result<Vec<(f64, f64)>> {
            ring.iter().map(|&(x, y)| f(x, y)).collect()
        };
        let exterior = map_ring(&self.exterior)?;
        let holes = self
            .holes
            .iter()
            .map(&mut map_ring)
            .collect::<Result<Vec<_>>>()?;
        Polygon::new(exterior, holes)
    }
}

fn parse_ring(value: &Value) -> Result<Vec<(f64, f64)>> {
    let points = value
        .as_array()
        .ok_or_else(|| DemError::InvalidGeometry("ring is not an array".into()))?;
    points
        .iter()
        .map(|p| {
            let xy = p.as_array().filter(|a| a.len() >= 2).ok_or_else(|| {
                DemError::InvalidGeometry("position needs at least two numbers".into())
            })?;
            match (xy[0].as_f64(), xy[1].as_f64()) {
                (Some(x), Some(y)) => Ok((x, y)),
                _ => Err(DemError::InvalidGeometry("position is not numeric".into())),
            }
        })
        .collect()
}

fn normalize_ring(mut ring: Vec<(f64, f64)>) -> Result<Vec<(f64, f64)>> {
    if ring.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(DemError::InvalidGeometry("ring has non-finite coordinates".into()));
    }
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    ring.dedup();
    if ring.len() < 3 {
        return Err(DemError::InvalidGeometry(format!(
            "ring needs at least 3 distinct vertices, got {}",
            ring.len()
        )));
    }
    if ring_encloses_nothing(&ring) {
        return Err(DemError::InvalidGeometry(
            "ring has zero area (collinear vertices)".into(),
        ));
    }
    Ok(ring)
}

/// Shoelace area, taken relative to the first vertex, is zero up to rounding.
fn ring_encloses_nothing(ring: &[(f64, f64)]) -> bool {
    let (x0, y0) = ring[0];
    let mut twice_area = 0.0;
    let mut extent: f64 = 0.0;
    for pair in ring.windows(2) {
        let (ax, ay) = (pair[0].0 - x0, pair[0].1 - y0);
        let (bx, by) = (pair[1].0 - x0, pair[1].1 - y0);
        twice_area += ax * by - bx * ay;
        extent = extent.max(bx.abs()).max(by.abs());
    }
    twice_area.abs() <= 4.0 * f64::EPSILON * extent * extent
}

fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::from_bbox(&BoundingBox::new(0.0, 0.0, 10.0, 10.0))
    }

    #[test]
    fn test_bbox_intersection_and_union() {
        let a = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
        let b = BoundingBox::new(1.0, 1.0, 3.0, 3.0);
        assert_eq!(a.intersection(&b), Some(BoundingBox::new(1.0, 1.0, 2.0, 2.0)));
        assert_eq!(a.union(&b), BoundingBox::new(0.0, 0.0, 3.0, 3.0));

        // Touching edges do not count as overlap
        let c = BoundingBox::new(2.0, 0.0, 4.0, 2.0);
        assert!(!a.intersects(&c));
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_bbox_new_orders_edges() {
        let b = BoundingBox::new(5.0, 7.0, 1.0, 2.0);
        assert_eq!(b.min_x, 1.0);
        assert_eq!(b.max_y, 7.0);
    }

    #[test]
    fn test_polygon_contains_with_hole() {
        let poly = Polygon::new(
            vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
            vec![vec![(4.0, 4.0), (6.0, 4.0), (6.0, 6.0), (4.0, 6.0)]],
        )
        .unwrap();

        assert!(poly.contains(1.0, 1.0));
        assert!(!poly.contains(5.0, 5.0)); // In the hole
        assert!(!poly.contains(11.0, 5.0));
        assert!(square().contains(9.99, 9.99));
    }

    #[test]
    fn test_polygon_triangle_contains() {
        let tri = Polygon::new(vec![(0.0, 0.0), (4.0, 0.0), (0.0, 4.0)], vec![]).unwrap();
        assert!(tri.contains(1.0, 1.0));
        assert!(!tri.contains(3.0, 3.0));
    }

    #[test]
    fn test_polygon_rejects_degenerate_ring() {
        let err = Polygon::new(vec![(0.0, 0.0), (1.0, 1.0), (0.0, 0.0)], vec![]).unwrap_err();
        assert!(matches!(err, DemError::InvalidGeometry(_)));
    }

    #[test]
    fn test_polygon_rejects_zero_area_ring() {
        // All vertices on one parallel
        let flat = Polygon::new(
            vec![(-118.19, 34.05), (-118.15, 34.05), (-118.05, 34.05)],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(flat, DemError::InvalidGeometry(_)));

        let diagonal = Polygon::new(vec![(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (0.0, 0.0)], vec![]);
        assert!(matches!(diagonal, Err(DemError::InvalidGeometry(_))));

        // A thin but real sliver is still a polygon
        assert!(Polygon::new(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1e-6)], vec![]).is_ok());
    }

    #[test]
    fn test_from_geojson_feature_collection() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[-118.9, 34.1], [-118.1, 34.1], [-118.1, 34.9], [-118.9, 34.9], [-118.9, 34.1]]]
                }
            }]
        }"#;
        let poly = Polygon::from_geojson_str(text).unwrap();
        assert_eq!(poly.exterior().len(), 4);
        let bbox = poly.bbox();
        assert_eq!(bbox, BoundingBox::new(-118.9, 34.1, -118.1, 34.9));
    }

    #[test]
    fn test_from_geojson_rejects_multipolygon() {
        let text = r#"{"type": "MultiPolygon", "coordinates": []}"#;
        assert!(Polygon::from_geojson_str(text).is_err());
    }

    #[test]
    fn test_geojson_output_closes_rings() {
        let json = square().to_geojson();
        let ring = json["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.first(), ring.last());
        let back = Polygon::from_geojson(&json).unwrap();
        assert_eq!(back, square());
    }
}
