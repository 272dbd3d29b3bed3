//! Tile discovery: turning a canonical bounding box into the concrete tile
//! requests a source needs to cover it.

use crate::crs::{CoordinateNormalizer, Crs};
use crate::geo::BoundingBox;
use crate::index::IndexedTile;
use crate::remote::RetryPolicy;
use crate::source::{ApiAccess, GridAccess, IndexedAccess, Source, SourceAccess, SourceId};
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, warn};

/// Identifier of a tile, unique within its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileId(String);

impl TileId {
    pub fn new(id: impl Into<String>) -> Self {
        TileId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to fetch one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRequest {
    pub source: SourceId,
    pub tile_id: TileId,
    /// Tile footprint in `source_native_crs`.
    pub bounding_box: BoundingBox,
    pub source_native_crs: Crs,
    /// Remote location of the payload (URL or object key).
    pub source_ref: String,
    /// Fallback locations of the same payload, tried in order after `source_ref`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

impl TileRequest {
    /// `source_ref` followed by the mirrors.
    pub fn locations(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source_ref.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }

    /// The same request pointed at another location.
    pub fn at(&self, location: &str) -> TileRequest {
        TileRequest {
            source_ref: location.to_string(),
            mirrors: Vec::new(),
            ..self.clone()
        }
    }
}

/// A 1x1 degree cell keyed by its south-west corner.
///
/// Coordinate (34.5, -118.5) is in cell `N34W119`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCell {
    pub lat: i32,
    pub lon: i32,
}

impl GridCell {
    /// Create a cell for a given coordinate.
    pub fn from_coord(lat: f64, lon: f64) -> Self {
        GridCell {
            lat: lat.floor() as i32,
            lon: lon.floor() as i32,
        }
    }

    /// Parse a cell name such as `N34W119` anywhere in `name`, any case.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        let bytes = upper.as_bytes();
        (0..bytes.len()).find_map(|start| parse_cell_at(&bytes[start..]))
    }

    /// Canonical cell name, e.g. `N34W119` or `S01E006`.
    pub fn name(&self) -> String {
        format!(
            "{}{:02}{}{:03}",
            self.ns(),
            self.lat.unsigned_abs(),
            self.ew(),
            self.lon.unsigned_abs()
        )
    }

    fn ns(&self) -> char {
        if self.lat >= 0 {
            'N'
        } else {
            'S'
        }
    }

    fn ew(&self) -> char {
        if self.lon >= 0 {
            'E'
        } else {
            'W'
        }
    }

    /// Cell footprint in degrees.
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(
            self.lon as f64,
            self.lat as f64,
            self.lon as f64 + 1.0,
            self.lat as f64 + 1.0,
        )
    }

    /// Cells covering `bbox`, south to north then west to east.
    ///
    /// A box edge lying exactly on a degree line does not pull in the
    /// neighbouring cell.
    pub fn covering(bbox: &BoundingBox) -> Vec<GridCell> {
        let lat_start = (bbox.min_y.floor() as i32).clamp(-90, 89);
        let lat_end = ((bbox.max_y.ceil() as i32) - 1).clamp(lat_start, 89);
        let lon_start = (bbox.min_x.floor() as i32).clamp(-180, 179);
        let lon_end = ((bbox.max_x.ceil() as i32) - 1).clamp(lon_start, 179);

        (lat_start..=lat_end)
            .flat_map(|lat| (lon_start..=lon_end).map(move |lon| GridCell { lat, lon }))
            .collect()
    }

    /// Expand a URL template for this cell.
    pub fn expand_template(&self, template: &str) -> String {
        template
            .replace("{cell}", &self.name())
            .replace("{ns}", &self.ns().to_string())
            .replace("{ew}", &self.ew().to_string())
            .replace("{lat}", &format!("{:02}", self.lat.unsigned_abs()))
            .replace("{lon}", &format!("{:03}", self.lon.unsigned_abs()))
    }
}

impl fmt::Display for GridCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// `[NS]\d{1,2}[EW]\d{1,3}` at the start of `bytes`.
fn parse_cell_at(bytes: &[u8]) -> Option<GridCell> {
    let lat_sign = match bytes.first()? {
        b'N' => 1,
        b'S' => -1,
        _ => return None,
    };
    let (lat, rest) = take_digits(&bytes[1..], 2)?;
    let lon_sign = match rest.first()? {
        b'E' => 1,
        b'W' => -1,
        _ => return None,
    };
    let (lon, _) = take_digits(&rest[1..], 3)?;
    if lat > 90 || lon > 180 {
        return None;
    }
    Some(GridCell {
        lat: lat_sign * lat,
        lon: lon_sign * lon,
    })
}

fn take_digits(bytes: &[u8], max: usize) -> Option<(i32, &[u8])> {
    let len = bytes
        .iter()
        .take(max)
        .take_while(|b| b.is_ascii_digit())
        .count();
    if len == 0 {
        return None;
    }
    let value = bytes[..len]
        .iter()
        .fold(0i32, |acc, b| acc * 10 + i32::from(*b - b'0'));
    Some((value, &bytes[len..]))
}

/// Resolves tile requests for a source.
#[derive(Debug, Clone)]
pub struct TileLocator {
    normalizer: CoordinateNormalizer,
    retry: RetryPolicy,
}

impl TileLocator {
    pub fn new(normalizer: CoordinateNormalizer, retry: RetryPolicy) -> Self {
        Self { normalizer, retry }
    }

    /// Tiles of `source` intersecting the canonical `bbox`, in a stable order.
    ///
    /// Fails with `NoCoverage` when nothing intersects and with
    /// `SourceUnavailable` when the source's index cannot be queried.
    pub fn locate(&self, source: &Source, bbox: &BoundingBox) -> Result<Vec<TileRequest>> {
        if !source.covers(bbox) {
            return Err(DemError::NoCoverage {
                source_id: source.id().to_string(),
                reason: format!("{} is outside the configured coverage", bbox),
            });
        }

        let requests = match source.access() {
            SourceAccess::Grid(grid) => self.locate_grid(source, grid, bbox)?,
            SourceAccess::Indexed(indexed) => self.locate_indexed(source, indexed, bbox)?,
            SourceAccess::Api(api) => vec![self.locate_api(source, api, bbox)?],
        };

        if requests.is_empty() {
            return Err(DemError::NoCoverage {
                source_id: source.id().to_string(),
                reason: format!("no tiles intersect {}", bbox),
            });
        }
        debug!(
            "Located {} tile(s) in '{}' for {}",
            requests.len(),
            source.id(),
            bbox
        );
        Ok(requests)
    }

    fn locate_grid(&self, source: &Source, grid: &GridAccess, bbox: &BoundingBox) -> Result<Vec<TileRequest>> {
        let (primary, mirrors) = grid
            .url_templates
            .split_first()
            .ok_or_else(|| DemError::SourceUnavailable {
                source_id: source.id().to_string(),
                reason: "no URL template configured".into(),
            })?;

        Ok(GridCell::covering(bbox)
            .into_iter()
            .filter(|cell| source.covers(&cell.bounds()))
            .map(|cell| TileRequest {
                source: source.id().clone(),
                tile_id: TileId::new(cell.name()),
                bounding_box: cell.bounds(),
                source_native_crs: Crs::WGS84,
                source_ref: cell.expand_template(primary),
                mirrors: mirrors.iter().map(|t| cell.expand_template(t)).collect(),
            })
            .collect())
    }

    fn locate_indexed(
        &self,
        source: &Source,
        indexed: &IndexedAccess,
        bbox: &BoundingBox,
    ) -> Result<Vec<TileRequest>> {
        let index_crs = indexed.index.crs();
        let native = self.normalizer.bbox_to_native(bbox, index_crs)?;

        let (mut tiles, _) = self
            .retry
            .run(
                |_| indexed.index.query(&native),
                |attempt, e| warn!("Index query for '{}' failed (attempt {}): {}", source.id(), attempt, e),
            )
            .map_err(|exhausted| DemError::SourceUnavailable {
                source_id: source.id().to_string(),
                reason: format!(
                    "index query failed after {} attempt(s): {}",
                    exhausted.attempts, exhausted.last
                ),
            })?;

        tiles.retain(|t| t.bounds.intersects(&native));
        tiles.sort_by(|a, b| a.id.cmp(&b.id));
        tiles.dedup_by(|a, b| a.id == b.id);

        Ok(tiles
            .into_iter()
            .map(|IndexedTile { id, url, bounds }| TileRequest {
                source: source.id().clone(),
                tile_id: TileId::new(id),
                bounding_box: bounds,
                source_native_crs: index_crs,
                source_ref: url,
                mirrors: Vec::new(),
            })
            .collect())
    }

    fn locate_api(&self, source: &Source, api: &ApiAccess, bbox: &BoundingBox) -> Result<TileRequest> {
        let area = self.normalizer.bbox_to_native(bbox, api.output_crs)?;

        let resolution = source.policy().resolution_m.max(f64::EPSILON);
        let units_per_pixel = if api.output_crs.is_geographic() {
            resolution / 111_320.0
        } else {
            resolution
        };
        let mut width = (area.width() / units_per_pixel).ceil().max(1.0);
        let mut height = (area.height() / units_per_pixel).ceil().max(1.0);
        let longest = width.max(height);
        let max_pixels = api.max_pixels.max(1) as f64;
        if longest > max_pixels {
            let scale = max_pixels / longest;
            width = (width * scale).round().max(1.0);
            height = (height * scale).round().max(1.0);
        }

        let epsg = api.output_crs.epsg();
        let url = format!(
            "{}/exportImage?bbox={},{},{},{}&bboxSR={}&imageSR={}&size={},{}&format=tiff&pixelType=F32&noDataInterpretation=esriNoDataMatchAny&interpolation=RSP_BilinearInterpolation&f=image",
            api.endpoint.trim_end_matches('/'),
            area.min_x,
            area.min_y,
            area.max_x,
            area.max_y,
            epsg,
            epsg,
            width as u32,
            height as u32
        );

        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        Ok(TileRequest {
            source: source.id().clone(),
            tile_id: TileId::new(format!("api-{}", &digest[..16])),
            bounding_box: area,
            source_native_crs: api.output_crs,
            source_ref: url,
            mirrors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FootprintIndex, TileIndex};
    use crate::remote::{RemoteError, RemoteMeta, RemoteStore};
    use crate::source::SourcePolicy;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Locating never transfers payloads.
    struct Unused;

    impl RemoteStore for Unused {
        fn fetch_into(
            &self,
            request: &TileRequest,
            _out: &mut dyn Write,
        ) -> std::result::Result<RemoteMeta, RemoteError> {
            Err(RemoteError::NotFound(request.source_ref.clone()))
        }

        fn probe(&self, request: &TileRequest) -> std::result::Result<RemoteMeta, RemoteError> {
            Err(RemoteError::NotFound(request.source_ref.clone()))
        }
    }

    /// An index whose service refuses every connection.
    #[derive(Default)]
    struct DownIndex {
        queries: AtomicUsize,
    }

    impl TileIndex for DownIndex {
        fn crs(&self) -> Crs {
            Crs::from_epsg(3763)
        }

        fn query(&self, _bbox: &BoundingBox) -> std::result::Result<Vec<IndexedTile>, RemoteError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Connect("connection refused".into()))
        }
    }

    /// Footprints in PT-TM06 around the projection origin (39.67N, 8.13W).
    const FOOTPRINTS: &str = r#"{
        "crs": 3763,
        "tiles": [
            {"id": "b", "url": "https://example.test/b.tif", "bounds": {"min_x": 1000.0, "min_y": 0.0, "max_x": 2000.0, "max_y": 1000.0}},
            {"id": "a", "url": "https://example.test/a.tif", "bounds": {"min_x": 0.0, "min_y": 0.0, "max_x": 1000.0, "max_y": 1000.0}},
            {"id": "c", "url": "https://example.test/c.tif", "bounds": {"min_x": 50000.0, "min_y": 50000.0, "max_x": 51000.0, "max_y": 51000.0}}
        ]
    }"#;

    fn locator() -> TileLocator {
        TileLocator::new(
            CoordinateNormalizer::default(),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        )
    }

    fn source(access: SourceAccess, coverage: Vec<BoundingBox>) -> Source {
        Source::new(
            SourceId::new("test"),
            access,
            SourcePolicy {
                coverage,
                ..SourcePolicy::default()
            },
            Arc::new(Unused),
        )
    }

    fn portugal() -> Vec<BoundingBox> {
        vec![BoundingBox::new(-9.6, 36.9, -6.1, 42.2)]
    }

    fn api_source(max_pixels: u32) -> Source {
        source(
            SourceAccess::Api(ApiAccess {
                endpoint: "https://example.test/ImageServer/".into(),
                output_crs: Crs::WGS84,
                max_pixels,
            }),
            Vec::new(),
        )
    }

    #[test]
    fn test_cell_from_coord() {
        assert_eq!(GridCell::from_coord(34.5, -118.5).name(), "N34W119");
        assert_eq!(GridCell::from_coord(-0.5, 6.2).name(), "S01E006");
        assert_eq!(GridCell::from_coord(47.0, -122.0).name(), "N47W122");
    }

    #[test]
    fn test_cell_from_name_any_case() {
        assert_eq!(
            GridCell::from_name("N34W119"),
            Some(GridCell { lat: 34, lon: -119 })
        );
        assert_eq!(
            GridCell::from_name("srtm_s01e006.hgt"),
            Some(GridCell { lat: -1, lon: 6 })
        );
        assert_eq!(GridCell::from_name("lisbon-tile"), None);
    }

    #[test]
    fn test_covering_excludes_edge_neighbours() {
        let cells = GridCell::covering(&BoundingBox::new(-118.9, 34.1, -118.1, 34.9));
        assert_eq!(cells, vec![GridCell { lat: 34, lon: -119 }]);

        // Exact degree edges stay inside one cell
        let cells = GridCell::covering(&BoundingBox::new(-119.0, 34.0, -118.0, 35.0));
        assert_eq!(cells.len(), 1);

        let cells = GridCell::covering(&BoundingBox::new(-119.5, 34.5, -117.5, 35.5));
        let names: Vec<String> = cells.iter().map(GridCell::name).collect();
        assert_eq!(
            names,
            vec!["N34W120", "N34W119", "N34W118", "N35W120", "N35W119", "N35W118"]
        );
    }

    #[test]
    fn test_expand_skadi_template() {
        let cell = GridCell::from_coord(34.5, -118.5);
        assert_eq!(
            cell.expand_template(crate::source::SKADI_URL_TEMPLATE),
            "https://s3.amazonaws.com/elevation-tiles-prod/skadi/N34/N34W119.hgt.gz"
        );
    }

    #[test]
    fn test_grid_requests_carry_mirrors() {
        let grid = GridAccess::new("https://primary.test/{cell}.hgt")
            .with_mirror("https://mirror.test/{ns}{lat}/{cell}.hgt");
        let requests = locator()
            .locate(
                &source(SourceAccess::Grid(grid), Vec::new()),
                &BoundingBox::new(-118.25, 34.05, -118.2, 34.1),
            )
            .unwrap();

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].source_ref, "https://primary.test/N34W119.hgt");
        assert_eq!(requests[0].mirrors, vec!["https://mirror.test/N34/N34W119.hgt"]);
        let locations: Vec<&str> = requests[0].locations().collect();
        assert_eq!(locations.len(), 2);
    }

    #[test]
    fn test_grid_without_templates_is_unavailable() {
        let grid = GridAccess {
            url_templates: Vec::new(),
        };
        let err = locator()
            .locate(
                &source(SourceAccess::Grid(grid), Vec::new()),
                &BoundingBox::new(-118.25, 34.05, -118.2, 34.1),
            )
            .unwrap_err();
        assert!(matches!(err, DemError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_indexed_tiles_are_located_in_native_crs() {
        let index = Arc::new(FootprintIndex::from_json_str(FOOTPRINTS).unwrap());
        let source = source(SourceAccess::Indexed(IndexedAccess { index }), portugal());

        // About 600 m west to 1100 m east of the origin
        let requests = locator()
            .locate(&source, &BoundingBox::new(-8.14, 39.66, -8.12, 39.68))
            .unwrap();

        let ids: Vec<&str> = requests.iter().map(|r| r.tile_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(requests
            .iter()
            .all(|r| r.source_native_crs == Crs::from_epsg(3763)));
        assert_eq!(requests[0].source_ref, "https://example.test/a.tif");
        assert_eq!(
            requests[0].bounding_box,
            BoundingBox::new(0.0, 0.0, 1000.0, 1000.0)
        );
        assert!(requests[0].mirrors.is_empty());
    }

    #[test]
    fn test_indexed_area_outside_extent_has_no_coverage() {
        let index = Arc::new(FootprintIndex::from_json_str(FOOTPRINTS).unwrap());
        let source = source(SourceAccess::Indexed(IndexedAccess { index }), portugal());

        // Madrid is outside the national extent
        let outside = locator()
            .locate(&source, &BoundingBox::new(-3.8, 40.3, -3.6, 40.5))
            .unwrap_err();
        assert!(matches!(outside, DemError::NoCoverage { .. }));

        // Inside the extent but between footprints
        let gap = locator()
            .locate(&source, &BoundingBox::new(-7.0, 38.0, -6.9, 38.1))
            .unwrap_err();
        assert!(matches!(gap, DemError::NoCoverage { .. }));
    }

    #[test]
    fn test_index_failure_is_source_unavailable_after_retries() {
        let index = Arc::new(DownIndex::default());
        let source = source(
            SourceAccess::Indexed(IndexedAccess {
                index: Arc::clone(&index) as Arc<dyn TileIndex>,
            }),
            portugal(),
        );

        let err = locator()
            .locate(&source, &BoundingBox::new(-8.14, 39.66, -8.12, 39.68))
            .unwrap_err();

        match err {
            DemError::SourceUnavailable { source_id, reason } => {
                assert_eq!(source_id, "test");
                assert!(reason.contains("3 attempt"), "{}", reason);
            }
            other => panic!("expected SourceUnavailable, got {:?}", other),
        }
        assert_eq!(index.queries.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_api_request_is_one_export() {
        let area = BoundingBox::new(-118.25, 34.05, -118.2, 34.1);
        let requests = locator().locate(&api_source(4000), &area).unwrap();

        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(request
            .source_ref
            .starts_with("https://example.test/ImageServer/exportImage?bbox="));
        assert!(request.source_ref.contains("bboxSR=4326&imageSR=4326"));
        assert!(request.source_ref.contains("size=186,186"));
        assert!(request.source_ref.contains("format=tiff"));
        assert_eq!(request.source_native_crs, Crs::WGS84);
        assert!(request.tile_id.as_str().starts_with("api-"));
        assert_eq!(request.tile_id.as_str().len(), "api-".len() + 16);
    }

    #[test]
    fn test_api_size_is_capped() {
        let area = BoundingBox::new(-119.0, 34.0, -118.0, 34.5);
        let requests = locator().locate(&api_source(100), &area).unwrap();
        assert!(requests[0].source_ref.contains("size=100,50"));
    }

    #[test]
    fn test_api_tile_id_is_stable_per_area() {
        let locator = locator();
        let source = api_source(4000);
        let area = BoundingBox::new(-118.25, 34.05, -118.2, 34.1);

        let first = locator.locate(&source, &area).unwrap();
        let again = locator.locate(&source, &area).unwrap();
        assert_eq!(first[0].tile_id, again[0].tile_id);
        assert_eq!(first[0].source_ref, again[0].source_ref);

        let other = locator
            .locate(&source, &BoundingBox::new(-118.3, 34.05, -118.2, 34.1))
            .unwrap();
        assert_ne!(first[0].tile_id, other[0].tile_id);
    }
}
