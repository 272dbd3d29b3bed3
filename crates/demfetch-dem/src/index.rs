//! Spatial indexes for sources whose tiles are not on a fixed grid.
//!
//! An index answers "which tiles intersect this native-CRS box". Footprints
//! can come from a local JSON file or from an HTTP query endpoint.

use crate::crs::Crs;
use crate::geo::BoundingBox;
use crate::remote::RemoteError;
use crate::Result;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One tile footprint in an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedTile {
    /// Stable tile name within its source.
    pub id: String,
    /// Where the payload can be fetched.
    pub url: String,
    /// Footprint in the index CRS.
    pub bounds: BoundingBox,
}

/// Spatial lookup of tile footprints.
pub trait TileIndex: Send + Sync {
    /// CRS of footprints and query boxes.
    fn crs(&self) -> Crs;

    /// Tiles whose footprint intersects `bbox`, sorted by id.
    fn query(&self, bbox: &BoundingBox) -> std::result::Result<Vec<IndexedTile>, RemoteError>;
}

/// On-disk footprint file layout.
#[derive(Debug, Serialize, Deserialize)]
struct FootprintFile {
    crs: Crs,
    tiles: Vec<IndexedTile>,
}

/// In-memory footprint list.
#[derive(Debug, Clone)]
pub struct FootprintIndex {
    crs: Crs,
    tiles: Vec<IndexedTile>,
}

impl FootprintIndex {
    pub fn new(crs: Crs, mut tiles: Vec<IndexedTile>) -> Self {
        tiles.sort_by(|a, b| a.id.cmp(&b.id));
        Self { crs, tiles }
    }

    /// Load `{"crs": 3763, "tiles": [{"id", "url", "bounds"}, ...]}`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: FootprintFile = serde_json::from_str(text)?;
        Ok(Self::new(file.crs, file.tiles))
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Union of all footprints.
    pub fn extent(&self) -> Option<BoundingBox> {
        self.tiles
            .iter()
            .map(|t| t.bounds)
            .reduce(|acc, b| acc.union(&b))
    }
}

impl TileIndex for FootprintIndex {
    fn crs(&self) -> Crs {
        self.crs
    }

    fn query(&self, bbox: &BoundingBox) -> std::result::Result<Vec<IndexedTile>, RemoteError> {
        Ok(self
            .tiles
            .iter()
            .filter(|t| t.bounds.intersects(bbox))
            .cloned()
            .collect())
    }
}

/// Footprint file read on first query.
///
/// A missing or unreadable file is reported per query, so a misconfigured
/// source fails its jobs instead of the whole configuration.
pub struct FootprintFileIndex {
    path: PathBuf,
    crs: Crs,
    loaded: Mutex<Option<Arc<FootprintIndex>>>,
}

impl FootprintFileIndex {
    pub fn new(path: impl Into<PathBuf>, crs: Crs) -> Self {
        Self {
            path: path.into(),
            crs,
            loaded: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn index(&self) -> std::result::Result<Arc<FootprintIndex>, RemoteError> {
        let mut loaded = self.loaded.lock();
        if let Some(index) = loaded.as_ref() {
            return Ok(Arc::clone(index));
        }
        let index = FootprintIndex::from_file(&self.path).map_err(|e| {
            RemoteError::InvalidResponse(format!("{}: {}", self.path.display(), e))
        })?;
        if index.crs != self.crs {
            return Err(RemoteError::InvalidResponse(format!(
                "{} declares {}, expected {}",
                self.path.display(),
                index.crs,
                self.crs
            )));
        }
        debug!("Loaded {} footprints from {}", index.len(), self.path.display());
        let index = Arc::new(index);
        *loaded = Some(Arc::clone(&index));
        Ok(index)
    }
}

impl TileIndex for FootprintFileIndex {
    fn crs(&self) -> Crs {
        self.crs
    }

    fn query(&self, bbox: &BoundingBox) -> std::result::Result<Vec<IndexedTile>, RemoteError> {
        self.index()?.query(bbox)
    }
}

/// Index served over HTTP.
///
/// `GET {endpoint}?bbox=minx,miny,maxx,maxy&crs={epsg}` must return a JSON
/// array of [`IndexedTile`].
pub struct HttpTileIndex {
    endpoint: String,
    crs: Crs,
    client: Client,
}

impl HttpTileIndex {
    pub fn new(endpoint: impl Into<String>, crs: Crs, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            crs,
            client,
        })
    }
}

impl TileIndex for HttpTileIndex {
    fn crs(&self) -> Crs {
        self.crs
    }

    fn query(&self, bbox: &BoundingBox) -> std::result::Result<Vec<IndexedTile>, RemoteError> {
        let bbox_param = format!("{},{},{},{}", bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y);
        debug!("Index query {} bbox={}", self.endpoint, bbox_param);
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("bbox", bbox_param), ("crs", self.crs.epsg().to_string())])
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }
        let body = response.text()?;
        let mut tiles: Vec<IndexedTile> = serde_json::from_str(&body)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        tiles.retain(|t| t.bounds.intersects(bbox));
        tiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOOTPRINTS: &str = r#"{
        "crs": 3763,
        "tiles": [
            {"id": "b", "url": "https://example.test/b.tif", "bounds": {"min_x": 1000.0, "min_y": 0.0, "max_x": 2000.0, "max_y": 1000.0}},
            {"id": "a", "url": "https://example.test/a.tif", "bounds": {"min_x": 0.0, "min_y": 0.0, "max_x": 1000.0, "max_y": 1000.0}},
            {"id": "c", "url": "https://example.test/c.tif", "bounds": {"min_x": 5000.0, "min_y": 5000.0, "max_x": 6000.0, "max_y": 6000.0}}
        ]
    }"#;

    #[test]
    fn test_footprint_query_sorted_and_filtered() {
        let index = FootprintIndex::from_json_str(FOOTPRINTS).unwrap();
        assert_eq!(index.crs(), Crs::from_epsg(3763));
        assert_eq!(index.len(), 3);

        let hits = index
            .query(&BoundingBox::new(500.0, 100.0, 1500.0, 900.0))
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(index
            .query(&BoundingBox::new(-10.0, -10.0, -5.0, -5.0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_footprint_file_loads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.json");
        let index = FootprintFileIndex::new(&path, Crs::from_epsg(3763));

        let err = index
            .query(&BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .unwrap_err();
        assert!(!err.is_retryable());

        std::fs::write(&path, FOOTPRINTS).unwrap();
        let hits = index
            .query(&BoundingBox::new(5500.0, 5500.0, 5600.0, 5600.0))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c");
    }

    #[test]
    fn test_footprint_file_crs_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.json");
        std::fs::write(&path, FOOTPRINTS).unwrap();
        let index = FootprintFileIndex::new(&path, Crs::WGS84);
        assert!(index.query(&BoundingBox::new(0.0, 0.0, 1.0, 1.0)).is_err());
    }

    #[test]
    fn test_footprint_extent() {
        let index = FootprintIndex::from_json_str(FOOTPRINTS).unwrap();
        assert_eq!(
            index.extent(),
            Some(BoundingBox::new(0.0, 0.0, 6000.0, 6000.0))
        );
    }
}
