//! Elevation sources: how tiles are addressed and the policies that govern
//! caching and resampling them.

use crate::crs::Crs;
use crate::geo::BoundingBox;
use crate::index::TileIndex;
use crate::raster::ResamplingMethod;
use crate::remote::RemoteStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default SRTM 1-arc-second mirror (Mapzen/AWS "skadi" layout).
pub const SKADI_URL_TEMPLATE: &str =
    "https://s3.amazonaws.com/elevation-tiles-prod/skadi/{ns}{lat}/{cell}.hgt.gz";

/// Name of a configured source, e.g. `srtm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(name: impl Into<String>) -> Self {
        SourceId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        SourceId(s.to_string())
    }
}

/// Transfer encoding of downloaded payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Raw,
    /// Gzip-compressed on the wire; stored decompressed.
    Gzip,
}

/// Caching, verification and resampling policy of a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePolicy {
    /// CRS the source's tiles are delivered in.
    pub native_crs: Crs,
    /// Nominal ground resolution in meters.
    pub resolution_m: f64,
    /// Age after which a cached tile is re-validated; `None` never expires.
    pub ttl_secs: Option<u64>,
    /// Downloads larger than this are rejected.
    pub max_file_size: u64,
    pub resampling: ResamplingMethod,
    /// Canonical-CRS regions the source covers; empty means global.
    pub coverage: Vec<BoundingBox>,
    pub payload: PayloadEncoding,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            native_crs: Crs::WGS84,
            resolution_m: 30.0,
            ttl_secs: None,
            max_file_size: 100 * 1024 * 1024,
            resampling: ResamplingMethod::Bilinear,
            coverage: Vec::new(),
            payload: PayloadEncoding::Raw,
        }
    }
}

impl SourcePolicy {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Fixed 1x1 degree cells addressed by URL template.
///
/// Placeholders: `{cell}` (`N34W119`), `{ns}`/`{ew}` (hemisphere letters),
/// `{lat}` (two digits) and `{lon}` (three digits). Templates are mirrors
/// of the same data, tried in order until one serves the tile.
#[derive(Debug, Clone)]
pub struct GridAccess {
    pub url_templates: Vec<String>,
}

impl GridAccess {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_templates: vec![url_template.into()],
        }
    }

    /// Append a fallback mirror.
    pub fn with_mirror(mut self, url_template: impl Into<String>) -> Self {
        self.url_templates.push(url_template.into());
        self
    }
}

/// Arbitrary tiles discovered through a spatial index.
#[derive(Clone)]
pub struct IndexedAccess {
    pub index: Arc<dyn TileIndex>,
}

impl fmt::Debug for IndexedAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedAccess")
            .field("index_crs", &self.index.crs())
            .finish()
    }
}

/// A raster service that renders any requested bounding box.
#[derive(Debug, Clone)]
pub struct ApiAccess {
    /// Service base URL; the locator appends the export query.
    pub endpoint: String,
    /// CRS requested from the service.
    pub output_crs: Crs,
    /// Largest edge, in pixels, of a single request.
    pub max_pixels: u32,
}

/// How tiles of a source are discovered.
#[derive(Debug, Clone)]
pub enum SourceAccess {
    Grid(GridAccess),
    Indexed(IndexedAccess),
    Api(ApiAccess),
}

impl SourceAccess {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SourceAccess::Grid(_) => "grid",
            SourceAccess::Indexed(_) => "indexed",
            SourceAccess::Api(_) => "api",
        }
    }
}

/// A configured elevation source.
#[derive(Clone)]
pub struct Source {
    id: SourceId,
    description: String,
    access: SourceAccess,
    policy: SourcePolicy,
    remote: Arc<dyn RemoteStore>,
}

impl Source {
    pub fn new(
        id: SourceId,
        access: SourceAccess,
        policy: SourcePolicy,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            id,
            description: String::new(),
            access,
            policy,
            remote,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn access(&self) -> &SourceAccess {
        &self.access
    }

    pub fn policy(&self) -> &SourcePolicy {
        &self.policy
    }

    pub fn remote(&self) -> &dyn RemoteStore {
        self.remote.as_ref()
    }

    /// Cheap pre-check against the configured coverage regions.
    pub fn covers(&self, bbox: &BoundingBox) -> bool {
        self.policy.coverage.is_empty()
            || self.policy.coverage.iter().any(|region| region.intersects(bbox))
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("access", &self.access)
            .field("policy", &self.policy)
            .finish()
    }
}
