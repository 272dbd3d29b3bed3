//! # demfetch-dem
//!
//! Elevation tile acquisition, caching and mosaicking.
//!
//! Given a polygon in WGS84 and a named elevation source, this crate finds the
//! tiles covering the polygon, downloads them into a persistent local cache,
//! brings them into one coordinate system and produces a single clipped
//! GeoTIFF.
//!
//! ## Overview
//!
//! ### Sources
//!
//! Three access patterns are supported:
//! - **Grid**: fixed 1°×1° cells named by their south-west corner
//!   (`N34W119`), e.g. SRTM from the AWS "skadi" bucket.
//! - **Indexed**: irregular tiles in a projected CRS, resolved through a
//!   spatial index of footprints (local JSON file or HTTP endpoint).
//! - **API**: a single parametrized export request (ArcGIS ImageServer
//!   `exportImage`) synthesized from the bounding box.
//!
//! ### Cache
//!
//! [`TileCache`] stores each tile once under `{root}/{source}/`, with a JSON
//! sidecar describing it. Concurrent requests for the same tile share one
//! download. Entries past their source TTL are re-validated with a HEAD probe
//! and reused when the remote is unreachable.
//!
//! ### Output
//!
//! [`MosaicEngine`] reprojects tiles into EPSG:4326, resamples them onto the
//! finest grid present, clips to the polygon and writes a Float32 GeoTIFF with
//! NoData `-9999`.
//!
//! ## Example
//!
//! ```no_run
//! use demfetch_dem::{
//!     BoundingBox, CacheConfig, CoordinateNormalizer, GridAccess, HttpRemote, MosaicEngine,
//!     PayloadEncoding, Polygon, RetryPolicy, Source, SourceAccess, SourcePolicy, TileCache,
//!     TileLocator, DEFAULT_TIMEOUT, SKADI_URL_TEMPLATE,
//! };
//! use std::sync::Arc;
//!
//! let source = Source::new(
//!     "srtm".into(),
//!     SourceAccess::Grid(GridAccess::new(SKADI_URL_TEMPLATE)),
//!     SourcePolicy { payload: PayloadEncoding::Gzip, ..SourcePolicy::default() },
//!     Arc::new(HttpRemote::new(DEFAULT_TIMEOUT)?),
//! );
//!
//! let polygon = Polygon::from_bbox(&BoundingBox::new(-118.25, 34.05, -118.2, 34.1));
//! let locator = TileLocator::new(CoordinateNormalizer::default(), RetryPolicy::default());
//! let cache = TileCache::open(CacheConfig::new("./dem_cache"))?;
//!
//! let entries = locator
//!     .locate(&source, &polygon.bbox())?
//!     .iter()
//!     .map(|request| cache.fetch(&source, request))
//!     .collect::<Result<Vec<_>, _>>()?;
//!
//! let engine = MosaicEngine::new(CoordinateNormalizer::default(), "./out");
//! let output = engine.build(&entries, &polygon, source.policy().resampling, "example")?;
//! println!("{}", output.artifact.path.display());
//! # Ok::<(), demfetch_dem::DemError>(())
//! ```

mod cache;
mod crs;
mod error;
mod geo;
mod index;
mod locator;
mod mosaic;
mod raster;
mod remote;
mod source;

pub use cache::{
    CacheConfig, CacheEntry, CacheKey, CacheStats, EvictionReport, TileCache, DEFAULT_PART_GRACE,
    EVICTION_TARGET_RATIO,
};
pub use crs::{ConsistencyWarning, CoordinateNormalizer, Crs, Projector};
pub use error::{DemError, ErrorKind};
pub use geo::{BoundingBox, Polygon};
pub use index::{FootprintFileIndex, FootprintIndex, HttpTileIndex, IndexedTile, TileIndex};
pub use locator::{GridCell, TileId, TileLocator, TileRequest};
pub use mosaic::{BuildOutput, MosaicEngine, RasterArtifact, MAX_OUTPUT_PIXELS};
pub use raster::{
    DemRaster, RasterFormat, RasterHeader, ResamplingMethod, HGT_VOID, NODATA_VALUE,
};
pub use remote::{
    HttpRemote, RemoteError, RemoteMeta, RemoteStore, RetryExhausted, RetryPolicy, DEFAULT_TIMEOUT,
};
pub use source::{
    ApiAccess, GridAccess, IndexedAccess, PayloadEncoding, Source, SourceAccess, SourceId,
    SourcePolicy, SKADI_URL_TEMPLATE,
};

/// Result type for DEM operations.
pub type Result<T> = std::result::Result<T, DemError>;
