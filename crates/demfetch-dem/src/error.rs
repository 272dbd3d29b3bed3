//! Error types for the DEM crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure classification reported on a failed job.
///
/// Every error raised inside the pipeline maps onto exactly one kind via
/// [`DemError::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The requested area lies outside the source's coverage.
    NoCoverage,
    /// A tile could not be downloaded after bounded retries.
    FetchFailed,
    /// Tiles disagree in CRS or resolution family.
    CrsMismatch,
    /// Clipping produced no valid pixels.
    EmptyResult,
    /// The source's index or API could not be reached.
    SourceUnavailable,
    /// The job was cancelled before completion.
    Cancelled,
    /// Anything else: decode failures, local I/O, panics.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name, used in logs and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoCoverage => "no_coverage",
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::CrsMismatch => "crs_mismatch",
            ErrorKind::EmptyResult => "empty_result",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether resubmitting the same job may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::FetchFailed | ErrorKind::SourceUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur when locating, caching or assembling DEM data.
#[derive(Debug, Error)]
pub enum DemError {
    /// I/O error reading or writing a local file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Invalid GeoTIFF - missing or malformed georeferencing tags.
    #[error("Invalid GeoTIFF: {0}")]
    InvalidGeoTiff(String),

    /// Raster payload is structurally wrong (size, dimensions).
    #[error("Invalid raster: {0}")]
    InvalidRaster(String),

    /// Unsupported data type in the TIFF file.
    #[error("Unsupported TIFF data type: {0}")]
    UnsupportedDataType(String),

    /// Invalid tile filename - cannot parse the cell name.
    #[error("Invalid tile filename: {0}")]
    InvalidFilename(String),

    /// Geometry could not be parsed or is degenerate.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Coordinate transformation failed.
    #[error("Projection error: {0}")]
    Projection(String),

    /// JSON (de)serialization error for sidecars and footprint indexes.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The area does not intersect any tile of the source.
    #[error("Source '{source_id}' has no coverage for the requested area: {reason}")]
    NoCoverage {
        /// Source that was queried.
        source_id: String,
        /// Why nothing matched.
        reason: String,
    },

    /// A tile could not be downloaded and verified.
    #[error("Failed to fetch tile {tile_id} from '{source_id}' after {attempts} attempt(s): {reason}")]
    FetchFailed {
        /// Source the tile belongs to.
        source_id: String,
        /// Tile identifier within the source.
        tile_id: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// The source's index or API endpoint is unreachable.
    #[error("Source '{source_id}' is unavailable: {reason}")]
    SourceUnavailable {
        /// Source that failed.
        source_id: String,
        /// Last failure.
        reason: String,
    },

    /// Clipping left no valid pixels.
    #[error("Clipped raster contains no valid pixels")]
    EmptyResult,

    /// Invariant violation inside the pipeline.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DemError {
    /// Classify this error for job reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DemError::NoCoverage { .. } => ErrorKind::NoCoverage,
            DemError::FetchFailed { .. } => ErrorKind::FetchFailed,
            DemError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            DemError::EmptyResult => ErrorKind::EmptyResult,
            DemError::Io(_)
            | DemError::Tiff(_)
            | DemError::InvalidGeoTiff(_)
            | DemError::InvalidRaster(_)
            | DemError::UnsupportedDataType(_)
            | DemError::InvalidFilename(_)
            | DemError::InvalidGeometry(_)
            | DemError::Projection(_)
            | DemError::Json(_)
            | DemError::HttpClient(_)
            | DemError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = DemError::FetchFailed {
            source_id: "srtm".into(),
            tile_id: "N34W119".into(),
            attempts: 3,
            reason: "timed out".into(),
        };
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
        assert!(err.to_string().contains("N34W119"));
        assert!(err.to_string().contains("3 attempt(s)"));

        assert_eq!(DemError::EmptyResult.kind(), ErrorKind::EmptyResult);
        assert_eq!(
            DemError::Projection("bad".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SourceUnavailable).unwrap();
        assert_eq!(json, "\"source_unavailable\"");
        assert!(ErrorKind::FetchFailed.is_transient());
        assert!(!ErrorKind::EmptyResult.is_transient());
    }
}
