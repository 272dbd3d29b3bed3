//! Pipeline configuration.
//!
//! Loaded from YAML. Every field has a default, so an empty file (or no file)
//! yields the stock deployment with the `srtm`, `lidar` and `usgs-dem`
//! sources.
//!
//! ```yaml
//! cache_dir: ./dem_cache
//! workers: 4
//! sources:
//!   srtm:
//!     kind: grid
//!     url_templates:
//!       - https://s3.amazonaws.com/elevation-tiles-prod/skadi/{ns}{lat}/{cell}.hgt.gz
//!       - https://mirror.example.org/skadi/{ns}{lat}/{cell}.hgt.gz
//!     payload: gzip
//!     coverage:
//!       - { min_x: -180.0, min_y: -60.0, max_x: 180.0, max_y: 60.0 }
//! ```

use crate::error::ConfigError;
use demfetch_dem::{
    ApiAccess, BoundingBox, CacheConfig, Crs, FootprintFileIndex, GridAccess, HttpRemote,
    HttpTileIndex, IndexedAccess, PayloadEncoding, RemoteStore, RetryPolicy, Source,
    SourceAccess, SourceId, SourcePolicy, TileIndex, SKADI_URL_TEMPLATE,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DAY_SECS: u64 = 24 * 60 * 60;
const MB: u64 = 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Jobs processed concurrently.
    pub workers: usize,
    /// Tile downloads in flight across all jobs.
    pub fetch_parallelism: usize,
    /// How long finished jobs stay pollable.
    pub job_retention_secs: u64,
    /// Cache size bound; unbounded when absent.
    pub cache_max_bytes: Option<u64>,
    pub http_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub sources: BTreeMap<String, SourceConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("dem_cache"),
            output_dir: PathBuf::from("dem_output"),
            workers: 2,
            fetch_parallelism: 4,
            job_retention_secs: 3600,
            cache_max_bytes: None,
            http_timeout_secs: 120,
            retry: RetryPolicy::default(),
            sources: default_sources(),
        }
    }
}

/// One named source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub access: AccessConfig,
    #[serde(flatten)]
    pub policy: SourcePolicy,
}

/// How a source's tiles are discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessConfig {
    Grid {
        /// Mirrors tried in order; a single `url_template` string is accepted too.
        #[serde(alias = "url_template", deserialize_with = "one_or_many")]
        url_templates: Vec<String>,
    },
    Indexed {
        index: IndexConfig,
    },
    Api {
        endpoint: String,
        #[serde(default)]
        output_crs: Crs,
        #[serde(default = "default_max_pixels")]
        max_pixels: u32,
    },
}

fn default_max_pixels() -> u32 {
    4000
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(template) => vec![template],
        OneOrMany::Many(templates) => templates,
    })
}

/// Where an indexed source's footprints come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexConfig {
    File { path: PathBuf, crs: Crs },
    Http { endpoint: String, crs: Crs },
}

impl PipelineConfig {
    /// Load from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml_str(&text)?;
        debug!(
            "Loaded config from {} ({} sources)",
            path.as_ref().display(),
            config.sources.len()
        );
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = if text.trim().is_empty() {
            PipelineConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.fetch_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "fetch_parallelism must be at least 1".into(),
            ));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no sources configured".into()));
        }
        for (name, source) in &self.sources {
            let invalid = |reason: &str| ConfigError::Source {
                name: name.clone(),
                reason: reason.to_string(),
            };
            if name.trim().is_empty() {
                return Err(invalid("empty source name"));
            }
            if !(source.policy.resolution_m > 0.0) {
                return Err(invalid("resolution_m must be positive"));
            }
            if source.policy.max_file_size == 0 {
                return Err(invalid("max_file_size must be positive"));
            }
            match &source.access {
                AccessConfig::Grid { url_templates } if url_templates.is_empty() => {
                    return Err(invalid("url_templates is empty"));
                }
                AccessConfig::Grid { url_templates }
                    if url_templates
                        .iter()
                        .any(|t| !t.contains("{cell}") && !t.contains("{lat")) =>
                {
                    return Err(invalid("url template has no cell placeholder"));
                }
                AccessConfig::Api { max_pixels: 0, .. } => {
                    return Err(invalid("max_pixels must be positive"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(&self.cache_dir)
            .with_max_bytes(self.cache_max_bytes)
            .with_retry(self.retry.clone())
    }

    /// Build every configured source over HTTP.
    pub fn build_sources(&self) -> Result<Vec<Source>, ConfigError> {
        let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemote::new(self.http_timeout())?);
        self.build_sources_with(remote)
    }

    /// Build every configured source over the given transport.
    pub fn build_sources_with(&self, remote: Arc<dyn RemoteStore>) -> Result<Vec<Source>, ConfigError> {
        self.sources
            .iter()
            .map(|(name, config)| -> Result<Source, ConfigError> {
                let access = match &config.access {
                    AccessConfig::Grid { url_templates } => SourceAccess::Grid(GridAccess {
                        url_templates: url_templates.clone(),
                    }),
                    AccessConfig::Indexed { index } => {
                        let index: Arc<dyn TileIndex> = match index {
                            IndexConfig::File { path, crs } => {
                                Arc::new(FootprintFileIndex::new(path.clone(), *crs))
                            }
                            IndexConfig::Http { endpoint, crs } => Arc::new(HttpTileIndex::new(
                                endpoint.clone(),
                                *crs,
                                self.http_timeout(),
                            )?),
                        };
                        SourceAccess::Indexed(IndexedAccess { index })
                    }
                    AccessConfig::Api {
                        endpoint,
                        output_crs,
                        max_pixels,
                    } => SourceAccess::Api(ApiAccess {
                        endpoint: endpoint.clone(),
                        output_crs: *output_crs,
                        max_pixels: *max_pixels,
                    }),
                };
                Ok(Source::new(
                    SourceId::new(name.as_str()),
                    access,
                    config.policy.clone(),
                    Arc::clone(&remote),
                )
                .with_description(config.description.clone()))
            })
            .collect()
    }
}

/// The three sources of the stock deployment.
pub fn default_sources() -> BTreeMap<String, SourceConfig> {
    let mut sources = BTreeMap::new();

    sources.insert(
        "srtm".to_string(),
        SourceConfig {
            description: "Shuttle Radar Topography Mission - global 30m".into(),
            access: AccessConfig::Grid {
                url_templates: vec![SKADI_URL_TEMPLATE.into()],
            },
            policy: SourcePolicy {
                native_crs: Crs::WGS84,
                resolution_m: 30.0,
                ttl_secs: Some(365 * DAY_SECS),
                max_file_size: 100 * MB,
                coverage: vec![BoundingBox::new(-180.0, -60.0, 180.0, 60.0)],
                payload: PayloadEncoding::Gzip,
                ..SourcePolicy::default()
            },
        },
    );

    sources.insert(
        "lidar".to_string(),
        SourceConfig {
            description: "LiDAR Portugal - 1m, ETRS89 / PT-TM06".into(),
            access: AccessConfig::Indexed {
                index: IndexConfig::File {
                    path: PathBuf::from("data/lidarpt2m2025tiles.json"),
                    crs: Crs::from_epsg(3763),
                },
            },
            policy: SourcePolicy {
                native_crs: Crs::from_epsg(3763),
                resolution_m: 1.0,
                ttl_secs: Some(7 * DAY_SECS),
                max_file_size: 500 * MB,
                coverage: vec![BoundingBox::new(-9.6, 36.9, -6.1, 42.2)],
                ..SourcePolicy::default()
            },
        },
    );

    sources.insert(
        "usgs-dem".to_string(),
        SourceConfig {
            description: "USGS 3DEP - 10m, requested in WGS84".into(),
            access: AccessConfig::Api {
                endpoint:
                    "https://elevation.nationalmap.gov/arcgis/rest/services/3DEPElevation/ImageServer"
                        .into(),
                output_crs: Crs::WGS84,
                max_pixels: default_max_pixels(),
            },
            policy: SourcePolicy {
                native_crs: Crs::WGS84,
                resolution_m: 10.0,
                ttl_secs: Some(30 * DAY_SECS),
                max_file_size: 200 * MB,
                coverage: vec![
                    // Contiguous US, Alaska, Hawaii
                    BoundingBox::new(-125.0, 24.0, -66.0, 49.0),
                    BoundingBox::new(-180.0, 52.0, -130.0, 72.0),
                    BoundingBox::new(-161.0, 18.0, -154.0, 23.0),
                ],
                ..SourcePolicy::default()
            },
        },
    );

    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        let names: Vec<&str> = config.sources.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["lidar", "srtm", "usgs-dem"]);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = PipelineConfig::from_yaml_str("").unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.sources.len(), 3);
    }

    #[test]
    fn test_parse_sources() {
        let yaml = r#"
cache_dir: /var/cache/dem
workers: 3
cache_max_bytes: 1000000
retry:
  max_attempts: 5
sources:
  srtm:
    kind: grid
    url_template: "https://example.test/{cell}.hgt.gz"
    payload: gzip
    ttl_secs: 86400
    coverage:
      - { min_x: -180, min_y: -60, max_x: 180, max_y: 60 }
  pt:
    kind: indexed
    index:
      type: http
      endpoint: https://example.test/index
      crs: 3763
    native_crs: 3763
    resolution_m: 2
    resampling: nearest
  usgs:
    kind: api
    endpoint: https://example.test/ImageServer
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/dem"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.fetch_parallelism, 4);
        assert_eq!(config.cache_max_bytes, Some(1_000_000));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 500);

        let srtm = &config.sources["srtm"];
        assert_eq!(
            srtm.access,
            AccessConfig::Grid {
                url_templates: vec!["https://example.test/{cell}.hgt.gz".into()],
            }
        );
        assert_eq!(srtm.policy.payload, PayloadEncoding::Gzip);
        assert_eq!(srtm.policy.ttl_secs, Some(86400));
        assert_eq!(srtm.policy.coverage.len(), 1);

        let pt = &config.sources["pt"];
        assert_eq!(
            pt.access,
            AccessConfig::Indexed {
                index: IndexConfig::Http {
                    endpoint: "https://example.test/index".into(),
                    crs: Crs::from_epsg(3763),
                }
            }
        );
        assert_eq!(pt.policy.native_crs, Crs::from_epsg(3763));
        assert_eq!(pt.policy.resolution_m, 2.0);

        let usgs = &config.sources["usgs"];
        assert_eq!(
            usgs.access,
            AccessConfig::Api {
                endpoint: "https://example.test/ImageServer".into(),
                output_crs: Crs::WGS84,
                max_pixels: 4000,
            }
        );
        assert_eq!(usgs.policy.ttl_secs, None);
    }

    #[test]
    fn test_parse_grid_mirrors() {
        let yaml = r#"
sources:
  srtm:
    kind: grid
    url_templates:
      - "https://primary.test/{cell}.hgt"
      - "https://mirror.test/{ns}{lat}/{cell}.hgt"
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        match &config.sources["srtm"].access {
            AccessConfig::Grid { url_templates } => assert_eq!(url_templates.len(), 2),
            other => panic!("expected grid access, got {:?}", other),
        }

        let sources = config.build_sources().unwrap();
        match sources[0].access() {
            SourceAccess::Grid(grid) => {
                assert_eq!(grid.url_templates[1], "https://mirror.test/{ns}{lat}/{cell}.hgt")
            }
            other => panic!("expected grid access, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_mirror_without_placeholder() {
        let yaml = "sources:\n  x:\n    kind: grid\n    url_templates: [\"https://a.test/{cell}\", \"https://b.test/fixed\"]\n";
        assert!(matches!(
            PipelineConfig::from_yaml_str(yaml),
            Err(ConfigError::Source { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = PipelineConfig::from_yaml_str("workers: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let yaml = "sources:\n  x:\n    kind: ftp\n    url: ftp://example.test\n";
        assert!(matches!(
            PipelineConfig::from_yaml_str(yaml),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_build_sources_keeps_names_and_policies() {
        let config = PipelineConfig::default();
        let sources = config.build_sources().unwrap();
        assert_eq!(sources.len(), 3);
        let srtm = sources.iter().find(|s| s.id().as_str() == "srtm").unwrap();
        assert_eq!(srtm.access().kind_name(), "grid");
        assert_eq!(srtm.policy().payload, PayloadEncoding::Gzip);
        assert!(srtm.covers(&BoundingBox::new(-118.25, 34.05, -118.2, 34.1)));
        assert!(!srtm.covers(&BoundingBox::new(0.0, 70.0, 1.0, 71.0)));
    }
}
