//! # demfetch-runner
//!
//! Background job orchestration for the demfetch tile pipeline.
//!
//! A [`JobOrchestrator`] owns the tile cache, the configured sources and a
//! pool of worker threads. Callers submit a polygon against a named source,
//! receive a [`JobId`] immediately and poll for the outcome:
//!
//! ```no_run
//! use demfetch_runner::{JobOrchestrator, OrchestratorConfig, PipelineConfig};
//! use demfetch_dem::{BoundingBox, Polygon};
//! use std::time::Duration;
//!
//! let config = PipelineConfig::default();
//! let sources = config.build_sources()?;
//! let orchestrator = JobOrchestrator::start(OrchestratorConfig::from(&config), sources)?;
//!
//! let polygon = Polygon::from_bbox(&BoundingBox::new(-118.25, 34.05, -118.2, 34.1));
//! let id = orchestrator.submit(polygon, "srtm")?;
//! let status = orchestrator.wait(id, Duration::from_secs(300))?;
//! println!("{}: {:?}", status.state, status.artifact);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
mod error;
pub mod job;
mod orchestrator;
pub mod table;

pub use config::{AccessConfig, IndexConfig, PipelineConfig, SourceConfig};
pub use error::{ConfigError, OrchestratorError};
pub use job::{Job, JobError, JobId, JobState, JobStatus, StageRecord};
pub use orchestrator::{JobOrchestrator, OrchestratorConfig};
pub use table::JobTable;
