//! Background job execution.
//!
//! `submit` records a `Pending` job and hands a ticket to a fixed pool of
//! worker threads over a channel. Each worker runs one job at a time through
//! Locating, Fetching, Merging and Clipping. Tile downloads within a job run
//! on a shared bounded rayon pool, and concurrent jobs needing the same tile
//! share one download through the [`TileCache`].
//!
//! Every outcome, panics included, ends in a terminal state on the job.

use crate::error::OrchestratorError;
use crate::job::{JobError, JobId, JobState, JobStatus};
use crate::table::JobTable;
use crossbeam_channel::{Receiver, Sender};
use demfetch_dem::{
    CacheConfig, CoordinateNormalizer, DemError, ErrorKind, MosaicEngine, Polygon,
    RasterArtifact, RetryPolicy, Source, SourceId, TileCache, TileLocator, TileRequest,
};
use demfetch_metrics::{metric_defs, SourceLabels};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Settings for [`JobOrchestrator::start`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub fetch_parallelism: usize,
    pub job_retention: Duration,
    pub output_dir: PathBuf,
    pub cache: CacheConfig,
    /// Retry policy for index queries.
    pub retry: RetryPolicy,
}

impl OrchestratorConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            workers: 2,
            fetch_parallelism: 4,
            job_retention: Duration::from_secs(3600),
            output_dir: output_dir.into(),
            cache: CacheConfig::new(cache_dir),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&crate::config::PipelineConfig> for OrchestratorConfig {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            workers: config.workers,
            fetch_parallelism: config.fetch_parallelism,
            job_retention: config.job_retention(),
            output_dir: config.output_dir.clone(),
            cache: config.cache_config(),
            retry: config.retry.clone(),
        }
    }
}

/// Work item sent to workers.
struct JobTicket {
    id: JobId,
    polygon: Polygon,
    source: SourceId,
}

/// State shared by the API and the workers.
struct Shared {
    table: JobTable,
    sources: BTreeMap<SourceId, Source>,
    locator: TileLocator,
    cache: Arc<TileCache>,
    engine: MosaicEngine,
    fetch_pool: rayon::ThreadPool,
    retention: Duration,
}

/// Runs DEM jobs in the background.
pub struct JobOrchestrator {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<JobTicket>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobOrchestrator {
    /// Open the cache and start the worker pool.
    pub fn start(config: OrchestratorConfig, sources: Vec<Source>) -> Result<Self, OrchestratorError> {
        let cache = Arc::new(TileCache::open(config.cache.clone())?);
        Self::start_with_cache(config, cache, sources)
    }

    /// Start the worker pool over an existing cache.
    pub fn start_with_cache(
        config: OrchestratorConfig,
        cache: Arc<TileCache>,
        sources: Vec<Source>,
    ) -> Result<Self, OrchestratorError> {
        let fetch_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.fetch_parallelism.max(1))
            .thread_name(|i| format!("demfetch-fetch-{}", i))
            .build()
            .map_err(|e| OrchestratorError::Startup(e.to_string()))?;

        let normalizer = CoordinateNormalizer::default();
        let shared = Arc::new(Shared {
            table: JobTable::new(),
            sources: sources.into_iter().map(|s| (s.id().clone(), s)).collect(),
            locator: TileLocator::new(normalizer.clone(), config.retry.clone()),
            cache,
            engine: MosaicEngine::new(normalizer, config.output_dir.clone()),
            fetch_pool,
            retention: config.job_retention,
        });

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(config.workers.max(1));
        for index in 0..config.workers.max(1) {
            let shared = Arc::clone(&shared);
            let receiver: Receiver<JobTicket> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("demfetch-worker-{}", index))
                .spawn(move || worker_main(&shared, receiver))
                .map_err(|e| OrchestratorError::Startup(e.to_string()))?;
            workers.push(handle);
        }

        info!(
            "Started {} worker(s), {} fetch thread(s), {} source(s)",
            workers.len(),
            config.fetch_parallelism.max(1),
            shared.sources.len()
        );

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job for `polygon` (EPSG:4326) against `source`.
    ///
    /// Returns immediately. Unknown sources and polygons outside the source's
    /// coverage are rejected here without creating a job.
    pub fn submit(&self, polygon: Polygon, source: &str) -> Result<JobId, OrchestratorError> {
        let source_id = SourceId::new(source);
        let source = self
            .shared
            .sources
            .get(&source_id)
            .ok_or_else(|| OrchestratorError::UnknownSource(source_id.to_string()))?;

        let bbox = polygon.bbox();
        if !source.covers(&bbox) {
            info!("Rejected job: {} is outside '{}' coverage", bbox, source_id);
            return Err(OrchestratorError::NoCoverage {
                source_id: source_id.to_string(),
                reason: format!("{} is outside the configured coverage", bbox),
            });
        }

        let purged = self.shared.table.purge_expired(self.shared.retention);
        if purged > 0 {
            debug!("Purged {} expired job(s)", purged);
        }

        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(OrchestratorError::ShuttingDown)?;
        let id = self.shared.table.insert(polygon.clone(), source_id.clone());
        let ticket = JobTicket {
            id,
            polygon,
            source: source_id.clone(),
        };
        if sender.send(ticket).is_err() {
            let _ = self
                .shared
                .table
                .fail(id, JobError::internal("worker pool is gone"));
            return Err(OrchestratorError::ShuttingDown);
        }

        let labels = SourceLabels::new(source_id.as_str()).to_labels();
        metrics::counter!(metric_defs::JOBS_SUBMITTED.name, &labels).increment(1);
        metrics::gauge!(metric_defs::JOBS_ACTIVE.name).increment(1.0);
        info!("Submitted job {} for '{}' over {}", id, source_id, bbox);
        Ok(id)
    }

    /// Current status of a job, without blocking.
    pub fn poll(&self, id: JobId) -> Result<JobStatus, OrchestratorError> {
        self.shared
            .table
            .status(id)
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Ask a job to stop at its next stage boundary.
    ///
    /// Downloads already in flight still complete and populate the cache.
    pub fn cancel(&self, id: JobId) -> Result<JobStatus, OrchestratorError> {
        let status = self.shared.table.request_cancel(id)?;
        if status.cancel_requested {
            info!("Cancellation requested for job {}", id);
        }
        Ok(status)
    }

    /// Block until the job is terminal or `timeout` elapses.
    pub fn wait(&self, id: JobId, timeout: Duration) -> Result<JobStatus, OrchestratorError> {
        self.shared.table.wait_terminal(id, timeout)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.shared.sources.values()
    }

    pub fn source(&self, id: &str) -> Option<&Source> {
        self.shared.sources.get(&SourceId::new(id))
    }

    pub fn cache(&self) -> &TileCache {
        &self.shared.cache
    }

    /// Resolve tiles for `polygon` without creating a job.
    pub fn locate(&self, polygon: &Polygon, source: &str) -> Result<Vec<TileRequest>, OrchestratorError> {
        let source = self
            .source(source)
            .ok_or_else(|| OrchestratorError::UnknownSource(source.to_string()))?;
        Ok(self.shared.locator.locate(source, &polygon.bbox())?)
    }

    /// Stop accepting jobs, let queued jobs finish and join the workers.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!("{} exited with a panic", name);
            }
        }
        info!("Orchestrator shut down");
    }
}

impl Drop for JobOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Worker
// ============================================================================

fn worker_main(shared: &Shared, receiver: Receiver<JobTicket>) {
    // Ends when every sender is dropped and the queue is drained
    for ticket in receiver.iter() {
        run_job(shared, ticket);
    }
}

fn run_job(shared: &Shared, ticket: JobTicket) {
    let span = info_span!("job", id = %ticket.id, source = %ticket.source);
    let _enter = span.enter();
    let started = Instant::now();
    let labels = SourceLabels::new(ticket.source.as_str());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(shared, &ticket)))
        .unwrap_or_else(|payload| Err(JobError::internal(panic_message(payload.as_ref()))));

    let elapsed = started.elapsed();
    metrics::gauge!(metric_defs::JOBS_ACTIVE.name).decrement(1.0);
    metrics::histogram!(metric_defs::JOB_DURATION.name, &labels.to_labels()).record(elapsed.as_secs_f64());

    let recorded = match outcome {
        Ok(artifact) => {
            metrics::counter!(metric_defs::JOBS_COMPLETED.name, &labels.to_labels()).increment(1);
            metrics::histogram!(metric_defs::MOSAIC_VALID_PIXELS.name, &labels.to_labels())
                .record(artifact.valid_pixels as f64);
            info!(
                "Job {} complete in {:.1}s: {}",
                ticket.id,
                elapsed.as_secs_f64(),
                artifact.path.display()
            );
            shared.table.complete(ticket.id, artifact)
        }
        Err(job_error) => {
            let failure_labels = labels.with(&[("kind", job_error.kind.as_str().to_string())]);
            metrics::counter!(metric_defs::JOBS_FAILED.name, &failure_labels).increment(1);
            match job_error.kind {
                ErrorKind::Internal | ErrorKind::FetchFailed | ErrorKind::SourceUnavailable => {
                    error!("Job {} failed: {}", ticket.id, job_error)
                }
                _ => warn!("Job {} failed: {}", ticket.id, job_error),
            }
            shared.table.fail(ticket.id, job_error)
        }
    };
    if let Err(e) = recorded {
        error!("Could not record outcome of job {}: {}", ticket.id, e);
    }
}

/// Run every stage of one job.
fn execute(shared: &Shared, ticket: &JobTicket) -> Result<RasterArtifact, JobError> {
    let source = shared
        .sources
        .get(&ticket.source)
        .ok_or_else(|| JobError::internal(format!("source '{}' disappeared", ticket.source)))?;
    let labels = SourceLabels::new(ticket.source.as_str());
    let bbox = ticket.polygon.bbox();
    let method = source.policy().resampling;
    let mut stage = StageTimer::new(&labels);

    stage.enter(shared, ticket.id, JobState::Locating)?;
    let requests = shared.locator.locate(source, &bbox)?;
    shared
        .table
        .set_tiles(ticket.id, requests.len())
        .map_err(|e| JobError::internal(e.to_string()))?;
    metrics::histogram!(metric_defs::JOB_TILES.name, &labels.to_labels()).record(requests.len() as f64);

    stage.enter(shared, ticket.id, JobState::Fetching)?;
    let entries = shared.fetch_pool.install(|| {
        requests
            .par_iter()
            .map(|request| shared.cache.fetch(source, request))
            .collect::<Result<Vec<_>, DemError>>()
    })?;
    debug!("Fetched {} tile(s)", entries.len());

    stage.enter(shared, ticket.id, JobState::Merging)?;
    let tiles = requests
        .iter()
        .zip(&entries)
        .map(|(request, entry)| shared.cache.load_raster(source, request, entry))
        .collect::<Result<Vec<_>, DemError>>()?;
    let (canonical, warnings) = shared.engine.normalize(&tiles, method)?;
    if !warnings.is_empty() {
        shared
            .table
            .add_warnings(ticket.id, &warnings)
            .map_err(|e| JobError::internal(e.to_string()))?;
    }
    let merged = shared.engine.mosaic(&canonical, &bbox, method)?;

    stage.enter(shared, ticket.id, JobState::Clipping)?;
    let clipped = shared.engine.clip(&merged, &ticket.polygon)?;
    let artifact = shared
        .engine
        .write_artifact(&clipped, &format!("{}_{}", ticket.id, ticket.source))?;
    stage.finish();
    Ok(artifact)
}

/// Records how long a job spent in each stage.
struct StageTimer<'a> {
    labels: &'a SourceLabels,
    current: Option<(JobState, Instant)>,
}

impl<'a> StageTimer<'a> {
    fn new(labels: &'a SourceLabels) -> Self {
        Self {
            labels,
            current: None,
        }
    }

    /// Stage boundary: honour cancellation, then record the transition.
    fn enter(&mut self, shared: &Shared, id: JobId, stage: JobState) -> Result<(), JobError> {
        if shared.table.is_cancel_requested(id) {
            return Err(JobError::cancelled());
        }
        self.finish();
        debug!("Job {} entering {}", id, stage);
        shared
            .table
            .transition(id, stage)
            .map_err(|e| JobError::internal(e.to_string()))?;
        self.current = Some((stage, Instant::now()));
        Ok(())
    }

    fn finish(&mut self) {
        if let Some((stage, started)) = self.current.take() {
            let labels = self.labels.with(&[("stage", stage.as_str().to_string())]);
            metrics::histogram!(metric_defs::JOB_STAGE_DURATION.name, &labels)
                .record(started.elapsed().as_secs_f64());
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {}", detail)
}
