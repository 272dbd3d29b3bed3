//! End-to-end job runs against an in-memory remote.

use demfetch_dem::{
    BoundingBox, CacheConfig, Crs, DemRaster, ErrorKind, GridAccess, GridCell, Polygon,
    RemoteError, RemoteMeta, RemoteStore, RetryPolicy, Source, SourceAccess, SourceId,
    SourcePolicy, TileRequest,
};
use demfetch_runner::{JobOrchestrator, JobState, OrchestratorConfig, OrchestratorError};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(30);

/// Serves fixed payloads keyed by URL.
struct MemoryRemote {
    objects: HashMap<String, Vec<u8>>,
    delay: Duration,
    fetches: AtomicUsize,
}

impl MemoryRemote {
    fn new(delay: Duration) -> Self {
        let mut objects = HashMap::new();
        objects.insert("mem://N34W119".to_string(), geotiff_bytes("N34W119", 150.0));
        Self {
            objects,
            delay,
            fetches: AtomicUsize::new(0),
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RemoteStore for MemoryRemote {
    fn fetch_into(&self, request: &TileRequest, out: &mut dyn Write) -> Result<RemoteMeta, RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let payload = self
            .objects
            .get(&request.source_ref)
            .ok_or_else(|| RemoteError::NotFound(request.source_ref.clone()))?;
        out.write_all(payload)?;
        Ok(RemoteMeta {
            content_length: Some(payload.len() as u64),
            etag: Some("\"v1\"".into()),
            last_modified: None,
        })
    }

    fn probe(&self, request: &TileRequest) -> Result<RemoteMeta, RemoteError> {
        let payload = self
            .objects
            .get(&request.source_ref)
            .ok_or_else(|| RemoteError::NotFound(request.source_ref.clone()))?;
        Ok(RemoteMeta {
            content_length: Some(payload.len() as u64),
            etag: Some("\"v1\"".into()),
            last_modified: None,
        })
    }
}

/// A 1x1 degree cell at 0.01 degree resolution.
fn geotiff_bytes(cell: &str, value: f32) -> Vec<u8> {
    let cell = GridCell::from_name(cell).unwrap();
    let raster = DemRaster::new(
        cell.name(),
        vec![value; 100 * 100],
        100,
        100,
        cell.bounds(),
        Crs::WGS84,
        Some(-32768.0),
    )
    .unwrap();
    let mut cursor = Cursor::new(Vec::new());
    raster.write_geotiff_to(&mut cursor).unwrap();
    cursor.into_inner()
}

fn grid_source(name: &str, template: &str, remote: Arc<MemoryRemote>) -> Source {
    Source::new(
        SourceId::new(name),
        SourceAccess::Grid(GridAccess::new(template)),
        SourcePolicy {
            coverage: vec![BoundingBox::new(-120.0, 33.0, -117.0, 36.0)],
            ..SourcePolicy::default()
        },
        remote,
    )
}

struct Harness {
    orchestrator: JobOrchestrator,
    remote: Arc<MemoryRemote>,
    _cache_dir: TempDir,
    _output_dir: TempDir,
}

fn harness(delay: Duration) -> Harness {
    let cache_dir = TempDir::new().unwrap();
    let output_dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new(delay));

    let retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    };
    let mut config = OrchestratorConfig::new(cache_dir.path(), output_dir.path());
    config.workers = 2;
    config.cache = CacheConfig::new(cache_dir.path()).with_retry(retry.clone());
    config.retry = retry;

    let sources = vec![
        grid_source("test", "mem://{cell}", Arc::clone(&remote)),
        grid_source("missing", "mem://missing/{cell}", Arc::clone(&remote)),
    ];
    Harness {
        orchestrator: JobOrchestrator::start(config, sources).unwrap(),
        remote,
        _cache_dir: cache_dir,
        _output_dir: output_dir,
    }
}

fn area() -> Polygon {
    Polygon::from_bbox(&BoundingBox::new(-118.25, 34.05, -118.2, 34.1))
}

#[test]
fn test_job_completes_with_clipped_artifact() {
    let h = harness(Duration::ZERO);
    let id = h.orchestrator.submit(area(), "test").unwrap();
    let status = h.orchestrator.wait(id, WAIT).unwrap();

    assert_eq!(status.state, JobState::Complete, "{:?}", status.error);
    assert_eq!(status.tiles, Some(1));
    let artifact = status.artifact.unwrap();
    assert!(artifact.path.exists());
    assert_eq!(artifact.crs, Crs::WGS84);
    assert_eq!((artifact.width, artifact.height), (5, 5));
    assert_eq!(artifact.valid_pixels, 25);
    approx::assert_relative_eq!(artifact.bounds.min_x, -118.25, epsilon = 1e-9);
    approx::assert_relative_eq!(artifact.bounds.min_y, 34.05, epsilon = 1e-9);
    approx::assert_relative_eq!(artifact.bounds.max_x, -118.2, epsilon = 1e-9);
    approx::assert_relative_eq!(artifact.bounds.max_y, 34.1, epsilon = 1e-9);

    let written = DemRaster::from_file(&artifact.path).unwrap();
    approx::assert_relative_eq!(written.pixel(2, 2).unwrap(), 150.0);
}

#[test]
fn test_stage_history_is_sequential_and_terminal_is_final() {
    let h = harness(Duration::from_millis(200));
    let id = h.orchestrator.submit(area(), "test").unwrap();
    assert!(!h.orchestrator.poll(id).unwrap().is_terminal());

    let done = h.orchestrator.wait(id, WAIT).unwrap();
    let states: Vec<JobState> = done.stage_history.iter().map(|r| r.state).collect();
    assert_eq!(
        states,
        vec![
            JobState::Pending,
            JobState::Locating,
            JobState::Fetching,
            JobState::Merging,
            JobState::Clipping,
            JobState::Complete,
        ]
    );

    let after_cancel = h.orchestrator.cancel(id).unwrap();
    assert_eq!(after_cancel.state, JobState::Complete);
    assert!(!after_cancel.cancel_requested);
    assert_eq!(h.orchestrator.poll(id).unwrap(), done);
}

#[test]
fn test_concurrent_jobs_share_one_download() {
    let h = harness(Duration::from_millis(200));
    let ids: Vec<_> = (0..2)
        .map(|_| h.orchestrator.submit(area(), "test").unwrap())
        .collect();
    for id in ids {
        let status = h.orchestrator.wait(id, WAIT).unwrap();
        assert_eq!(status.state, JobState::Complete);
    }
    assert_eq!(h.remote.fetches(), 1);
}

#[test]
fn test_cached_tile_is_not_refetched() {
    let h = harness(Duration::ZERO);
    let first = h.orchestrator.submit(area(), "test").unwrap();
    h.orchestrator.wait(first, WAIT).unwrap();
    let second = h.orchestrator.submit(area(), "test").unwrap();
    let status = h.orchestrator.wait(second, WAIT).unwrap();

    assert_eq!(status.state, JobState::Complete);
    assert_eq!(h.remote.fetches(), 1);
    assert_eq!(h.orchestrator.cache().len(), 1);
}

#[test]
fn test_missing_tile_fails_job() {
    let h = harness(Duration::ZERO);
    let id = h.orchestrator.submit(area(), "missing").unwrap();
    let status = h.orchestrator.wait(id, WAIT).unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert!(status.artifact.is_none());
    assert_eq!(status.error.unwrap().kind, ErrorKind::FetchFailed);
    assert!(h.orchestrator.cache().is_empty());
}

#[test]
fn test_cancel_stops_at_next_stage() {
    let h = harness(Duration::from_millis(300));
    let id = h.orchestrator.submit(area(), "test").unwrap();
    let requested = h.orchestrator.cancel(id).unwrap();
    assert!(requested.cancel_requested);

    let status = h.orchestrator.wait(id, WAIT).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::Cancelled);
    assert!(status.artifact.is_none());
}

#[test]
fn test_unknown_job_is_not_found() {
    let h = harness(Duration::ZERO);
    let unknown = demfetch_runner::JobId(999);
    assert!(matches!(
        h.orchestrator.poll(unknown),
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.cancel(unknown),
        Err(OrchestratorError::NotFound(_))
    ));
}

#[test]
fn test_submit_rejects_unknown_source_and_uncovered_area() {
    let h = harness(Duration::ZERO);
    assert!(matches!(
        h.orchestrator.submit(area(), "nope"),
        Err(OrchestratorError::UnknownSource(_))
    ));

    let far = Polygon::from_bbox(&BoundingBox::new(10.0, 50.0, 10.1, 50.1));
    let err = h.orchestrator.submit(far, "test").unwrap_err();
    assert!(matches!(err, OrchestratorError::NoCoverage { .. }));
    assert_eq!(err.kind(), Some(ErrorKind::NoCoverage));
    assert_eq!(h.remote.fetches(), 0);
}

#[test]
fn test_locate_without_job() {
    let h = harness(Duration::ZERO);
    let tiles = h.orchestrator.locate(&area(), "test").unwrap();
    assert_eq!(tiles.len(), 1);
    assert_eq!(tiles[0].tile_id.as_str(), "N34W119");
    assert_eq!(tiles[0].source_ref, "mem://N34W119");
}

#[test]
fn test_submit_after_shutdown_is_rejected() {
    let h = harness(Duration::ZERO);
    h.orchestrator.shutdown();
    assert!(matches!(
        h.orchestrator.submit(area(), "test"),
        Err(OrchestratorError::ShuttingDown)
    ));
}
