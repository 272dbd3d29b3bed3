//! Local tile cache.
//!
//! Tiles are stored under `{root}/{source}/{tile}.{tif|hgt}` with a JSON
//! sidecar `{tile}.json` holding the [`CacheEntry`]. The sidecar is written
//! last, so a tile is only visible once its payload is complete.
//!
//! Concurrent fetches of the same key share one download: the first caller
//! downloads while the others block on the key's in-flight slot and receive
//! the same result. Fetches of different keys never wait on each other.
//!
//! Entries older than the source's TTL are re-validated with a lightweight
//! probe. A stale entry is reused when the remote cannot be reached.

use crate::locator::{GridCell, TileId, TileRequest};
use crate::raster::{DemRaster, RasterFormat};
use crate::remote::{RemoteError, RemoteMeta, RetryPolicy};
use crate::source::{PayloadEncoding, Source, SourceId};
use crate::{DemError, Result};
use chrono::{DateTime, Utc};
use demfetch_metrics::{metric_defs, SourceLabels};
use flate2::read::GzDecoder;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Fraction of the size limit eviction shrinks the cache to.
pub const EVICTION_TARGET_RATIO: f64 = 0.9;

const SIDECAR_EXTENSION: &str = "json";
const PART_EXTENSION: &str = "part";

/// Partial files younger than this may belong to a live download.
pub const DEFAULT_PART_GRACE: Duration = Duration::from_secs(60 * 60);

type Labels = Vec<(&'static str, String)>;

/// Cache identity of a tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: SourceId,
    pub tile_id: TileId,
}

impl From<&TileRequest> for CacheKey {
    fn from(request: &TileRequest) -> Self {
        CacheKey {
            source: request.source.clone(),
            tile_id: request.tile_id.clone(),
        }
    }
}

/// A published, verified tile on local disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source: SourceId,
    pub tile_id: TileId,
    pub local_path: PathBuf,
    pub fetched_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub source_ref: String,
    pub format: RasterFormat,
    /// Remote validators captured at download time.
    #[serde(default)]
    pub validator: RemoteMeta,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            source: self.source.clone(),
            tile_id: self.tile_id.clone(),
        }
    }

    /// Whether the entry has outlived `ttl` at `now`. No TTL never expires.
    pub fn is_stale(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl {
            None => false,
            Some(ttl) => {
                let age = now.signed_duration_since(self.fetched_at);
                chrono::Duration::from_std(ttl).map_or(false, |ttl| age >= ttl)
            }
        }
    }
}

/// Cache construction parameters.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// Total payload size above which least-recently-used entries are evicted.
    pub max_bytes: Option<u64>,
    pub retry: RetryPolicy,
    /// Age at which leftover partial files are removed on open.
    pub part_grace: Duration,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_bytes: None,
            retry: RetryPolicy::default(),
            part_grace: DEFAULT_PART_GRACE,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_part_grace(mut self, part_grace: Duration) -> Self {
        self.part_grace = part_grace;
        self
    }
}

/// Counters since the cache was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub dedup_waits: u64,
    pub downloads: u64,
    pub bytes_downloaded: u64,
    pub retries: u64,
    pub revalidations: u64,
    pub stale_reuses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    dedup_waits: AtomicU64,
    downloads: AtomicU64,
    bytes_downloaded: AtomicU64,
    retries: AtomicU64,
    revalidations: AtomicU64,
    stale_reuses: AtomicU64,
    evictions: AtomicU64,
}

/// Outcome of an eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub removed: usize,
    pub bytes_freed: u64,
    pub bytes_remaining: u64,
}

/// Download status shared between the downloading caller and waiters.
#[derive(Debug)]
enum FetchStatus {
    InProgress,
    Complete(CacheEntry),
    Failed { attempts: u32, reason: String },
}

#[derive(Debug)]
struct InFlight {
    status: Mutex<FetchStatus>,
    done: Condvar,
}

#[derive(Debug)]
struct IndexedEntry {
    entry: CacheEntry,
    last_used: DateTime<Utc>,
}

enum Role {
    Lead(Arc<InFlight>),
    Wait(Arc<InFlight>),
}

/// Local cache of downloaded tiles, safe to share across threads.
#[derive(Debug)]
pub struct TileCache {
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, IndexedEntry>>,
    in_flight: Mutex<HashMap<CacheKey, Arc<InFlight>>>,
    counters: CacheCounters,
    part_seq: AtomicU64,
}

impl TileCache {
    /// Open (or create) a cache rooted at `config.root`.
    ///
    /// Existing sidecars are indexed; partial downloads older than
    /// `part_grace` are left over from an interrupted process and removed.
    pub fn open(config: CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        let cache = Self {
            config,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
            part_seq: AtomicU64::new(0),
        };
        cache.scan()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total payload bytes of published entries.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .map(|indexed| indexed.entry.size_bytes)
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            dedup_waits: c.dedup_waits.load(Ordering::Relaxed),
            downloads: c.downloads.load(Ordering::Relaxed),
            bytes_downloaded: c.bytes_downloaded.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            revalidations: c.revalidations.load(Ordering::Relaxed),
            stale_reuses: c.stale_reuses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }

    /// Published entry for `key`, fresh or not.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).map(|indexed| indexed.entry.clone())
    }

    /// Return a verified local copy of the requested tile.
    ///
    /// Downloads on a miss, re-validates a stale entry, and joins an
    /// in-flight download of the same key instead of starting a second one.
    /// On failure nothing is published, so a later call retries.
    pub fn fetch(&self, source: &Source, request: &TileRequest) -> Result<CacheEntry> {
        if &request.source != source.id() {
            return Err(DemError::Internal(format!(
                "request for '{}' routed to source '{}'",
                request.source,
                source.id()
            )));
        }

        let key = CacheKey::from(request);
        let labels = SourceLabels::new(source.id().as_str()).to_labels();

        if let Some(entry) = self.fresh_entry(&key, source) {
            self.record_hit(&labels);
            return Ok(entry);
        }

        let role = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(slot) => Role::Wait(Arc::clone(slot)),
                None => {
                    // A download may have published between the fast path and here
                    if let Some(entry) = self.fresh_entry(&key, source) {
                        drop(in_flight);
                        self.record_hit(&labels);
                        return Ok(entry);
                    }
                    let slot = Arc::new(InFlight {
                        status: Mutex::new(FetchStatus::InProgress),
                        done: Condvar::new(),
                    });
                    in_flight.insert(key.clone(), Arc::clone(&slot));
                    Role::Lead(slot)
                }
            }
        };

        match role {
            Role::Lead(slot) => {
                let guard = LeadGuard {
                    cache: self,
                    key,
                    slot,
                };
                let result = self.resolve(source, request, &labels);
                guard.publish_status(&result);
                result
            }
            Role::Wait(slot) => {
                self.counters.dedup_waits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric_defs::CACHE_DEDUP_WAITS.name, &labels).increment(1);
                debug!("Waiting on in-flight download of {}/{}", key.source, key.tile_id);

                let mut status = slot.status.lock();
                while matches!(*status, FetchStatus::InProgress) {
                    slot.done.wait(&mut status);
                }
                match &*status {
                    FetchStatus::Complete(entry) => Ok(entry.clone()),
                    FetchStatus::Failed { attempts, reason } => Err(DemError::FetchFailed {
                        source_id: key.source.to_string(),
                        tile_id: key.tile_id.to_string(),
                        attempts: *attempts,
                        reason: reason.clone(),
                    }),
                    FetchStatus::InProgress => Err(DemError::Internal(
                        "woke with download still in progress".into(),
                    )),
                }
            }
        }
    }

    /// Decode the payload of `entry`, fetching the tile again if it was
    /// evicted since `entry` was handed out.
    pub fn load_raster(
        &self,
        source: &Source,
        request: &TileRequest,
        entry: &CacheEntry,
    ) -> Result<DemRaster> {
        match DemRaster::from_file(&entry.local_path) {
            Err(DemError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "{}/{} was evicted before use; fetching again",
                    entry.source, entry.tile_id
                );
                let entry = self.fetch(source, request)?;
                DemRaster::from_file(&entry.local_path)
            }
            other => other,
        }
    }

    /// Evict least-recently-used entries when the cache exceeds `max_bytes`.
    ///
    /// Shrinks to [`EVICTION_TARGET_RATIO`] of the limit. Entries with a
    /// download in flight are never removed.
    pub fn evict_to(&self, max_bytes: u64) -> Result<EvictionReport> {
        let busy: HashSet<CacheKey> = self.in_flight.lock().keys().cloned().collect();
        let mut entries = self.entries.lock();

        let mut total: u64 = entries.values().map(|i| i.entry.size_bytes).sum();
        let mut report = EvictionReport {
            bytes_remaining: total,
            ..EvictionReport::default()
        };
        if total <= max_bytes {
            return Ok(report);
        }

        let target = (max_bytes as f64 * EVICTION_TARGET_RATIO) as u64;
        let mut candidates: Vec<(DateTime<Utc>, CacheKey)> = entries
            .iter()
            .filter(|(key, _)| !busy.contains(*key))
            .map(|(key, indexed)| (indexed.last_used, key.clone()))
            .collect();
        candidates.sort_by_key(|(last_used, _)| *last_used);

        for (_, key) in candidates {
            if total <= target {
                break;
            }
            if let Some(indexed) = entries.remove(&key) {
                remove_if_exists(&indexed.entry.local_path)?;
                remove_if_exists(&sidecar_path(&indexed.entry.local_path))?;
                total = total.saturating_sub(indexed.entry.size_bytes);
                report.removed += 1;
                report.bytes_freed += indexed.entry.size_bytes;
                debug!("Evicted {}/{}", key.source, key.tile_id);
            }
        }
        report.bytes_remaining = total;

        self.counters
            .evictions
            .fetch_add(report.removed as u64, Ordering::Relaxed);
        metrics::counter!(metric_defs::CACHE_EVICTIONS.name).increment(report.removed as u64);
        metrics::gauge!(metric_defs::CACHE_SIZE.name).set(total as f64);
        info!(
            "Evicted {} entries ({} bytes), {} bytes remain",
            report.removed, report.bytes_freed, total
        );
        Ok(report)
    }

    fn record_hit(&self, labels: &Labels) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::CACHE_HITS.name, labels).increment(1);
    }

    /// Fresh indexed entry whose payload still exists; touches its LRU time.
    fn fresh_entry(&self, key: &CacheKey, source: &Source) -> Option<CacheEntry> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let indexed = entries.get_mut(key)?;
        if indexed.entry.is_stale(source.policy().ttl(), now) {
            return None;
        }
        if !indexed.entry.local_path.exists() {
            warn!(
                "Cached payload {} disappeared; dropping entry",
                indexed.entry.local_path.display()
            );
            entries.remove(key);
            return None;
        }
        indexed.last_used = now;
        Some(indexed.entry.clone())
    }

    /// Leader path: decide between hit, re-validation and download.
    fn resolve(
        &self,
        source: &Source,
        request: &TileRequest,
        labels: &Labels,
    ) -> Result<CacheEntry> {
        let key = CacheKey::from(request);
        let existing = match self.lookup(&key) {
            Some(entry) => Some(entry),
            // Another process sharing the directory may have published it
            None => self.load_sidecar_for(&key)?,
        };

        match existing {
            Some(entry) if !entry.is_stale(source.policy().ttl(), Utc::now()) && entry.local_path.exists() => {
                self.insert(entry.clone());
                self.record_hit(labels);
                Ok(entry)
            }
            Some(entry) if entry.local_path.exists() => self.revalidate(source, request, entry, labels),
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric_defs::CACHE_MISSES.name, labels).increment(1);
                self.download(source, request, labels)
            }
        }
    }

    fn revalidate(
        &self,
        source: &Source,
        request: &TileRequest,
        stale: CacheEntry,
        labels: &Labels,
    ) -> Result<CacheEntry> {
        self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::CACHE_REVALIDATIONS.name, labels).increment(1);

        let served_by = request.at(&stale.source_ref);
        let probe = self.config.retry.run(
            |_| source.remote().probe(&served_by),
            |attempt, e| self.note_retry(&served_by, "probe", attempt, e, labels),
        );

        match probe {
            Ok((meta, _)) if !stale.validator.differs_from(&meta) => {
                let mut renewed = stale;
                renewed.fetched_at = Utc::now();
                if meta != RemoteMeta::default() {
                    renewed.validator = meta;
                }
                write_sidecar(&renewed)?;
                self.insert(renewed.clone());
                debug!("{}/{} unchanged upstream; renewed", renewed.source, renewed.tile_id);
                Ok(renewed)
            }
            Ok(_) => {
                info!("{}/{} changed upstream; re-downloading", stale.source, stale.tile_id);
                match self.download(source, request, labels) {
                    Ok(entry) => Ok(entry),
                    Err(e) => Ok(self.reuse_stale(stale, &e.to_string(), labels)),
                }
            }
            Err(exhausted) => Ok(self.reuse_stale(stale, &exhausted.last.to_string(), labels)),
        }
    }

    fn reuse_stale(
        &self,
        stale: CacheEntry,
        reason: &str,
        labels: &Labels,
    ) -> CacheEntry {
        warn!(
            "Reusing stale {}/{} (fetched {}): {}",
            stale.source, stale.tile_id, stale.fetched_at, reason
        );
        self.counters.stale_reuses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::CACHE_STALE_REUSES.name, labels).increment(1);
        self.insert(stale.clone());
        stale
    }

    fn note_retry(
        &self,
        request: &TileRequest,
        what: &str,
        attempt: u32,
        error: &RemoteError,
        labels: &Labels,
    ) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::CACHE_RETRIES.name, labels).increment(1);
        warn!(
            "{} of {}/{} failed (attempt {}): {}",
            what, request.source, request.tile_id, attempt, error
        );
    }

    /// Download, verify and atomically publish a tile.
    fn download(
        &self,
        source: &Source,
        request: &TileRequest,
        labels: &Labels,
    ) -> Result<CacheEntry> {
        let started = Instant::now();
        let dir = self.source_dir(&request.source);
        fs::create_dir_all(&dir)?;
        let stem = file_stem_for(&request.tile_id);
        let policy = source.policy();

        let fetch_failed = |attempts: u32, reason: String| DemError::FetchFailed {
            source_id: request.source.to_string(),
            tile_id: request.tile_id.to_string(),
            attempts,
            reason,
        };

        let (meta, part, served_by, attempts) = self
            .transfer(source, request, &dir, &stem, labels)
            .map_err(|(attempts, reason)| fetch_failed(attempts, reason))?;

        let size_bytes = fs::metadata(&part.path)?.len();
        if size_bytes == 0 {
            return Err(fetch_failed(attempts, "downloaded payload is empty".into()));
        }
        if size_bytes > policy.max_file_size {
            return Err(fetch_failed(
                attempts,
                format!(
                    "payload is {} bytes, over the {} byte limit",
                    size_bytes, policy.max_file_size
                ),
            ));
        }
        let header = DemRaster::probe_header(&part.path)
            .map_err(|e| fetch_failed(attempts, format!("payload is not a readable raster: {}", e)))?;
        if header.format == RasterFormat::Hgt
            && GridCell::from_name(request.tile_id.as_str()).is_none()
        {
            return Err(fetch_failed(
                attempts,
                format!("HGT payload for {}, which is not a grid cell", request.tile_id),
            ));
        }

        let local_path = dir.join(format!("{}.{}", stem, header.format.extension()));
        part.persist(&local_path)?;
        // A previous version may have been stored in the other format
        for format in [RasterFormat::GeoTiff, RasterFormat::Hgt] {
            if format != header.format {
                remove_if_exists(&dir.join(format!("{}.{}", stem, format.extension())))?;
            }
        }

        let entry = CacheEntry {
            source: request.source.clone(),
            tile_id: request.tile_id.clone(),
            local_path,
            fetched_at: Utc::now(),
            size_bytes,
            source_ref: served_by,
            format: header.format,
            validator: meta,
        };
        write_sidecar(&entry)?;
        self.insert(entry.clone());

        let elapsed = started.elapsed();
        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_downloaded
            .fetch_add(size_bytes, Ordering::Relaxed);
        metrics::counter!(metric_defs::CACHE_DOWNLOADS.name, labels).increment(1);
        metrics::counter!(metric_defs::CACHE_DOWNLOAD_BYTES.name, labels).increment(size_bytes);
        metrics::histogram!(metric_defs::FETCH_DURATION.name, labels).record(elapsed.as_secs_f64());
        info!(
            "Cached {}/{} ({} bytes, {}x{}) in {:.1}s",
            entry.source,
            entry.tile_id,
            size_bytes,
            header.width,
            header.height,
            elapsed.as_secs_f64()
        );

        if let Some(max_bytes) = self.config.max_bytes {
            if let Err(e) = self.evict_to(max_bytes) {
                warn!("Cache eviction failed: {}", e);
            }
        }
        Ok(entry)
    }

    /// Download from each location of `request` in turn.
    ///
    /// A location that is missing or still failing transiently after its
    /// retries hands over to the next mirror; any other failure ends the
    /// download. Returns the location that served the payload and the total
    /// number of attempts.
    fn transfer(
        &self,
        source: &Source,
        request: &TileRequest,
        dir: &Path,
        stem: &str,
        labels: &Labels,
    ) -> std::result::Result<(RemoteMeta, PartFile, String, u32), (u32, String)> {
        let mut attempts = 0;
        let mut failures = Vec::new();
        for location in request.locations() {
            let target = request.at(location);
            match self.config.retry.run(
                |_| self.download_attempt(source, &target, dir, stem),
                |attempt, e| self.note_retry(&target, "download", attempt, e, labels),
            ) {
                Ok(((meta, part), used)) => return Ok((meta, part, location.to_string(), attempts + used)),
                Err(exhausted) => {
                    attempts += exhausted.attempts;
                    let next_mirror = matches!(exhausted.last, RemoteError::NotFound(_))
                        || exhausted.last.is_retryable();
                    failures.push(format!("{}: {}", location, exhausted.last));
                    if !next_mirror {
                        break;
                    }
                    if !request.mirrors.is_empty() {
                        warn!(
                            "{}/{} unavailable at {}: {}",
                            request.source, request.tile_id, location, exhausted.last
                        );
                    }
                }
            }
        }
        Err((attempts, failures.join("; ")))
    }

    /// One transfer into a uniquely named partial file.
    fn download_attempt(
        &self,
        source: &Source,
        request: &TileRequest,
        dir: &Path,
        stem: &str,
    ) -> std::result::Result<(RemoteMeta, PartFile), RemoteError> {
        let seq = self.part_seq.fetch_add(1, Ordering::Relaxed);
        let part = PartFile::new(dir.join(format!(
            ".{}.{}.{}.{}",
            stem,
            std::process::id(),
            seq,
            PART_EXTENSION
        )));

        let mut file = File::create(&part.path)?;
        let meta = match source.policy().payload {
            PayloadEncoding::Raw => {
                let mut writer = BufWriter::new(&mut file);
                let meta = source.remote().fetch_into(request, &mut writer)?;
                writer.flush()?;
                meta
            }
            PayloadEncoding::Gzip => {
                let compressed = PartFile::new(part.path.with_extension(format!("gz.{}", PART_EXTENSION)));
                let meta = {
                    let mut writer = BufWriter::new(File::create(&compressed.path)?);
                    let meta = source.remote().fetch_into(request, &mut writer)?;
                    writer.flush()?;
                    meta
                };
                gunzip(&compressed.path, &mut file)?;
                meta
            }
        };
        file.sync_all()?;
        Ok((meta, part))
    }

    fn source_dir(&self, source: &SourceId) -> PathBuf {
        self.config.root.join(file_stem_for_str(source.as_str()))
    }

    fn insert(&self, entry: CacheEntry) {
        let key = entry.key();
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            IndexedEntry {
                entry,
                last_used: Utc::now(),
            },
        );
        let total: u64 = entries.values().map(|i| i.entry.size_bytes).sum();
        metrics::gauge!(metric_defs::CACHE_SIZE.name).set(total as f64);
    }

    fn load_sidecar_for(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self
            .source_dir(&key.source)
            .join(format!("{}.{}", file_stem_for(&key.tile_id), SIDECAR_EXTENSION));
        if !path.exists() {
            return Ok(None);
        }
        Ok(read_sidecar(&path)?.filter(|entry| entry.key() == *key))
    }

    /// Index existing sidecars and clear leftover partial files.
    fn scan(&self) -> Result<()> {
        let mut loaded = 0usize;
        for source_dir in fs::read_dir(&self.config.root)? {
            let source_dir = source_dir?.path();
            if !source_dir.is_dir() {
                continue;
            }
            for file in fs::read_dir(&source_dir)? {
                let path = file?.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(PART_EXTENSION) => {
                        if is_abandoned(&path, self.config.part_grace) {
                            debug!("Removing leftover partial file {}", path.display());
                            remove_if_exists(&path)?;
                        }
                    }
                    Some(SIDECAR_EXTENSION) => {
                        if let Some(entry) = read_sidecar(&path)? {
                            let last_used = fs::metadata(&entry.local_path)
                                .and_then(|m| m.modified())
                                .map(DateTime::<Utc>::from)
                                .unwrap_or(entry.fetched_at);
                            self.entries
                                .lock()
                                .insert(entry.key(), IndexedEntry { entry, last_used });
                            loaded += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
        if loaded > 0 {
            info!(
                "Indexed {} cached tile(s) under {}",
                loaded,
                self.config.root.display()
            );
        }
        Ok(())
    }
}

/// Releases the in-flight slot however the leader exits, panics included.
struct LeadGuard<'a> {
    cache: &'a TileCache,
    key: CacheKey,
    slot: Arc<InFlight>,
}

impl LeadGuard<'_> {
    fn publish_status(&self, result: &Result<CacheEntry>) {
        let status = match result {
            Ok(entry) => FetchStatus::Complete(entry.clone()),
            Err(DemError::FetchFailed {
                attempts, reason, ..
            }) => FetchStatus::Failed {
                attempts: *attempts,
                reason: reason.clone(),
            },
            Err(e) => FetchStatus::Failed {
                attempts: 1,
                reason: e.to_string(),
            },
        };
        *self.slot.status.lock() = status;
    }
}

impl Drop for LeadGuard<'_> {
    fn drop(&mut self) {
        {
            let mut status = self.slot.status.lock();
            if matches!(*status, FetchStatus::InProgress) {
                *status = FetchStatus::Failed {
                    attempts: 0,
                    reason: "download aborted".into(),
                };
            }
        }
        self.slot.done.notify_all();
        self.cache.in_flight.lock().remove(&self.key);
    }
}

/// Partial download, removed on drop unless persisted.
struct PartFile {
    path: PathBuf,
    persisted: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn persist(mut self, dest: &Path) -> std::io::Result<()> {
        fs::rename(&self.path, dest)?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Filesystem-safe stem for a tile id; ids with other characters are hashed.
fn file_stem_for(tile_id: &TileId) -> String {
    file_stem_for_str(tile_id.as_str())
}

fn file_stem_for_str(id: &str) -> String {
    let safe = !id.is_empty()
        && id.len() <= 100
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if safe {
        id.to_string()
    } else {
        hex::encode(Sha256::digest(id.as_bytes()))[..32].to_string()
    }
}

fn sidecar_path(local_path: &Path) -> PathBuf {
    local_path.with_extension(SIDECAR_EXTENSION)
}

/// Write the sidecar via a temporary file and rename.
fn write_sidecar(entry: &CacheEntry) -> Result<()> {
    let path = sidecar_path(&entry.local_path);
    let tmp = path.with_extension(format!("{}.{}", SIDECAR_EXTENSION, PART_EXTENSION));
    let json = serde_json::to_vec_pretty(entry)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Read a sidecar; `None` (and cleanup) when its payload is missing or corrupt.
fn read_sidecar(path: &Path) -> Result<Option<CacheEntry>> {
    let text = fs::read_to_string(path)?;
    let mut entry: CacheEntry = match serde_json::from_str(&text) {
        Ok(entry) => entry,
        Err(e) => {
            warn!("Discarding unreadable cache sidecar {}: {}", path.display(), e);
            remove_if_exists(path)?;
            return Ok(None);
        }
    };

    // Paths are re-anchored so the cache directory can move
    let file_name = entry.local_path.file_name().map(|n| n.to_owned());
    if let (Some(dir), Some(name)) = (path.parent(), file_name) {
        entry.local_path = dir.join(name);
    }

    match fs::metadata(&entry.local_path) {
        Ok(meta) if meta.len() == entry.size_bytes => Ok(Some(entry)),
        _ => {
            warn!(
                "Discarding cache sidecar {} with missing or truncated payload",
                path.display()
            );
            remove_if_exists(path)?;
            Ok(None)
        }
    }
}

/// A partial file untouched for `grace`. Unreadable timestamps count as live.
fn is_abandoned(path: &Path, grace: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(grace.is_zero(), |age| age >= grace)
}

/// Inflate the gzip file at `src` into `out`.
///
/// Corrupt input is an invalid response rather than a transient I/O failure.
fn gunzip(src: &Path, out: &mut File) -> std::result::Result<(), RemoteError> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(out);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = decoder
            .read(&mut buf)
            .map_err(|e| RemoteError::InvalidResponse(format!("corrupt gzip payload: {}", e)))?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read])?;
    }
    writer.flush()?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_for_safe_and_unsafe_ids() {
        assert_eq!(file_stem_for(&TileId::new("N34W119")), "N34W119");
        assert_eq!(
            file_stem_for(&TileId::new("MDT-2m_205263.04")),
            "MDT-2m_205263.04"
        );

        let hashed = file_stem_for(&TileId::new("../../etc/passwd"));
        assert_eq!(hashed.len(), 32);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hashed, file_stem_for(&TileId::new("../../etc/shadow")));
    }

    #[test]
    fn test_entry_staleness() {
        let fetched_at = Utc::now() - chrono::Duration::hours(2);
        let entry = CacheEntry {
            source: SourceId::new("srtm"),
            tile_id: TileId::new("N34W119"),
            local_path: PathBuf::from("/tmp/N34W119.hgt"),
            fetched_at,
            size_bytes: 10,
            source_ref: String::new(),
            format: RasterFormat::Hgt,
            validator: RemoteMeta::default(),
        };
        let now = Utc::now();
        assert!(!entry.is_stale(None, now));
        assert!(!entry.is_stale(Some(Duration::from_secs(3 * 3600)), now));
        assert!(entry.is_stale(Some(Duration::from_secs(3600)), now));
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/c/srtm/N34W119.hgt")),
            PathBuf::from("/c/srtm/N34W119.json")
        );
    }
}
