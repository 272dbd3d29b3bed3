//! Remote object access and retry policy.
//!
//! [`RemoteStore`] abstracts the transport that delivers tile payloads so the
//! cache can be exercised without a network. [`HttpRemote`] is the production
//! implementation on top of a blocking `reqwest` client.

use crate::locator::TileRequest;
use crate::Result;
use rand::Rng;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default timeout for a single remote operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Failure of a single remote operation.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    #[error("I/O error during transfer: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Timeout(_)
            | RemoteError::Connect(_)
            | RemoteError::Interrupted(_)
            | RemoteError::Io(_) => true,
            RemoteError::Status { status, .. } => *status == 429 || *status >= 500,
            RemoteError::NotFound(_) | RemoteError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            RemoteError::Timeout(url)
        } else if e.is_connect() {
            RemoteError::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            RemoteError::Status {
                status: status.as_u16(),
                url,
            }
        } else if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Interrupted(e.to_string())
        }
    }
}

/// Validators describing a remote object's current version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMeta {
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl RemoteMeta {
    /// Whether `other` describes a different version of the object.
    ///
    /// Only fields known on both sides are compared; with nothing comparable
    /// the object is assumed unchanged.
    pub fn differs_from(&self, other: &RemoteMeta) -> bool {
        fn differs<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            matches!((a, b), (Some(a), Some(b)) if a != b)
        }
        differs(&self.etag, &other.etag)
            || differs(&self.last_modified, &other.last_modified)
            || differs(&self.content_length, &other.content_length)
    }
}

/// Transport for tile payloads.
pub trait RemoteStore: Send + Sync {
    /// Stream the object named by `request.source_ref` into `out`.
    fn fetch_into(&self, request: &TileRequest, out: &mut dyn Write)
        -> std::result::Result<RemoteMeta, RemoteError>;

    /// Lightweight validator lookup, without transferring the payload.
    fn probe(&self, request: &TileRequest) -> std::result::Result<RemoteMeta, RemoteError>;
}

/// HTTP(S) transport.
pub struct HttpRemote {
    client: Client,
}

impl HttpRemote {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    fn check_status(response: Response) -> std::result::Result<Response, RemoteError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(response.url().to_string()));
        }
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }
}

fn meta_from_headers(headers: &HeaderMap) -> RemoteMeta {
    let text = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    RemoteMeta {
        content_length: text(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
        etag: text(ETAG),
        last_modified: text(LAST_MODIFIED),
    }
}

impl RemoteStore for HttpRemote {
    fn fetch_into(
        &self,
        request: &TileRequest,
        out: &mut dyn Write,
    ) -> std::result::Result<RemoteMeta, RemoteError> {
        debug!("GET {}", request.source_ref);
        let response = self.client.get(&request.source_ref).send()?;
        let mut response = Self::check_status(response)?;
        let meta = meta_from_headers(response.headers());

        let written = std::io::copy(&mut response, out)?;
        if let Some(expected) = meta.content_length {
            if written != expected {
                return Err(RemoteError::Interrupted(format!(
                    "received {} of {} bytes from {}",
                    written, expected, request.source_ref
                )));
            }
        }
        Ok(meta)
    }

    fn probe(&self, request: &TileRequest) -> std::result::Result<RemoteMeta, RemoteError> {
        debug!("HEAD {}", request.source_ref);
        let response = self.client.head(&request.source_ref).send()?;
        let response = Self::check_status(response)?;
        Ok(meta_from_headers(response.headers()))
    }
}

/// Bounded retries with exponential backoff and jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

/// Every attempt failed, or a non-retryable error stopped the loop.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: RemoteError,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, with up to 25% added jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let base = exp.min(self.max_backoff_ms);
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` is called before
    /// each backoff sleep.
    pub fn run<T, F, R>(&self, mut op: F, mut on_retry: R) -> std::result::Result<(T, u32), RetryExhausted>
    where
        F: FnMut(u32) -> std::result::Result<T, RemoteError>,
        R: FnMut(u32, &RemoteError),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    on_retry(attempt, &e);
                    std::thread::sleep(self.backoff(attempt));
                    attempt += 1;
                }
                Err(last) => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_retry_until_success() {
        let mut retries = 0;
        let (value, attempts) = fast_policy(3)
            .run(
                |attempt| {
                    if attempt < 3 {
                        Err(RemoteError::Timeout("slow".into()))
                    } else {
                        Ok(attempt * 10)
                    }
                },
                |_, _| retries += 1,
            )
            .unwrap();
        assert_eq!(value, 30);
        assert_eq!(attempts, 3);
        assert_eq!(retries, 2);
    }

    #[test]
    fn test_retry_stops_on_permanent_error() {
        let mut calls = 0;
        let err = fast_policy(5)
            .run::<(), _, _>(
                |_| {
                    calls += 1;
                    Err(RemoteError::NotFound("gone".into()))
                },
                |_, _| {},
            )
            .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.last, RemoteError::NotFound(_)));
    }

    #[test]
    fn test_retry_bounded() {
        let err = fast_policy(2)
            .run::<(), _, _>(|_| Err(RemoteError::Connect("refused".into())), |_, _| {})
            .unwrap_err();
        assert_eq!(err.attempts, 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 400,
        };
        assert!(policy.backoff(1) >= Duration::from_millis(100));
        assert!(policy.backoff(8) <= Duration::from_millis(500));
    }

    #[test]
    fn test_status_retryability() {
        let server = RemoteError::Status {
            status: 503,
            url: String::new(),
        };
        let client = RemoteError::Status {
            status: 403,
            url: String::new(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
    }

    #[test]
    fn test_meta_differs_only_on_known_fields() {
        let a = RemoteMeta {
            content_length: Some(10),
            etag: Some("\"v1\"".into()),
            last_modified: None,
        };
        let unknown = RemoteMeta::default();
        assert!(!a.differs_from(&unknown));

        let b = RemoteMeta {
            etag: Some("\"v2\"".into()),
            ..a.clone()
        };
        assert!(a.differs_from(&b));
    }
}
