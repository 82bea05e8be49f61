//! HTTP Origin
//!
//! Reads remote files with HTTP range requests. File lengths come from
//! `HEAD` and are kept in a short-lived Moka cache so repeated attaches of
//! the same URL do not re-probe the server.

use std::io;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use moka::sync::Cache;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use tracing::{debug, trace, warn};

use super::origin::Origin;

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// How long a probed file length stays valid
const LENGTH_TTL: Duration = Duration::from_secs(600);

/// Shared HTTP client and length cache for all HTTP origins
pub struct HttpSource {
    /// Built on first request, from the thread that makes it
    client: OnceLock<Client>,
    lengths: Cache<String, u64>,
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSource {
    pub fn new() -> Self {
        let lengths = Cache::builder()
            .time_to_live(LENGTH_TTL)
            .name("origin_length_cache")
            .build();

        Self {
            client: OnceLock::new(),
            lengths,
        }
    }

    fn client(&self) -> io::Result<&Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(io::Error::other)?;
        Ok(self.client.get_or_init(|| client))
    }

    /// Create an origin for `url` sharing this client
    pub fn open(self: &Arc<Self>, url: &str) -> HttpOrigin {
        HttpOrigin {
            source: Arc::clone(self),
            url: url.to_string(),
        }
    }

    /// Execute a request with retry logic and exponential backoff
    fn with_retry<T, F>(&self, operation: &str, url: &str, f: F) -> io::Result<T>
    where
        F: Fn() -> Result<T, HttpError>,
    {
        let backoff_ms = [500u64, 1000, 2000];

        for attempt in 0..=MAX_RETRIES {
            match f() {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_retryable() || attempt == MAX_RETRIES {
                        return Err(e.into_io());
                    }
                    let delay = backoff_ms.get(attempt as usize).copied().unwrap_or(2000);
                    warn!(
                        operation = operation,
                        url = url,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_ms = delay,
                        error = %e,
                        "Retrying origin request"
                    );
                    thread::sleep(Duration::from_millis(delay));
                }
            }
        }

        Err(io::Error::other(format!("{} {} exhausted retries", operation, url)))
    }

    fn probe_length(&self, url: &str) -> io::Result<u64> {
        if let Some(len) = self.lengths.get(url) {
            trace!(url = url, "Length cache HIT");
            return Ok(len);
        }

        let client = self.client()?;
        let len = self.with_retry("head", url, || {
            let response = client.head(url).send().map_err(HttpError::from)?;
            let status = response.status();
            if !status.is_success() {
                return Err(HttpError::from_status(status));
            }
            response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| HttpError::Protocol("missing Content-Length".to_string()))
        })?;

        self.lengths.insert(url.to_string(), len);
        debug!(url = url, len = len, "Probed origin length");
        Ok(len)
    }

    fn read_range(&self, url: &str, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset + buf.len() as u64 - 1;

        let client = self.client()?;
        let body = self.with_retry("range", url, || {
            let response = client
                .get(url)
                .header(RANGE, format!("bytes={}-{}", offset, end))
                .send()
                .map_err(HttpError::from)?;
            let status = response.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                return Ok(Vec::new());
            }
            if status != StatusCode::PARTIAL_CONTENT {
                // A 200 would carry the whole file; treat it as a protocol violation.
                return Err(if status.is_success() {
                    HttpError::Protocol(format!("expected 206, got {}", status))
                } else {
                    HttpError::from_status(status)
                });
            }
            let bytes = response.bytes().map_err(HttpError::from)?;
            Ok(bytes.to_vec())
        })?;

        let n = body.len().min(buf.len());
        buf[..n].copy_from_slice(&body[..n]);
        trace!(url = url, offset = offset, len = n, "Origin range read");
        Ok(n)
    }
}

/// One remote file served over HTTP
pub struct HttpOrigin {
    source: Arc<HttpSource>,
    url: String,
}

impl Origin for HttpOrigin {
    fn path(&self) -> &str {
        &self.url
    }

    fn len(&self) -> io::Result<u64> {
        self.source.probe_length(&self.url)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.source.read_range(&self.url, buf, offset)
    }
}

/// HTTP failure classified for retry decisions
#[derive(Debug, thiserror::Error)]
enum HttpError {
    #[error("Rate limited")]
    RateLimited,

    #[error("Not found")]
    NotFound,

    #[error("Forbidden")]
    Forbidden,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0})")]
    Server(u16),

    #[error("Request timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl HttpError {
    fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => HttpError::Forbidden,
            404 => HttpError::NotFound,
            408 => HttpError::Timeout,
            429 => HttpError::RateLimited,
            code @ 500..=599 => HttpError::Server(code),
            code => HttpError::Protocol(format!("HTTP {}", code)),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            HttpError::RateLimited | HttpError::Timeout | HttpError::Network(_) | HttpError::Server(_)
        )
    }

    fn into_io(self) -> io::Error {
        let kind = match self {
            HttpError::NotFound => io::ErrorKind::NotFound,
            HttpError::Forbidden => io::ErrorKind::PermissionDenied,
            HttpError::Timeout => io::ErrorKind::TimedOut,
            HttpError::Network(_) => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            HttpError::Network(err.to_string())
        } else {
            HttpError::Protocol(err.to_string())
        }
    }
}
