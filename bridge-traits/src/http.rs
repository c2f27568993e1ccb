//! HTTP Client Abstraction
//!
//! The cache never performs network I/O itself. Range downloads are delegated
//! to a host-provided [`HttpClient`], which answers with a byte stream plus the
//! total length the server declared for the resource.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// HTTP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
}

/// Byte range with HTTP semantics: `end` is inclusive, `None` means "to EOF".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Open-ended range starting at `start`.
    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Range covering `len` bytes from `start`. `len` must be non-zero.
    pub fn with_len(start: u64, len: u64) -> Self {
        Self {
            start,
            end: Some(start + len.saturating_sub(1)),
        }
    }

    /// Number of bytes covered, if bounded.
    pub fn length(&self) -> Option<u64> {
        self.end.map(|end| end + 1 - self.start)
    }

    /// Value for the `Range` request header.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// HTTP request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub range: Option<ByteRange>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            range: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// Stream of body chunks as they arrive from the network.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Streaming HTTP response
pub struct HttpStream {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub body: ByteStream,
}

impl HttpStream {
    pub fn new(status: u16, headers: HashMap<String, String>, body: ByteStream) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Check if response status is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `206 Partial Content`
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Length of this response body, from `Content-Length`.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Total size of the underlying resource.
    ///
    /// Taken from the `/total` part of `Content-Range` on partial responses
    /// and from `Content-Length` on full responses.
    pub fn total_length(&self) -> Option<u64> {
        if let Some(range) = self.header("content-range") {
            return parse_content_range_total(range);
        }
        if self.status == 200 {
            return self.content_length();
        }
        None
    }

    /// Drain the whole body into memory.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    let total = total.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

/// Retry policy configuration
///
/// Retrying belongs to the client implementation, never to the cache.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Async HTTP client trait
///
/// The network collaborator for the cache: given a source URL and an optional
/// byte range, produce a stream of body bytes along with the declared total
/// content length.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{ByteRange, HttpClient, HttpRequest};
///
/// async fn head_of_track(client: &dyn HttpClient, url: &str) -> Result<Bytes> {
///     let request = HttpRequest::get(url).range(ByteRange::with_len(0, 512 * 1024));
///     client.fetch(request).await?.collect().await
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Start a request and return once headers are available.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails, the request times out or the
    /// server answers with a non-success status.
    async fn fetch(&self, request: HttpRequest) -> Result<HttpStream>;

    /// Check network connectivity
    async fn is_connected(&self) -> bool {
        true
    }
}

/// Turn a non-2xx response into a [`BridgeError::HttpStatus`].
pub fn ensure_success(response: HttpStream) -> Result<HttpStream> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(BridgeError::HttpStatus {
            status: response.status,
            message: format!("unexpected status {}", response.status),
        })
    }
}
