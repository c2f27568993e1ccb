//! HTTP Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpStream, RetryPolicy},
};
use core_async::time::sleep;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Reqwest-based HTTP client implementation
///
/// Provides:
/// - Connection pooling via reqwest
/// - Retry with exponential backoff on connect failures, 5xx and 429
/// - `Range` requests with the body exposed as a chunk stream
pub struct ReqwestHttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl ReqwestHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a new HTTP client with a custom connect timeout.
    ///
    /// No overall timeout is set on the client: range bodies are streamed for
    /// as long as playback needs them. Per-request deadlines come from
    /// [`HttpRequest::timeout`].
    pub fn with_connect_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(10)
            .user_agent("audio-cache/0.1.0")
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client))
    }

    /// Create a new HTTP client from a preconfigured reqwest client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            policy: RetryPolicy::default(),
        }
    }

    /// Override the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }

    fn build_request(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(Self::convert_method(request.method), &request.url);

        for (key, value) in &request.headers {
            req = req.header(key, value);
        }

        if let Some(range) = request.range {
            req = req.header(reqwest::header::RANGE, range.header_value());
        }

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        req
    }

    fn classify(error: reqwest::Error) -> BridgeError {
        if error.is_timeout() {
            BridgeError::Timeout(error.to_string())
        } else if error.is_connect() {
            BridgeError::OperationFailed(format!("Connection failed: {}", error))
        } else {
            BridgeError::OperationFailed(error.to_string())
        }
    }

    fn into_stream(response: reqwest::Response) -> HttpStream {
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let body = response.bytes_stream().map_err(Self::classify).boxed();
        HttpStream::new(status, headers, body)
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpStream> {
        let mut attempt = 0;
        let mut last_error = None;

        while attempt < self.policy.max_attempts {
            attempt += 1;
            debug!(
                attempt,
                max_attempts = self.policy.max_attempts,
                url = %request.url,
                range = ?request.range,
                "Executing HTTP request"
            );

            match self.build_request(&request).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status >= 500 || status == 429 {
                        warn!(status, attempt, "HTTP request failed with retryable status");
                        last_error = Some(BridgeError::HttpStatus {
                            status,
                            message: format!("retryable status from {}", request.url),
                        });
                    } else if !response.status().is_success() {
                        return Err(BridgeError::HttpStatus {
                            status,
                            message: format!("request to {} rejected", request.url),
                        });
                    } else {
                        return Ok(Self::into_stream(response));
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "HTTP request failed");
                    let classified = Self::classify(e);
                    let retryable = matches!(
                        classified,
                        BridgeError::Timeout(_) | BridgeError::OperationFailed(_)
                    );
                    last_error = Some(classified);
                    if !retryable {
                        break;
                    }
                }
            }

            if attempt < self.policy.max_attempts {
                let delay = self.policy.delay_for(attempt);
                debug!(delay_ms = delay.as_millis() as u64, "Retrying after delay");
                sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BridgeError::OperationFailed("All retry attempts exhausted".to_string())
        }))
    }

    async fn is_connected(&self) -> bool {
        self.client
            .head("https://www.google.com")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}
