//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result};
use bridge_traits::http::{ByteRange, HttpClient, HttpRequest, HttpStream};
use bridge_traits::time::ManualClock;
use bytes::Bytes;
use core_playback::cache::{CacheConfig, CacheOrchestrator};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// In-memory HTTP origin honouring `Range` requests.
pub struct FakeServer {
    bodies: Mutex<HashMap<String, Bytes>>,
    requests: Mutex<Vec<(String, Option<ByteRange>)>>,
    delay: Mutex<Option<Duration>>,
    chunk_size: usize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Self::with_chunk_size(3)
    }

    /// Bodies are streamed in chunks of `chunk_size` bytes.
    pub fn with_chunk_size(chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            chunk_size,
        })
    }

    pub fn serve(&self, url: &str, body: Bytes) {
        self.bodies.lock().insert(url.to_string(), body);
    }

    /// Delay before response headers are returned.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(url, _)| url.clone()).collect()
    }

    pub fn requested_ranges(&self) -> Vec<Option<ByteRange>> {
        self.requests.lock().iter().map(|(_, range)| *range).collect()
    }
}

#[async_trait]
impl HttpClient for FakeServer {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpStream> {
        self.requests
            .lock()
            .push((request.url.clone(), request.range));

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let body = self
            .bodies
            .lock()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| BridgeError::HttpStatus {
                status: 404,
                message: "not found".to_string(),
            })?;
        let total = body.len() as u64;

        let mut headers = HashMap::new();
        let (status, data) = match request.range {
            Some(range) => {
                if range.start >= total {
                    return Err(BridgeError::HttpStatus {
                        status: 416,
                        message: "range not satisfiable".to_string(),
                    });
                }
                let end = range.end.map_or(total - 1, |end| end.min(total - 1));
                headers.insert(
                    "Content-Range".to_string(),
                    format!("bytes {}-{}/{}", range.start, end, total),
                );
                (206, body.slice(range.start as usize..=end as usize))
            }
            None => (200, body),
        };
        headers.insert("Content-Length".to_string(), data.len().to_string());

        let chunks: Vec<Result<Bytes>> = data
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(HttpStream::new(status, headers, stream::iter(chunks).boxed()))
    }
}

/// Deterministic audio-like payload.
pub fn audio_bytes(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

pub fn test_config(root: &Path, segment_size: u64) -> CacheConfig {
    CacheConfig::new(root)
        .with_segment_size(segment_size)
        .with_memory_limit(segment_size * 1024)
}

pub async fn open_orchestrator(config: CacheConfig) -> Arc<CacheOrchestrator> {
    open_with_clock(config, Arc::new(ManualClock::new(1_700_000_000_000))).await
}

pub async fn open_with_clock(
    config: CacheConfig,
    clock: Arc<ManualClock>,
) -> Arc<CacheOrchestrator> {
    Arc::new(
        CacheOrchestrator::open(config, clock)
            .await
            .expect("open orchestrator"),
    )
}

/// Store `data` as consecutive segments of `segment_size` bytes.
pub fn store_track(orchestrator: &CacheOrchestrator, track_id: &str, data: &Bytes) {
    let segment_size = orchestrator.segment_size() as usize;
    for (index, chunk) in data.chunks(segment_size).enumerate() {
        orchestrator.store_segment(track_id, index as u32, Bytes::copy_from_slice(chunk));
    }
}
