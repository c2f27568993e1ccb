//! # Stream Bridge
//!
//! Serves a player's byte-range reads from the cache tiers, fetching missing
//! segments from the network on demand.
//!
//! The player is handed an opaque stream URL (`audiocache://stream/{token}`)
//! instead of the remote URL. Every read against it is answered as:
//!
//! 1. the complete or staging file, when it covers the whole range
//! 2. otherwise the covering segments, fetched into the memory tier first
//!    where missing (one range request per contiguous run of segments)
//!
//! Fetched segments are claimed in the orchestrator's in-flight registry,
//! shared with the preload scheduler; a segment someone else is fetching is
//! waited on instead of being requested again.

use crate::cache::inflight::{self, Claim, FetchStatus, SegmentClaims};
use crate::cache::{files, CacheOrchestrator, CacheState};
use crate::config::BridgeConfig;
use crate::error::{PlaybackError, Result};
use bridge_traits::http::{ensure_success, ByteRange, HttpClient, HttpRequest, HttpStream};
use bytes::{Bytes, BytesMut};
use core_async::time::timeout;
use core_runtime::logging::redact_url;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Where a stream URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub track_id: String,
    pub original_url: String,
}

/// Answer to a player's content information request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub content_length: u64,
    pub extension: String,
    /// MIME type derived from the extension.
    pub content_type: String,
    pub byte_range_access: bool,
}

/// Read-side adapter between a player and the cache.
pub struct StreamBridge {
    orchestrator: Arc<CacheOrchestrator>,
    http: Arc<dyn HttpClient>,
    config: BridgeConfig,
    /// Stream token to source.
    registry: Mutex<HashMap<String, StreamSource>>,
}

impl StreamBridge {
    pub fn new(
        orchestrator: Arc<CacheOrchestrator>,
        http: Arc<dyn HttpClient>,
        config: BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            orchestrator,
            http,
            config,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Stream URL for a track. The same pair always yields the same URL.
    ///
    /// Also records `original_url` as the track's source.
    pub fn stream_url(&self, track_id: &str, original_url: &str) -> String {
        let token = stream_token(track_id, original_url);
        self.registry.lock().insert(
            token.clone(),
            StreamSource {
                track_id: track_id.to_string(),
                original_url: original_url.to_string(),
            },
        );
        self.orchestrator.record_original_url(track_id, original_url);
        format!("{}{}", self.prefix(), token)
    }

    /// Reverse of [`stream_url`](Self::stream_url).
    pub fn resolve(&self, stream_url: &str) -> Option<StreamSource> {
        let token = stream_url.strip_prefix(&self.prefix())?;
        self.registry.lock().get(token).cloned()
    }

    /// Total length, extension and MIME type of a stream.
    ///
    /// Probes the server with a one-byte range request when the length is
    /// not known yet.
    #[instrument(skip(self))]
    pub async fn content_info(&self, stream_url: &str) -> Result<ContentInfo> {
        let source = self.source(stream_url)?;
        let content_length = self.total_length(&source).await?;
        let extension = self.orchestrator.extension(&source.track_id).await;
        Ok(ContentInfo {
            content_length,
            content_type: content_type(&extension).to_string(),
            extension,
            byte_range_access: true,
        })
    }

    /// Read `range` of a stream.
    ///
    /// Ranges reaching past the end are clamped; a range starting at or after
    /// the end yields an empty buffer.
    #[instrument(skip(self, range), fields(range = %range))]
    pub async fn read(&self, stream_url: &str, range: ByteRange) -> Result<Bytes> {
        if range.end.is_some_and(|end| end < range.start) {
            return Err(PlaybackError::InvalidRange(format!(
                "end before start: {}",
                range
            )));
        }
        let source = self.source(stream_url)?;
        let track_id = source.track_id.as_str();

        let total = self.total_length(&source).await?;
        if range.start >= total {
            return Ok(Bytes::new());
        }
        let start = range.start;
        let end = range.end.map_or(total - 1, |end| end.min(total - 1));
        let len = end - start + 1;

        if let Some(bytes) = self.orchestrator.read_range(track_id, start, len).await? {
            return Ok(bytes);
        }

        let segment_size = self.orchestrator.segment_size();
        let first = segment_index(start, segment_size);
        let last = segment_index(end, segment_size);

        for attempt in 1..=self.config.max_read_attempts {
            self.ensure_segments(&source, first, last, total).await?;
            if let Some(bytes) = self.assemble(track_id, start, end, total).await? {
                return Ok(bytes);
            }
            debug!(track_id, attempt, "Segments evicted before assembly, retrying");
        }

        Err(PlaybackError::Internal(format!(
            "segments {}..={} of {} were evicted {} times in a row",
            first, last, track_id, self.config.max_read_attempts
        )))
    }

    /// Song switch: flush the track's segments to staging and promote it when
    /// the declared length is known and matched.
    pub async fn finish_track(&self, track_id: &str) -> Result<CacheState> {
        let expected = self.orchestrator.content_length(track_id).await;
        self.orchestrator
            .save_and_finalize_song(track_id, expected)
            .await
    }

    /// Length the server declared for a track, or that of its complete file.
    pub async fn known_content_length(&self, track_id: &str) -> Option<u64> {
        self.orchestrator.content_length(track_id).await
    }

    /// Number of segments currently being fetched.
    pub fn in_flight_count(&self) -> usize {
        self.orchestrator.in_flight().len()
    }

    fn prefix(&self) -> String {
        format!("{}://stream/", self.config.url_scheme)
    }

    fn source(&self, stream_url: &str) -> Result<StreamSource> {
        self.resolve(stream_url)
            .ok_or_else(|| PlaybackError::UnknownStream(stream_url.to_string()))
    }

    async fn total_length(&self, source: &StreamSource) -> Result<u64> {
        if let Some(total) = self.orchestrator.content_length(&source.track_id).await {
            return Ok(total);
        }

        let response = self.fetch(source, ByteRange::with_len(0, 1)).await?;
        let total = response.total_length().ok_or_else(|| {
            PlaybackError::NetworkFailure(format!(
                "server did not report a length for {}",
                source.track_id
            ))
        })?;
        self.orchestrator
            .record_content_length(&source.track_id, total);
        Ok(total)
    }

    async fn fetch(&self, source: &StreamSource, range: ByteRange) -> Result<HttpStream> {
        debug!(
            track_id = %source.track_id,
            url = %redact_url(&source.original_url),
            %range,
            "Fetching range"
        );
        let request = HttpRequest::get(source.original_url.clone()).range(range);
        let response = timeout(self.config.fetch_timeout, self.http.fetch(request))
            .await
            .map_err(|_| {
                PlaybackError::NetworkFailure(format!(
                    "range request timed out after {:?}",
                    self.config.fetch_timeout
                ))
            })??;
        Ok(ensure_success(response)?)
    }

    /// Make segments `first..=last` resident, fetching or waiting as needed.
    async fn ensure_segments(
        &self,
        source: &StreamSource,
        first: u32,
        last: u32,
        total: u64,
    ) -> Result<()> {
        let track_id = source.track_id.as_str();
        let segment_size = self.orchestrator.segment_size();
        let staged_segments = segment_index(
            self.orchestrator.staged_size(track_id).await?,
            segment_size,
        );

        let mut waits = Vec::new();
        let mut claims = self.orchestrator.in_flight().claims(track_id);
        for index in first..=last {
            if index < staged_segments {
                continue;
            }
            match claims.try_claim(index) {
                Claim::Busy(receiver) => waits.push(receiver),
                Claim::Owned if self.orchestrator.has_segment(track_id, index) => {
                    claims.complete(index, FetchStatus::Ready);
                }
                Claim::Owned => {}
            }
        }

        for (run_start, run_end) in contiguous_runs(claims.indices()) {
            self.fetch_run(source, run_start, run_end, total, &mut claims)
                .await?;
        }

        for receiver in waits {
            // A failed fetch by someone else leaves a gap; assembly notices
            // it and retries.
            inflight::settled(receiver).await;
        }
        Ok(())
    }

    /// Fetch segments `first..=last` with one range request.
    async fn fetch_run(
        &self,
        source: &StreamSource,
        first: u32,
        last: u32,
        total: u64,
        claims: &mut SegmentClaims<'_>,
    ) -> Result<()> {
        let track_id = source.track_id.as_str();
        let segment_size = self.orchestrator.segment_size();
        let start = u64::from(first) * segment_size;
        let end = ((u64::from(last) + 1) * segment_size).min(total) - 1;

        let response = self
            .fetch(source, ByteRange { start, end: Some(end) })
            .await?;
        if let Some(declared) = response.total_length() {
            if declared != total {
                warn!(track_id, declared, known = total, "Server length changed");
                self.orchestrator.record_content_length(track_id, declared);
            }
        }

        let mut skip = if response.is_partial() { 0 } else { start };
        let mut body = response.body;
        let mut buffer = BytesMut::new();
        let mut index = first;

        while let Some(chunk) = body.next().await {
            let mut chunk = chunk?;
            if skip > 0 {
                let dropped = skip.min(chunk.len() as u64);
                chunk = chunk.slice(dropped as usize..);
                skip -= dropped;
            }
            buffer.extend_from_slice(&chunk);

            while index <= last && buffer.len() as u64 >= segment_size {
                let data = buffer.split_to(segment_size as usize).freeze();
                self.orchestrator.store_segment(track_id, index, data);
                claims.complete(index, FetchStatus::Ready);
                index += 1;
            }
            if index > last {
                return Ok(());
            }
        }

        let offset = u64::from(index) * segment_size;
        if !buffer.is_empty() && offset + buffer.len() as u64 == total {
            self.orchestrator
                .store_segment(track_id, index, buffer.freeze());
            claims.complete(index, FetchStatus::Ready);
            return Ok(());
        }

        Err(PlaybackError::NetworkFailure(format!(
            "response for {} ended at byte {} before segment {} was complete",
            track_id,
            offset + buffer.len() as u64,
            index
        )))
    }

    /// Copy `start..=end` out of the resident segments.
    ///
    /// `None` if a segment went missing in the meantime.
    async fn assemble(
        &self,
        track_id: &str,
        start: u64,
        end: u64,
        total: u64,
    ) -> Result<Option<Bytes>> {
        let segment_size = self.orchestrator.segment_size();
        let mut out = BytesMut::with_capacity((end - start + 1) as usize);

        for index in segment_index(start, segment_size)..=segment_index(end, segment_size) {
            let segment_start = u64::from(index) * segment_size;
            let Some(data) = self.segment_bytes(track_id, index, total).await? else {
                return Ok(None);
            };

            let from = start.saturating_sub(segment_start) as usize;
            let to = ((end + 1 - segment_start).min(segment_size)) as usize;
            if to > data.len() {
                return Err(PlaybackError::IncompleteData {
                    track_id: track_id.to_string(),
                    expected: end + 1,
                    actual: segment_start + data.len() as u64,
                });
            }
            out.extend_from_slice(&data[from..to]);
        }
        Ok(Some(out.freeze()))
    }

    /// One segment from memory, else from the staging file.
    async fn segment_bytes(&self, track_id: &str, index: u32, total: u64) -> Result<Option<Bytes>> {
        if let Some(data) = self.orchestrator.get_segment(track_id, index) {
            return Ok(Some(data));
        }
        let segment_size = self.orchestrator.segment_size();
        let offset = u64::from(index) * segment_size;
        let len = segment_size.min(total.saturating_sub(offset));
        if len == 0 {
            return Ok(None);
        }
        self.orchestrator.read_range(track_id, offset, len).await
    }
}

fn segment_index(offset: u64, segment_size: u64) -> u32 {
    u32::try_from(offset / segment_size).unwrap_or(u32::MAX)
}

fn stream_token(track_id: &str, original_url: &str) -> String {
    let mut digest = files::sha256_bytes(format!("{}\0{}", track_id, original_url).as_bytes());
    digest.truncate(32);
    digest
}

/// Group sorted indices into inclusive runs of consecutive values.
fn contiguous_runs(indices: Vec<u32>) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for index in indices {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == index => *end = index,
            _ => runs.push((index, index)),
        }
    }
    runs
}

fn content_type(extension: &str) -> &'static str {
    match extension {
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_runs() {
        assert_eq!(contiguous_runs(vec![]), vec![]);
        assert_eq!(contiguous_runs(vec![3]), vec![(3, 3)]);
        assert_eq!(
            contiguous_runs(vec![0, 1, 2, 5, 6, 9]),
            vec![(0, 2), (5, 6), (9, 9)]
        );
    }

    #[test]
    fn test_stream_token_is_stable() {
        let a = stream_token("T1", "https://cdn.example.com/a.mp3");
        assert_eq!(a, stream_token("T1", "https://cdn.example.com/a.mp3"));
        assert_ne!(a, stream_token("T2", "https://cdn.example.com/a.mp3"));
        assert_ne!(a, stream_token("T1", "https://cdn.example.com/b.mp3"));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_segment_index() {
        assert_eq!(segment_index(0, 4), 0);
        assert_eq!(segment_index(3, 4), 0);
        assert_eq!(segment_index(4, 4), 1);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("mp3"), "audio/mpeg");
        assert_eq!(content_type("flac"), "audio/flac");
        assert_eq!(content_type("xyz"), "application/octet-stream");
    }
}
