//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, clock) into
//! the audio cache. Desktop apps typically enable the `desktop-shims` feature
//! (which depends on `bridge-desktop`); other hosts build a
//! [`CacheDependencies`] from their own bridges.
//!
//! [`AudioCacheService`] is the composition root: it owns one
//! [`CacheOrchestrator`], one [`PreloadScheduler`] and one [`StreamBridge`]
//! sharing the same tiers, and turns player events (song switch, playback
//! progress) into cache operations.

pub mod config;
pub mod error;

pub use config::ServiceConfig;
pub use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
pub use error::{CoreError, Result};

use std::sync::Arc;

use bridge_traits::{http::HttpClient, time::Clock};
use core_playback::{
    CacheOrchestrator, CacheStatistics, PreloadPriority, PreloadScheduler, PreloadStatistics,
    StreamBridge,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Aggregated handle to all bridge dependencies the cache requires.
#[derive(Clone)]
pub struct CacheDependencies {
    pub http_client: Arc<dyn HttpClient>,
    pub clock: Arc<dyn Clock>,
}

impl CacheDependencies {
    /// Construct a dependency bundle from explicit bridge handles.
    pub fn new(http_client: Arc<dyn HttpClient>, clock: Arc<dyn Clock>) -> Self {
        Self { http_client, clock }
    }

    /// `reqwest`-backed network access and the system clock.
    #[cfg(feature = "desktop-shims")]
    pub fn desktop() -> Result<Self> {
        let http_client = bridge_desktop::ReqwestHttpClient::new()?;
        Ok(Self::new(
            Arc::new(http_client),
            Arc::new(bridge_traits::time::SystemClock),
        ))
    }
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_temp_files: usize,
    pub evicted_tracks: usize,
}

/// Combined view of cache and scheduler counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatistics {
    pub cache: CacheStatistics,
    pub preload: PreloadStatistics,
}

struct ServiceInner {
    deps: CacheDependencies,
    config: ServiceConfig,
    orchestrator: Arc<CacheOrchestrator>,
    scheduler: Arc<PreloadScheduler>,
    bridge: Arc<StreamBridge>,
    now_playing: Mutex<Option<String>>,
    queue: Mutex<Vec<String>>,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct AudioCacheService {
    inner: Arc<ServiceInner>,
}

impl AudioCacheService {
    /// Open the cache tiers and start the scheduler and bridge on top.
    ///
    /// Expired staging files are removed on the way.
    pub async fn new(config: ServiceConfig, deps: CacheDependencies) -> Result<Self> {
        config.validate()?;

        let orchestrator = Arc::new(
            CacheOrchestrator::open(config.cache.clone(), Arc::clone(&deps.clock)).await?,
        );
        match orchestrator.clean_expired_temp_files().await {
            Ok(removed) if removed > 0 => info!(removed, "Removed expired staging files"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not clean expired staging files"),
        }

        let scheduler = Arc::new(PreloadScheduler::new(
            Arc::clone(&orchestrator),
            Arc::clone(&deps.http_client),
            Arc::clone(&deps.clock),
            config.preload.clone(),
        )?);
        let bridge = Arc::new(StreamBridge::new(
            Arc::clone(&orchestrator),
            Arc::clone(&deps.http_client),
            config.bridge.clone(),
        )?);

        info!("Audio cache service ready");
        Ok(Self {
            inner: Arc::new(ServiceInner {
                deps,
                config,
                orchestrator,
                scheduler,
                bridge,
                now_playing: Mutex::new(None),
                queue: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Access the bridge dependencies being used by the service.
    pub fn dependencies(&self) -> &CacheDependencies {
        &self.inner.deps
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn orchestrator(&self) -> Arc<CacheOrchestrator> {
        Arc::clone(&self.inner.orchestrator)
    }

    pub fn scheduler(&self) -> Arc<PreloadScheduler> {
        Arc::clone(&self.inner.scheduler)
    }

    pub fn bridge(&self) -> Arc<StreamBridge> {
        Arc::clone(&self.inner.bridge)
    }

    pub fn now_playing(&self) -> Option<String> {
        self.inner.now_playing.lock().clone()
    }

    /// Replace the play queue with `(track_id, original_url)` pairs.
    pub fn set_queue(&self, tracks: &[(String, String)]) {
        for (track_id, url) in tracks {
            self.inner.orchestrator.record_original_url(track_id, url);
        }
        let ids: Vec<String> = tracks.iter().map(|(id, _)| id.clone()).collect();
        *self.inner.queue.lock() = ids.clone();
        self.inner.scheduler.set_play_queue(ids);
    }

    /// Song switch. Finalizes the previous track, pins the new one and
    /// returns the stream URL the player should open.
    ///
    /// A failure to flush the previous track is logged and does not stop the
    /// switch; its segments stay in memory.
    pub async fn play(&self, track_id: &str, original_url: &str) -> Result<String> {
        let previous = self.now_playing();
        if let Some(previous) = previous.filter(|p| p != track_id) {
            match self.inner.bridge.finish_track(&previous).await {
                Ok(state) => debug!(track_id = %previous, %state, "Finished previous track"),
                Err(e) => warn!(track_id = %previous, error = %e, "Could not finish previous track"),
            }
        }

        let stream_url = self.inner.bridge.stream_url(track_id, original_url);
        if self.inner.orchestrator.has_complete_cache(track_id).await {
            if let Err(e) = self.inner.orchestrator.update_play_time(track_id).await {
                warn!(track_id, error = %e, "Could not record play");
            }
        }
        self.inner.scheduler.set_current_playing_song(track_id);
        *self.inner.now_playing.lock() = Some(track_id.to_string());
        info!(track_id, "Now playing");
        Ok(stream_url)
    }

    /// Playback progress of the current track, as a fraction.
    ///
    /// Past the configured threshold the next queued track is preloaded at
    /// high priority. Returns the track that was scheduled, if any.
    pub fn report_progress(&self, track_id: &str, fraction: f32) -> Option<String> {
        if fraction < self.inner.config.prefetch_threshold {
            return None;
        }
        if self.inner.now_playing.lock().as_deref() != Some(track_id) {
            return None;
        }

        let next = {
            let queue = self.inner.queue.lock();
            let position = queue.iter().position(|id| id == track_id)?;
            queue.get(position + 1).cloned()?
        };
        if self.inner.scheduler.is_preloading(&next) {
            return Some(next);
        }
        self.inner.scheduler.preload(&next, PreloadPriority::High);
        Some(next)
    }

    /// Drop expired staging files and bring the persistent tier within its
    /// budget.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let report = MaintenanceReport {
            expired_temp_files: self.inner.orchestrator.clean_expired_temp_files().await?,
            evicted_tracks: self.inner.orchestrator.enforce_disk_limit().await?,
        };
        info!(?report, "Maintenance complete");
        Ok(report)
    }

    /// Handle a low-memory warning from the host.
    pub fn handle_memory_warning(&self) -> usize {
        self.inner.orchestrator.handle_memory_pressure()
    }

    pub async fn statistics(&self) -> Result<ServiceStatistics> {
        Ok(ServiceStatistics {
            cache: self.inner.orchestrator.statistics().await?,
            preload: self.inner.scheduler.statistics(),
        })
    }

    /// Stop all preloads and flush the current track to disk.
    pub async fn shutdown(&self) -> Result<()> {
        let cancelled = self.inner.scheduler.cancel_all();
        let current = self.inner.now_playing.lock().take();
        if let Some(track_id) = current {
            self.inner.bridge.finish_track(&track_id).await?;
        }
        info!(cancelled, "Audio cache service stopped");
        Ok(())
    }
}

/// Convenience bootstrapper for desktop hosts.
///
/// ```no_run
/// # async fn example() -> core_service::Result<()> {
/// use core_service::{bootstrap_desktop, ServiceConfig};
///
/// let service = bootstrap_desktop(ServiceConfig::default()).await?;
/// let url = service.play("42", "https://cdn.example.com/42.mp3").await?;
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop(config: ServiceConfig) -> Result<AudioCacheService> {
    let deps = CacheDependencies::desktop()
        .map_err(|err| CoreError::InitializationFailed(err.to_string()))?;
    AudioCacheService::new(config, deps).await
}
