//! Integration tests for the preload scheduler.

mod common;

use async_trait::async_trait;
use bridge_traits::error::BridgeError;
use bridge_traits::http::{ByteRange, HttpClient, HttpRequest, HttpStream};
use bridge_traits::time::ManualClock;
use common::{audio_bytes, open_orchestrator, store_track, test_config, FakeServer};
use core_playback::cache::{CacheOrchestrator, CacheState};
use core_playback::preload::{
    CompletionCallback, PreloadPriority, PreloadScheduler, ProgressCallback,
};
use core_playback::{PlaybackError, PreloadConfig};
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const SEGMENT: u64 = 4;

struct Harness {
    _dir: TempDir,
    orchestrator: Arc<CacheOrchestrator>,
    server: Arc<FakeServer>,
    scheduler: PreloadScheduler,
    clock: Arc<ManualClock>,
}

async fn harness(config: PreloadConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let orchestrator = open_orchestrator(test_config(dir.path(), SEGMENT)).await;
    let server = FakeServer::new();
    let clock = Arc::new(ManualClock::new(5_000));
    let scheduler =
        PreloadScheduler::new(orchestrator.clone(), server.clone(), clock.clone(), config)
            .unwrap();
    Harness {
        _dir: dir,
        orchestrator,
        server,
        scheduler,
        clock,
    }
}

impl Harness {
    /// Register a remote body of `len` bytes for `track_id`.
    fn track(&self, track_id: &str, len: usize) -> String {
        let url = format!("https://cdn.example.com/{}.mp3", track_id);
        self.server.serve(&url, audio_bytes(len));
        self.orchestrator.record_original_url(track_id, &url);
        url
    }
}

type Outcome = (String, bool, Option<String>);

fn reporter(tx: &mpsc::UnboundedSender<Outcome>) -> CompletionCallback {
    let tx = tx.clone();
    Box::new(move |track_id: &str, success: bool, error: Option<&PlaybackError>| {
        let _ = tx.send((track_id.to_string(), success, error.map(|e| e.to_string())));
    })
}

async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("preload did not finish in time")
        .expect("channel closed")
}

#[tokio::test]
async fn test_execution_follows_priority_then_fifo() {
    let h = harness(PreloadConfig::default()).await;
    let urls: Vec<String> = ["T1", "T2", "T3", "T4"]
        .iter()
        .map(|id| h.track(id, 8))
        .collect();
    let (tx, mut rx) = mpsc::unbounded_channel();

    h.scheduler.pause_all();
    let priorities = [
        PreloadPriority::Low,
        PreloadPriority::High,
        PreloadPriority::Normal,
        PreloadPriority::High,
    ];
    for (id, priority) in ["T1", "T2", "T3", "T4"].iter().zip(priorities) {
        h.scheduler
            .preload_with_callbacks(id, priority, None, Some(reporter(&tx)));
    }
    assert_eq!(h.scheduler.queued_tracks(), vec!["T2", "T4", "T3", "T1"]);
    assert_eq!(h.scheduler.pending_task_count(), 4);

    h.scheduler.resume_all();
    let mut finished = Vec::new();
    for _ in 0..4 {
        let (track, success, _) = next_outcome(&mut rx).await;
        assert!(success);
        finished.push(track);
    }

    assert_eq!(finished, vec!["T2", "T4", "T3", "T1"]);
    assert_eq!(
        h.server.requested_urls(),
        vec![
            urls[1].clone(),
            urls[3].clone(),
            urls[2].clone(),
            urls[0].clone()
        ]
    );
    assert_eq!(h.scheduler.statistics().completed_tasks, 4);
}

#[tokio::test]
async fn test_scenario_d_rerequest_updates_priority_in_place() {
    let h = harness(PreloadConfig::default()).await;
    h.track("T2", 8);

    h.scheduler.pause_all();
    h.scheduler.preload("T2", PreloadPriority::Normal);
    let created_at = h.scheduler.task("T2").unwrap().created_at;

    h.clock.advance_millis(60_000);
    h.scheduler.preload("T2", PreloadPriority::High);

    assert_eq!(h.scheduler.total_task_count(), 1);
    let task = h.scheduler.task("T2").unwrap();
    assert_eq!(task.priority, PreloadPriority::High);
    assert_eq!(task.created_at, created_at);
    assert!(!task.executing);
}

#[tokio::test]
async fn test_cancel_reports_once_and_stops_writes() {
    let h = harness(PreloadConfig::default()).await;
    h.track("T1", 40);
    h.server.set_delay(Duration::from_millis(150));

    let calls = Arc::new(AtomicUsize::new(0));
    let seen_cancel = Arc::new(AtomicUsize::new(0));
    let on_complete: CompletionCallback = {
        let calls = calls.clone();
        let seen_cancel = seen_cancel.clone();
        Box::new(move |_track: &str, success: bool, error: Option<&PlaybackError>| {
            calls.fetch_add(1, Ordering::SeqCst);
            if !success && error.is_some_and(PlaybackError::is_cancellation) {
                seen_cancel.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    h.scheduler
        .preload_with_callbacks("T1", PreloadPriority::Normal, None, Some(on_complete));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.scheduler.is_preloading("T1"));

    assert!(h.scheduler.cancel("T1"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(seen_cancel.load(Ordering::SeqCst), 1);
    assert!(!h.scheduler.cancel("T1"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!h.orchestrator.has_memory_cache("T1"));
    assert!(!h.scheduler.is_preloading("T1"));
    assert_eq!(h.scheduler.statistics().cancelled_tasks, 1);
}

#[tokio::test]
async fn test_full_preload_fills_memory_tier() {
    let h = harness(PreloadConfig::default()).await;
    h.track("T1", 18);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let progress_calls = Arc::new(AtomicUsize::new(0));
    let on_progress: ProgressCallback = {
        let progress_calls = progress_calls.clone();
        Arc::new(move |_: &str, fraction: f32, _: u32, _: Option<u32>| {
            assert!((0.0..=1.0).contains(&fraction));
            progress_calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    h.scheduler.preload_with_callbacks(
        "T1",
        PreloadPriority::High,
        Some(on_progress),
        Some(reporter(&tx)),
    );

    let (_, success, _) = next_outcome(&mut rx).await;
    assert!(success);
    assert_eq!(h.orchestrator.segment_count("T1"), 5);
    assert_eq!(h.orchestrator.get_segment("T1", 4).unwrap().len(), 2);
    assert_eq!(h.orchestrator.content_length("T1").await, Some(18));
    assert_eq!(h.scheduler.progress("T1"), 1.0);
    assert!(progress_calls.load(Ordering::SeqCst) >= 5);

    let state = h
        .orchestrator
        .save_and_finalize_song("T1", Some(18))
        .await
        .unwrap();
    assert_eq!(state, CacheState::Complete);
}

#[tokio::test]
async fn test_segment_limit_stops_early() {
    let h = harness(PreloadConfig::just_enough(2)).await;
    h.track("T1", 40);
    let (tx, mut rx) = mpsc::unbounded_channel();

    h.scheduler
        .preload_with_callbacks("T1", PreloadPriority::Normal, None, Some(reporter(&tx)));
    let (_, success, _) = next_outcome(&mut rx).await;

    assert!(success);
    assert_eq!(h.orchestrator.segment_count("T1"), 2);
    assert_eq!(
        h.server.requested_ranges(),
        vec![Some(ByteRange {
            start: 0,
            end: Some(7)
        })]
    );
    assert_eq!(h.scheduler.progress("T1"), 1.0);
}

#[tokio::test]
async fn test_preload_resumes_after_resident_segments() {
    let h = harness(PreloadConfig::default()).await;
    h.track("T1", 16);
    store_track(&h.orchestrator, "T1", &audio_bytes(8));
    let (tx, mut rx) = mpsc::unbounded_channel();

    h.scheduler
        .preload_with_callbacks("T1", PreloadPriority::Normal, None, Some(reporter(&tx)));
    let (_, success, _) = next_outcome(&mut rx).await;

    assert!(success);
    assert_eq!(h.orchestrator.segment_count("T1"), 4);
    assert_eq!(
        h.server.requested_ranges(),
        vec![Some(ByteRange::starting_at(8))]
    );
}

#[tokio::test]
async fn test_complete_track_finishes_without_fetching() {
    let h = harness(PreloadConfig::default()).await;
    h.track("T1", 8);
    store_track(&h.orchestrator, "T1", &audio_bytes(8));
    h.orchestrator
        .save_and_finalize_song("T1", Some(8))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    h.scheduler
        .preload_with_callbacks("T1", PreloadPriority::Normal, None, Some(reporter(&tx)));
    let (_, success, error) = next_outcome(&mut rx).await;

    assert!(success);
    assert!(error.is_none());
    assert_eq!(h.server.request_count(), 0);
}

#[tokio::test]
async fn test_missing_source_url_fails() {
    let h = harness(PreloadConfig::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    h.scheduler
        .preload_with_callbacks("ghost", PreloadPriority::Normal, None, Some(reporter(&tx)));
    let (track, success, error) = next_outcome(&mut rx).await;

    assert_eq!(track, "ghost");
    assert!(!success);
    assert!(error.unwrap().contains("ghost"));
    assert_eq!(h.scheduler.statistics().failed_tasks, 1);
}

#[tokio::test]
async fn test_song_switch_promotes_successor_and_drops_stale() {
    let h = harness(PreloadConfig::default()).await;
    for id in ["A", "B", "C", "D"] {
        h.track(id, 8);
    }
    h.scheduler
        .set_play_queue(vec!["A".into(), "B".into(), "C".into(), "D".into()]);

    h.scheduler.pause_all();
    h.scheduler.preload("A", PreloadPriority::Low);
    h.scheduler.preload("D", PreloadPriority::Normal);

    h.scheduler.set_current_playing_song("B");

    assert_eq!(h.orchestrator.current_priority_song().as_deref(), Some("B"));
    assert!(!h.scheduler.is_preloading("A"));
    assert_eq!(h.scheduler.queued_tracks(), vec!["C", "D"]);
    assert_eq!(
        h.scheduler.task("C").unwrap().priority,
        PreloadPriority::High
    );
}

#[tokio::test]
async fn test_pause_suspends_without_completion() {
    let h = harness(PreloadConfig::default()).await;
    h.track("T1", 8);
    h.server.set_delay(Duration::from_millis(100));
    let (tx, mut rx) = mpsc::unbounded_channel();

    h.scheduler
        .preload_with_callbacks("T1", PreloadPriority::Normal, None, Some(reporter(&tx)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.scheduler.current_preloading_track().as_deref(), Some("T1"));

    h.scheduler.pause_all();
    assert!(h.scheduler.is_paused());
    assert!(!h.scheduler.task("T1").unwrap().executing);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    h.scheduler.resume_all();
    let (_, success, _) = next_outcome(&mut rx).await;
    assert!(success);
    assert_eq!(h.orchestrator.segment_count("T1"), 2);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let h = harness(PreloadConfig::default().with_max_concurrent_tasks(2)).await;
    h.server.set_delay(Duration::from_millis(100));
    for id in ["A", "B", "C"] {
        h.track(id, 4);
    }
    let (tx, mut rx) = mpsc::unbounded_channel();

    h.scheduler.preload_with_callbacks("A", PreloadPriority::Normal, None, Some(reporter(&tx)));
    h.scheduler.preload_with_callbacks("B", PreloadPriority::Normal, None, Some(reporter(&tx)));
    h.scheduler.preload_with_callbacks("C", PreloadPriority::Normal, None, Some(reporter(&tx)));

    let stats = h.scheduler.statistics();
    assert_eq!(stats.running_tasks, 2);
    assert_eq!(stats.pending_tasks, 1);
    assert_eq!(h.scheduler.queued_tracks(), vec!["C"]);

    for _ in 0..3 {
        assert!(next_outcome(&mut rx).await.1);
    }
    assert_eq!(h.scheduler.total_task_count(), 0);
}

mock! {
    Http {}

    #[async_trait]
    impl HttpClient for Http {
        async fn fetch(&self, request: HttpRequest) -> bridge_traits::error::Result<HttpStream>;
    }
}

#[tokio::test]
async fn test_network_failure_is_reported_without_retry() {
    let dir = TempDir::new().unwrap();
    let orchestrator = open_orchestrator(test_config(dir.path(), SEGMENT)).await;
    orchestrator.record_original_url("T1", "https://cdn.example.com/T1.mp3");

    let mut http = MockHttp::new();
    http.expect_fetch().times(1).returning(|_| {
        Err(BridgeError::HttpStatus {
            status: 503,
            message: "unavailable".to_string(),
        })
    });

    let scheduler = PreloadScheduler::new(
        orchestrator.clone(),
        Arc::new(http),
        Arc::new(ManualClock::new(0)),
        PreloadConfig::default(),
    )
    .unwrap();

    let failures = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_complete: CompletionCallback = {
        let failures = failures.clone();
        let tx = tx.clone();
        Box::new(move |track: &str, success: bool, error: Option<&PlaybackError>| {
            if error.is_some_and(PlaybackError::is_network_error) {
                failures.fetch_add(1, Ordering::SeqCst);
            }
            let _ = tx.send((track.to_string(), success, None));
        })
    };
    scheduler.preload_with_callbacks("T1", PreloadPriority::High, None, Some(on_complete));

    let (_, success, _) = next_outcome(&mut rx).await;
    assert!(!success);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(!orchestrator.has_memory_cache("T1"));
    assert_eq!(scheduler.statistics().failed_tasks, 1);
}
