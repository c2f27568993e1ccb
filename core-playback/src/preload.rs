//! # Preload Scheduler
//!
//! Background fetches that fill the memory tier ahead of playback.
//!
//! ## Overview
//!
//! - Tasks are ordered by priority (high first), then creation time, then a
//!   monotonic sequence number, so equal priorities run first-in first-out
//! - At most `max_concurrent_tasks` run at once; a freed slot starts the best
//!   pending task
//! - Re-requesting a queued or running track changes its priority in place
//! - Completion callbacks fire exactly once per task: on success, failure or
//!   cancellation
//! - Cancelling closes a write gate before returning, so a cancelled fetch
//!   never writes another segment
//! - Segments are claimed in the orchestrator's in-flight registry, so a
//!   segment the player is already fetching is waited on, not fetched twice
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_playback::preload::{PreloadPriority, PreloadScheduler};
//!
//! scheduler.set_play_queue(vec!["T1".into(), "T2".into(), "T3".into()]);
//! scheduler.set_current_playing_song("T1"); // T2 becomes High priority
//! scheduler.preload("T3", PreloadPriority::Low);
//! ```

use crate::cache::inflight::{self, Claim, FetchStatus, SegmentClaims};
use crate::cache::CacheOrchestrator;
use crate::config::PreloadConfig;
use crate::error::{PlaybackError, Result};
use bridge_traits::http::{ensure_success, ByteRange, HttpClient, HttpRequest};
use bridge_traits::time::Clock;
use bytes::{Bytes, BytesMut};
use core_async::sync::CancellationToken;
use core_async::time::timeout;
use core_runtime::logging::redact_url;
use futures::future::{select, Either};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Preload priority band.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PreloadPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// `(track_id, fraction, loaded_segments, total_segments)`
pub type ProgressCallback = Arc<dyn Fn(&str, f32, u32, Option<u32>) + Send + Sync>;

/// `(track_id, success, error)`, invoked exactly once per task.
pub type CompletionCallback = Box<dyn FnOnce(&str, bool, Option<&PlaybackError>) + Send>;

/// Snapshot of a queued or running task.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadTask {
    pub track_id: String,
    pub priority: PreloadPriority,
    /// Unix milliseconds when the task was first requested.
    pub created_at: i64,
    pub progress: f32,
    pub loaded_segments: u32,
    pub total_segments: Option<u32>,
    pub executing: bool,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreloadStatistics {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub max_concurrent_tasks: usize,
    pub segment_limit: u32,
    pub paused: bool,
    pub current_preloading_track: Option<String>,
}

/// Handle on one execution of a task.
#[derive(Clone)]
struct RunHandle {
    generation: u64,
    token: CancellationToken,
    /// `true` while the run may write segments.
    gate: Arc<Mutex<bool>>,
}

impl RunHandle {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            token: CancellationToken::new(),
            gate: Arc::new(Mutex::new(true)),
        }
    }

    /// Stop the run. Once this returns no further segment write happens.
    fn close(&self) {
        *self.gate.lock() = false;
        self.token.cancel();
    }
}

struct TaskEntry {
    track_id: String,
    priority: PreloadPriority,
    created_at: i64,
    seq: u64,
    loaded_segments: u32,
    total_segments: Option<u32>,
    run: Option<RunHandle>,
    on_progress: Vec<ProgressCallback>,
    on_complete: Vec<CompletionCallback>,
}

impl TaskEntry {
    fn fraction(&self, segment_limit: u32) -> f32 {
        let target = match (segment_limit, self.total_segments) {
            (0, total) => total,
            (limit, Some(total)) => Some(limit.min(total)),
            (limit, None) => Some(limit),
        };
        match target {
            Some(0) => 1.0,
            Some(target) => (self.loaded_segments as f32 / target as f32).clamp(0.0, 1.0),
            None => 0.0,
        }
    }

    fn snapshot(&self, segment_limit: u32) -> PreloadTask {
        PreloadTask {
            track_id: self.track_id.clone(),
            priority: self.priority,
            created_at: self.created_at,
            progress: self.fraction(segment_limit),
            loaded_segments: self.loaded_segments,
            total_segments: self.total_segments,
            executing: self.run.is_some(),
        }
    }

    fn order_key(&self) -> (PreloadPriority, Reverse<i64>, Reverse<u64>) {
        (self.priority, Reverse(self.created_at), Reverse(self.seq))
    }
}

struct SchedulerState {
    tasks: HashMap<String, TaskEntry>,
    next_seq: u64,
    next_generation: u64,
    paused: bool,
    config: PreloadConfig,
    play_queue: Vec<String>,
    finished_progress: HashMap<String, f32>,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl SchedulerState {
    fn running_count(&self) -> usize {
        self.tasks.values().filter(|t| t.run.is_some()).count()
    }

    fn pending_in_order(&self) -> Vec<&TaskEntry> {
        let mut pending: Vec<&TaskEntry> =
            self.tasks.values().filter(|t| t.run.is_none()).collect();
        pending.sort_by_key(|t| Reverse(t.order_key()));
        pending
    }

    fn next_pending(&self) -> Option<String> {
        self.tasks
            .values()
            .filter(|t| t.run.is_none())
            .max_by_key(|t| t.order_key())
            .map(|t| t.track_id.clone())
    }

    fn is_current_run(&self, track_id: &str, generation: u64) -> bool {
        self.tasks
            .get(track_id)
            .and_then(|t| t.run.as_ref())
            .is_some_and(|run| run.generation == generation)
    }
}

struct Shared {
    orchestrator: Arc<CacheOrchestrator>,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    state: Mutex<SchedulerState>,
}

/// Priority queue of background preload tasks.
///
/// Methods that start work spawn onto the ambient runtime and must be called
/// from within it.
pub struct PreloadScheduler {
    shared: Arc<Shared>,
}

impl PreloadScheduler {
    pub fn new(
        orchestrator: Arc<CacheOrchestrator>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        config: PreloadConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                orchestrator,
                http,
                clock,
                state: Mutex::new(SchedulerState {
                    tasks: HashMap::new(),
                    next_seq: 0,
                    next_generation: 0,
                    paused: false,
                    config,
                    play_queue: Vec::new(),
                    finished_progress: HashMap::new(),
                    completed: 0,
                    failed: 0,
                    cancelled: 0,
                }),
            }),
        })
    }

    /// Queue a track, or change the priority of its existing task.
    pub fn preload(&self, track_id: &str, priority: PreloadPriority) {
        self.preload_with_callbacks(track_id, priority, None, None);
    }

    /// Like [`preload`](Self::preload), attaching callbacks to the task.
    ///
    /// Callbacks added to an existing task are kept alongside the ones it
    /// already has.
    pub fn preload_with_callbacks(
        &self,
        track_id: &str,
        priority: PreloadPriority,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<CompletionCallback>,
    ) {
        {
            let mut state = self.shared.state.lock();
            state.finished_progress.remove(track_id);

            if let Some(task) = state.tasks.get_mut(track_id) {
                if task.priority != priority {
                    debug!(track_id, from = ?task.priority, to = ?priority, "Re-prioritised preload");
                    task.priority = priority;
                }
                task.on_progress.extend(on_progress);
                task.on_complete.extend(on_complete);
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.tasks.insert(
                    track_id.to_string(),
                    TaskEntry {
                        track_id: track_id.to_string(),
                        priority,
                        created_at: self.shared.clock.unix_timestamp_millis(),
                        seq,
                        loaded_segments: 0,
                        total_segments: None,
                        run: None,
                        on_progress: on_progress.into_iter().collect(),
                        on_complete: on_complete.into_iter().collect(),
                    },
                );
                debug!(track_id, ?priority, "Queued preload");
            }
        }
        self.shared.pump();
    }

    /// Queue several tracks at one priority, in order.
    pub fn preload_many<S: AsRef<str>>(&self, track_ids: &[S], priority: PreloadPriority) {
        for track_id in track_ids {
            self.preload(track_id.as_ref(), priority);
        }
    }

    /// Cancel a track's task. Returns `false` if there was none.
    ///
    /// The task's completion callbacks fire with `success = false` and a
    /// [`PlaybackError::Cancelled`] before this returns.
    pub fn cancel(&self, track_id: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let Some(task) = state.tasks.remove(track_id) else {
                return false;
            };
            if let Some(run) = &task.run {
                run.close();
            }
            state.cancelled += 1;
            task
        };

        debug!(track_id, "Cancelled preload");
        let error = PlaybackError::Cancelled(track_id.to_string());
        for callback in removed.on_complete {
            callback(track_id, false, Some(&error));
        }
        self.shared.pump();
        true
    }

    /// Cancel every task.
    pub fn cancel_all(&self) -> usize {
        let removed: Vec<TaskEntry> = {
            let mut state = self.shared.state.lock();
            let removed: Vec<TaskEntry> = state.tasks.drain().map(|(_, task)| task).collect();
            for task in &removed {
                if let Some(run) = &task.run {
                    run.close();
                }
            }
            state.cancelled += removed.len() as u64;
            removed
        };

        let count = removed.len();
        for task in removed {
            let error = PlaybackError::Cancelled(task.track_id.clone());
            for callback in task.on_complete {
                callback(&task.track_id, false, Some(&error));
            }
        }
        info!(count, "Cancelled all preloads");
        count
    }

    /// `true` while the track has a queued or running task.
    pub fn is_preloading(&self, track_id: &str) -> bool {
        self.shared.state.lock().tasks.contains_key(track_id)
    }

    /// Progress in `[0, 1]`: live for a task, the final value once it
    /// succeeded, `0` for unknown tracks.
    pub fn progress(&self, track_id: &str) -> f32 {
        let state = self.shared.state.lock();
        if let Some(task) = state.tasks.get(track_id) {
            return task.fraction(state.config.segment_limit);
        }
        state.finished_progress.get(track_id).copied().unwrap_or(0.0)
    }

    pub fn task(&self, track_id: &str) -> Option<PreloadTask> {
        let state = self.shared.state.lock();
        state
            .tasks
            .get(track_id)
            .map(|t| t.snapshot(state.config.segment_limit))
    }

    /// Pending tracks in the order they would start.
    pub fn queued_tracks(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .pending_in_order()
            .into_iter()
            .map(|t| t.track_id.clone())
            .collect()
    }

    /// Set the play order used to find the successor of the current song.
    pub fn set_play_queue(&self, track_ids: Vec<String>) {
        self.shared.state.lock().play_queue = track_ids;
    }

    /// Song switch: pin `track_id`, raise its successor to High and cancel
    /// Low/Normal tasks for tracks already played past.
    pub fn set_current_playing_song(&self, track_id: &str) {
        self.shared
            .orchestrator
            .set_current_priority_song(Some(track_id));

        let (successor, stale) = {
            let state = self.shared.state.lock();
            match state.play_queue.iter().position(|id| id == track_id) {
                Some(position) => {
                    let successor = state.play_queue.get(position + 1).cloned();
                    let stale: Vec<String> = state.play_queue[..position]
                        .iter()
                        .filter(|id| {
                            state
                                .tasks
                                .get(id.as_str())
                                .is_some_and(|t| t.priority < PreloadPriority::High)
                        })
                        .cloned()
                        .collect();
                    (successor, stale)
                }
                None => (None, Vec::new()),
            }
        };

        for id in stale {
            self.cancel(&id);
        }
        if let Some(next) = successor {
            self.preload(&next, PreloadPriority::High);
        }
    }

    /// Mark the track that plays next: preloaded at High priority.
    pub fn set_next_playing_song(&self, track_id: &str) {
        self.preload(track_id, PreloadPriority::High);
    }

    /// Stop starting tasks and suspend running ones back to pending.
    ///
    /// Suspended tasks keep their callbacks; no completion fires.
    pub fn pause_all(&self) {
        let mut state = self.shared.state.lock();
        state.paused = true;
        for task in state.tasks.values_mut() {
            if let Some(run) = task.run.take() {
                run.close();
            }
        }
        info!("Paused preloading");
    }

    pub fn resume_all(&self) {
        self.shared.state.lock().paused = false;
        info!("Resumed preloading");
        self.shared.pump();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    pub fn set_max_concurrent_tasks(&self, count: usize) {
        self.shared.state.lock().config.max_concurrent_tasks = count.max(1);
        self.shared.pump();
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.shared.state.lock().config.max_concurrent_tasks
    }

    /// Segments fetched per track; `0` fetches whole tracks.
    pub fn set_segment_limit(&self, segments: u32) {
        self.shared.state.lock().config.segment_limit = segments;
    }

    pub fn segment_limit(&self) -> u32 {
        self.shared.state.lock().config.segment_limit
    }

    /// Highest-priority running track.
    pub fn current_preloading_track(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| t.run.is_some())
            .max_by_key(|t| t.order_key())
            .map(|t| t.track_id.clone())
    }

    pub fn total_task_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn pending_task_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.tasks.len() - state.running_count()
    }

    pub fn statistics(&self) -> PreloadStatistics {
        let current = self.current_preloading_track();
        let state = self.shared.state.lock();
        let running = state.running_count();
        PreloadStatistics {
            total_tasks: state.tasks.len(),
            pending_tasks: state.tasks.len() - running,
            running_tasks: running,
            completed_tasks: state.completed,
            failed_tasks: state.failed,
            cancelled_tasks: state.cancelled,
            max_concurrent_tasks: state.config.max_concurrent_tasks,
            segment_limit: state.config.segment_limit,
            paused: state.paused,
            current_preloading_track: current,
        }
    }
}

impl Drop for PreloadScheduler {
    /// Stops in-flight fetches. Callbacks of unfinished tasks are dropped.
    fn drop(&mut self) {
        let state = self.shared.state.lock();
        for run in state.tasks.values().filter_map(|t| t.run.as_ref()) {
            run.close();
        }
    }
}

impl Shared {
    /// Start pending tasks while slots are free.
    fn pump(self: &Arc<Self>) {
        let launches = {
            let mut state = self.state.lock();
            let mut launches = Vec::new();
            while !state.paused && state.running_count() < state.config.max_concurrent_tasks {
                let Some(track_id) = state.next_pending() else {
                    break;
                };
                state.next_generation += 1;
                let run = RunHandle::new(state.next_generation);
                if let Some(task) = state.tasks.get_mut(&track_id) {
                    task.run = Some(run.clone());
                }
                launches.push((track_id, run));
            }
            launches
        };

        for (track_id, run) in launches {
            debug!(track_id = %track_id, generation = run.generation, "Starting preload");
            core_async::task::spawn(run_task(Arc::clone(self), track_id, run));
        }
    }

    /// Record the outcome of a run and fire completion callbacks.
    ///
    /// Runs that were cancelled or suspended in the meantime are ignored.
    fn finish(self: &Arc<Self>, track_id: &str, generation: u64, outcome: Result<()>) {
        let task = {
            let mut state = self.state.lock();
            if !state.is_current_run(track_id, generation) {
                return;
            }
            let Some(task) = state.tasks.remove(track_id) else {
                return;
            };
            match &outcome {
                Ok(()) => {
                    state.completed += 1;
                    let progress = task.fraction(state.config.segment_limit).max(
                        // Nothing had to be fetched
                        if task.total_segments.is_none() { 1.0 } else { 0.0 },
                    );
                    state.finished_progress.insert(track_id.to_string(), progress);
                }
                Err(e) if e.is_cancellation() => state.cancelled += 1,
                Err(_) => state.failed += 1,
            }
            task
        };

        match &outcome {
            Ok(()) => debug!(track_id, loaded = task.loaded_segments, "Preload finished"),
            Err(e) => warn!(track_id, error = %e, "Preload failed"),
        }

        let error = outcome.err();
        for callback in task.on_complete {
            callback(track_id, error.is_none(), error.as_ref());
        }
        self.pump();
    }

    fn report_progress(&self, track_id: &str, generation: u64, loaded: u32, total: Option<u32>) {
        let (callbacks, fraction) = {
            let mut state = self.state.lock();
            if !state.is_current_run(track_id, generation) {
                return;
            }
            let segment_limit = state.config.segment_limit;
            let Some(task) = state.tasks.get_mut(track_id) else {
                return;
            };
            task.loaded_segments = loaded;
            task.total_segments = total;
            (task.on_progress.clone(), task.fraction(segment_limit))
        };

        for callback in callbacks {
            callback(track_id, fraction, loaded, total);
        }
    }

    /// Store a segment unless the run has been closed.
    fn store_gated(&self, run: &RunHandle, track_id: &str, index: u32, data: Bytes) -> bool {
        let open = run.gate.lock();
        if !*open {
            return false;
        }
        self.orchestrator.store_segment(track_id, index, data);
        true
    }

    async fn fetch_track(&self, track_id: &str, run: &RunHandle) -> Result<()> {
        let orchestrator = &self.orchestrator;
        if orchestrator.has_complete_cache(track_id).await {
            return Ok(());
        }

        let (segment_limit, fetch_timeout) = {
            let state = self.state.lock();
            (state.config.segment_limit, state.config.fetch_timeout)
        };
        let segment_size = orchestrator.segment_size();

        let staged = orchestrator.staged_size(track_id).await?;
        let mut index = u32::try_from(staged.div_ceil(segment_size)).unwrap_or(u32::MAX);
        let mut total_length = orchestrator.content_length(track_id).await;
        let mut total_segments = total_length.map(|len| segments_for(len, segment_size));
        let mut end = end_index(segment_limit, total_segments);

        'request: loop {
            index = self.next_missing(track_id, index, end).await;
            self.report_progress(track_id, run.generation, index, total_segments);
            if end.is_some_and(|end| index >= end) {
                return Ok(());
            }

            let mut claims = orchestrator.in_flight().claims(track_id);
            if !self.claim_next(&mut claims, track_id, index) {
                continue 'request;
            }

            let url = orchestrator.original_url(track_id).ok_or_else(|| {
                PlaybackError::NotCached(format!("no source URL registered for {}", track_id))
            })?;

            let start = u64::from(index) * segment_size;
            let range = match end {
                Some(end) => ByteRange::with_len(start, u64::from(end - index) * segment_size),
                None => ByteRange::starting_at(start),
            };
            debug!(track_id, url = %redact_url(&url), %range, "Fetching preload range");

            let request = HttpRequest::get(url).range(range);
            let response = timeout(fetch_timeout, self.http.fetch(request))
                .await
                .map_err(|_| {
                    PlaybackError::NetworkFailure(format!(
                        "preload request timed out after {:?}",
                        fetch_timeout
                    ))
                })??;
            let response = ensure_success(response)?;

            if let Some(total) = response.total_length() {
                orchestrator.record_content_length(track_id, total);
                total_length = Some(total);
                total_segments = Some(segments_for(total, segment_size));
                end = end_index(segment_limit, total_segments);
                self.report_progress(track_id, run.generation, index, total_segments);
            }

            // A server that ignores `Range` sends the whole body from byte 0
            let mut skip = if response.is_partial() { 0 } else { start };
            let mut body = response.body;
            let mut buffer = BytesMut::new();

            while let Some(chunk) = body.next().await {
                let mut chunk = chunk?;
                if skip > 0 {
                    let dropped = skip.min(chunk.len() as u64);
                    chunk = chunk.slice(dropped as usize..);
                    skip -= dropped;
                }
                buffer.extend_from_slice(&chunk);

                while buffer.len() as u64 >= segment_size {
                    let data = buffer.split_to(segment_size as usize).freeze();
                    if !self.store_gated(run, track_id, index, data) {
                        return Err(PlaybackError::Cancelled(track_id.to_string()));
                    }
                    claims.complete(index, FetchStatus::Ready);
                    index += 1;
                    self.report_progress(track_id, run.generation, index, total_segments);
                    if end.is_some_and(|end| index >= end) {
                        return Ok(());
                    }
                    // Another fetcher got to the next segment first: drop
                    // this response and resume after its work
                    if !self.claim_next(&mut claims, track_id, index) {
                        continue 'request;
                    }
                }
            }

            if !buffer.is_empty() {
                let tail_end = u64::from(index) * segment_size + buffer.len() as u64;
                if total_length.is_some_and(|total| total != tail_end) {
                    return Err(PlaybackError::NetworkFailure(format!(
                        "response for {} ended mid-segment at byte {}",
                        track_id, tail_end
                    )));
                }
                if !self.store_gated(run, track_id, index, buffer.freeze()) {
                    return Err(PlaybackError::Cancelled(track_id.to_string()));
                }
                claims.complete(index, FetchStatus::Ready);
                index += 1;
                self.report_progress(track_id, run.generation, index, total_segments);
            }

            return Ok(());
        }
    }

    /// First index at or after `index` that is neither resident nor being
    /// fetched by someone else. Waits for other fetchers as needed.
    async fn next_missing(&self, track_id: &str, mut index: u32, end: Option<u32>) -> u32 {
        let orchestrator = &self.orchestrator;
        while !end.is_some_and(|end| index >= end) {
            if orchestrator.has_segment(track_id, index) {
                index += 1;
                continue;
            }
            match orchestrator.in_flight().watch(track_id, index) {
                Some(receiver) => {
                    if inflight::settled(receiver).await == FetchStatus::Failed {
                        break;
                    }
                }
                None => break,
            }
        }
        index
    }

    /// Claim `index` for this run. `false` when another fetcher holds it or
    /// it became resident in the meantime.
    fn claim_next(&self, claims: &mut SegmentClaims<'_>, track_id: &str, index: u32) -> bool {
        match claims.try_claim(index) {
            Claim::Busy(_) => false,
            Claim::Owned if self.orchestrator.has_segment(track_id, index) => {
                claims.complete(index, FetchStatus::Ready);
                false
            }
            Claim::Owned => true,
        }
    }
}

async fn run_task(shared: Arc<Shared>, track_id: String, run: RunHandle) {
    let outcome = {
        let work = shared.fetch_track(&track_id, &run);
        futures::pin_mut!(work);
        let cancelled = run.token.cancelled();
        futures::pin_mut!(cancelled);

        match select(cancelled, work).await {
            Either::Left(_) => Err(PlaybackError::Cancelled(track_id.clone())),
            Either::Right((result, _)) => result,
        }
    };
    shared.finish(&track_id, run.generation, outcome);
}

fn segments_for(length: u64, segment_size: u64) -> u32 {
    u32::try_from(length.div_ceil(segment_size)).unwrap_or(u32::MAX)
}

/// Exclusive index at which a task stops, if bounded.
fn end_index(segment_limit: u32, total_segments: Option<u32>) -> Option<u32> {
    match (segment_limit, total_segments) {
        (0, total) => total,
        (limit, Some(total)) => Some(limit.min(total)),
        (limit, None) => Some(limit),
    }
}
