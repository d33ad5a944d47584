//! Bounded queue between frame arrival and frame presentation.
//!
//! The control task enqueues IMAGE envelopes as they arrive and records
//! DISPLAY_NOW requests; an independent display task, paced by its own
//! interval, pops frames and writes them to a [`FrameSink`]. The
//! receive path never touches the sink, so a slow viewer costs dropped
//! frames instead of receive-side stalls, and arrival jitter stays out
//! of display timing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::display::sink::{FrameGeometry, FrameSink, SinkContext};
use crate::envelope::Envelope;
use crate::error::FramelinkError;
use crate::pacing::check_fps;
use crate::stats::{RunningStats, StatsSnapshot};

// ── Configuration ────────────────────────────────────────────────

/// When the display task presents a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Only when a DISPLAY_NOW request is pending.
    #[default]
    Signal,
    /// On every tick, oldest frame first (the queue is a jitter buffer).
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Frames held before the oldest is dropped (`C`).
    pub capacity: usize,
    /// Display task tick rate. Keep it above the producer's rate so a
    /// request never waits more than a fraction of a frame.
    pub fps: f64,
    pub mode: DisplayMode,
    pub geometry: FrameGeometry,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            fps: 60.0,
            mode: DisplayMode::Signal,
            geometry: FrameGeometry::default(),
        }
    }
}

impl DisplayConfig {
    pub fn validate(&self) -> Result<(), FramelinkError> {
        if self.capacity == 0 {
            return Err(FramelinkError::Config(
                "display capacity must be at least 1".into(),
            ));
        }
        check_fps(self.fps)?;
        self.geometry.validate()
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

// ── Counters / stats ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    pub enqueued: u64,
    /// Dropped because the queue was full.
    pub evicted: u64,
    /// Skipped over when a newer frame was selected for presentation.
    pub superseded: u64,
    pub presented: u64,
    /// Present requests that found the queue empty.
    pub missed_presents: u64,
}

/// Timing published by the display task after every present.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisplayStats {
    /// Intervals between presents.
    pub present: StatsSnapshot,
    /// Duration of each sink write.
    pub write: StatsSnapshot,
    pub last_frame: Option<String>,
}

// ── Pipeline ─────────────────────────────────────────────────────

#[derive(Debug)]
enum PresentRequest {
    Latest,
    Named(String),
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Envelope>,
    present: Option<PresentRequest>,
    counters: PipelineCounters,
}

/// Shared handle to the display queue. Clones refer to the same queue.
#[derive(Debug, Clone)]
pub struct DisplayPipeline {
    config: DisplayConfig,
    state: Arc<Mutex<QueueState>>,
}

impl DisplayPipeline {
    pub fn new(config: DisplayConfig) -> Result<Self, FramelinkError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(QueueState::default())),
        })
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a frame. If that overflows the capacity, the oldest frame
    /// is dropped and its name returned.
    pub fn enqueue(&self, envelope: Envelope) -> Option<String> {
        let mut state = self.lock();
        state.frames.push_back(envelope);
        state.counters.enqueued += 1;
        if state.frames.len() > self.config.capacity {
            let dropped = state.frames.pop_front()?;
            state.counters.evicted += 1;
            return Some(dropped.into_parts().0);
        }
        None
    }

    /// Ask the display task to present a frame on its next tick.
    ///
    /// With a name, the matching queued frame is presented if there is
    /// one; otherwise (or without a name) the most recent frame is.
    /// A newer request replaces one that has not been served yet.
    pub fn signal_display(&self, name: Option<&str>) {
        let request = match name {
            Some(name) => PresentRequest::Named(name.to_string()),
            None => PresentRequest::Latest,
        };
        self.lock().present = Some(request);
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    /// Names of the queued frames, oldest first.
    pub fn queued_names(&self) -> Vec<String> {
        self.lock()
            .frames
            .iter()
            .map(|f| f.name().to_string())
            .collect()
    }

    pub fn counters(&self) -> PipelineCounters {
        self.lock().counters
    }

    /// Take the frame the display task should present now, if any.
    fn next_frame(&self) -> Option<Envelope> {
        let mut state = self.lock();
        match self.config.mode {
            DisplayMode::Timer => state.frames.pop_front(),
            DisplayMode::Signal => {
                let request = state.present.take()?;
                if state.frames.is_empty() {
                    state.counters.missed_presents += 1;
                    return None;
                }
                let last = state.frames.len() - 1;
                let index = match &request {
                    PresentRequest::Named(name) => state
                        .frames
                        .iter()
                        .position(|f| f.name() == name)
                        .unwrap_or(last),
                    PresentRequest::Latest => last,
                };
                state.frames.drain(..index);
                state.counters.superseded += index as u64;
                state.frames.pop_front()
            }
        }
    }

    fn record_presented(&self) {
        self.lock().counters.presented += 1;
    }

    /// Start the display task writing into `sink`.
    pub fn spawn<S>(&self, sink: S) -> DisplayHandle
    where
        S: FrameSink + 'static,
    {
        let (stats_tx, stats_rx) = watch::channel(DisplayStats::default());
        let task = tokio::spawn(display_loop(
            self.clone(),
            sink,
            SinkContext::new(self.config.geometry),
            stats_tx,
        ));
        DisplayHandle { task, stats_rx }
    }
}

// ── Display task ─────────────────────────────────────────────────

/// Handle to a running display task.
#[derive(Debug)]
pub struct DisplayHandle {
    task: JoinHandle<Result<(), FramelinkError>>,
    stats_rx: watch::Receiver<DisplayStats>,
}

impl DisplayHandle {
    /// Latest timing published by the display task.
    pub fn stats(&self) -> DisplayStats {
        self.stats_rx.borrow().clone()
    }

    /// A receiver that observes every stats update.
    pub fn stats_receiver(&self) -> watch::Receiver<DisplayStats> {
        self.stats_rx.clone()
    }

    /// Whether the task has ended (sink closed or failed).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    /// Wait for the task to end and return its sink error, if any.
    pub async fn join(self) -> Result<(), FramelinkError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(FramelinkError::Sink(format!("display task panicked: {e}"))),
        }
    }
}

async fn display_loop<S: FrameSink>(
    pipeline: DisplayPipeline,
    mut sink: S,
    ctx: SinkContext,
    stats_tx: watch::Sender<DisplayStats>,
) -> Result<(), FramelinkError> {
    let mut ticker = tokio::time::interval(pipeline.config.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut present_stats = RunningStats::new();
    let mut write_stats = RunningStats::new();
    info!(
        mode = ?pipeline.config.mode,
        frame_size = ctx.frame_size(),
        "display task started"
    );

    loop {
        ticker.tick().await;

        if !sink.is_ready() {
            warn!("display sink is gone; stopping display task");
            return Ok(());
        }
        let Some(frame) = pipeline.next_frame() else {
            continue;
        };

        let started = Instant::now();
        let interval = present_stats.observe(started);
        if let Err(e) = sink.write_frame(ctx.frame_bytes(frame.payload())).await {
            error!("display write failed: {e}");
            return Err(e);
        }
        write_stats.observe_interval(started.elapsed());
        pipeline.record_presented();
        debug!(name = frame.name(), ?interval, "presented");

        stats_tx.send_replace(DisplayStats {
            present: present_stats.snapshot(),
            write: write_stats.snapshot(),
            last_frame: Some(frame.name().to_string()),
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────
