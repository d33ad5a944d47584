//! Paced producer service.
//!
//! Connects to every configured receiver, then runs one control loop
//! per session:
//!
//! 1. Send frame `i` as IMAGE to every receiver whose tracker admits it.
//! 2. Wait on the shared [`Waiter`] until frame `i` is due, draining
//!    ACKs each time the wait ends.
//! 3. Send DISPLAY_NOW for frame `i` to every receiver.
//!
//! After the last frame the service lingers for outstanding ACKs, logs
//! what never came back, and flushes the sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use framelink_core::{
    AckTracker, Admission, BackpressureConfig, Connection, EnvelopeKind, FramelinkError, Pacer,
    RunningStats, SendMode, StatsSnapshot, Waiter, write_snapshot,
};

use crate::config::ProducerConfig;
use crate::frames::FrameSource;

// ── Per-peer state ───────────────────────────────────────────────

/// Tracking state carried by each receiver session.
#[derive(Debug)]
pub struct PeerTracking {
    pub acks: AckTracker,
    pub acked: u64,
    /// Intervals between DISPLAY_NOW sends.
    pub display: RunningStats,
    /// Duration of blocking image sends.
    pub blocking_send: RunningStats,
}

impl PeerTracking {
    pub fn new(backpressure: BackpressureConfig) -> Self {
        Self {
            acks: AckTracker::new(backpressure),
            acked: 0,
            display: RunningStats::new(),
            blocking_send: RunningStats::new(),
        }
    }
}

type Peer = Connection<PeerTracking>;

// ── Report ───────────────────────────────────────────────────────

/// Counters for one receiver, written to the stats file and returned
/// from [`ProducerService::run`].
#[derive(Debug, Clone, Serialize)]
pub struct PeerReport {
    pub address: String,
    pub state: String,
    pub acked: u64,
    pub skipped: u64,
    pub evicted: u64,
    pub unexpected_acks: u64,
    pub missing_acks: Vec<String>,
    pub display: StatsSnapshot,
    pub blocking_send: StatsSnapshot,
}

impl PeerReport {
    fn from_peer(peer: &Peer) -> Self {
        let t = peer.ext();
        Self {
            address: peer.info().to_string(),
            state: peer.state().to_string(),
            acked: t.acked,
            skipped: t.acks.skip_count(),
            evicted: t.acks.eviction_count(),
            unexpected_acks: t.acks.unexpected_acks(),
            missing_acks: t.acks.pending().map(|(name, _)| name.to_string()).collect(),
            display: t.display.snapshot(),
            blocking_send: t.blocking_send.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerReport {
    pub elapsed_secs: f64,
    pub frames: u64,
    pub late: u64,
    /// Interval between consecutive pacing-loop iterations.
    #[serde(rename = "loop")]
    pub frame_loop: StatsSnapshot,
    pub peers: Vec<PeerReport>,
}

// ── ProducerService ──────────────────────────────────────────────

pub struct ProducerService {
    config: ProducerConfig,
    running: Arc<AtomicBool>,
}

impl ProducerService {
    pub fn new(config: ProducerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the loop after the current frame when set to
    /// `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Stream frames until the repeat count is reached, the service is
    /// stopped, or every receiver has gone away.
    pub async fn run(&self) -> Result<ProducerReport, FramelinkError> {
        self.config.validate()?;
        let source = FrameSource::from_config(&self.config.frames)?;
        let mut pacer = Pacer::new(self.config.stream.fps)?;
        let send_mode = self.config.stream.send_mode;
        let stats_path = self.config.stats_path();
        self.running.store(true, Ordering::SeqCst);

        let waiter = Waiter::new();
        let mut peers = Vec::new();
        for info in self.config.receiver_infos() {
            let conn = Connection::connect(&info, Some(waiter.clone())).await?;
            peers.push(conn.with_extension(PeerTracking::new(self.config.backpressure)));
        }
        let mut retired: Vec<Peer> = Vec::new();

        for peer in &peers {
            peer.send_start_timer().await?;
        }
        info!(
            receivers = peers.len(),
            fps = pacer.fps(),
            frames = source.len(),
            "streaming started"
        );

        let begin = Instant::now();
        let repeat = self.config.stream.repeat_count;
        let mut frame: u64 = 0;
        let mut frame_loop = RunningStats::new();
        while (repeat == 0 || frame < repeat) && self.running.load(Ordering::SeqCst) {
            let (name, payload) = source.frame(frame);
            debug!(%name, len = payload.len(), "sending frame {frame}");

            for peer in peers.iter_mut() {
                if peer.ext_mut().acks.admit() == Admission::Skip {
                    debug!(peer = %peer.info(), %name, "skipped: too many unacked frames");
                    continue;
                }
                let started = std::time::Instant::now();
                match peer.send_image(name.clone(), payload.clone(), send_mode).await {
                    Ok(()) => {
                        let t = peer.ext_mut();
                        if send_mode == SendMode::Blocking {
                            t.blocking_send.observe_interval(started.elapsed());
                        }
                        t.acks.track(name.clone(), frame);
                    }
                    Err(e) => drop_on_transport_error(peer, e)?,
                }
            }

            // Sleep until the frame is due, handling ACKs as they arrive.
            let mut waited = false;
            while let Some(remaining) = pacer.remaining(frame, begin.elapsed()) {
                waited = true;
                waiter.wait_for(remaining).await;
                drain_acks(&mut peers);
            }
            if pacer.finish_frame(frame, begin.elapsed(), waited) {
                debug!(late = pacer.late_count(), "frame {frame} sent after its deadline");
            }

            for peer in peers.iter_mut() {
                match peer.send_display_now(name.clone()).await {
                    Ok(()) => {
                        peer.ext_mut().display.observe_now();
                    }
                    Err(e) => drop_on_transport_error(peer, e)?,
                }
            }

            retire_closed(&mut peers, &mut retired);
            if peers.is_empty() {
                warn!("all receivers disconnected");
                return Err(FramelinkError::ConnectionClosed);
            }

            frame_loop.observe_now();
            frame += 1;
            if let Some(path) = &stats_path {
                let report = build_report(begin, frame, &pacer, &frame_loop, &peers, &retired);
                if let Err(e) = write_snapshot(path, &report) {
                    warn!("failed to write stats: {e}");
                }
            }
        }

        self.linger(&waiter, &mut peers).await;

        for peer in &peers {
            for (name, seq) in peer.ext().acks.pending() {
                warn!(peer = %peer.info(), "missing ack for {name} (frame {seq})");
            }
        }
        let report = build_report(begin, frame, &pacer, &frame_loop, &peers, &retired);
        info!(
            loop_mean_ms = report.frame_loop.mean * 1000.0,
            loop_sd_ms = report.frame_loop.std_dev * 1000.0,
            "pacing loop"
        );
        info!(
            frames = report.frames,
            late = report.late,
            elapsed = report.elapsed_secs,
            "streaming finished"
        );
        if let Some(path) = &stats_path {
            if let Err(e) = write_snapshot(path, &report) {
                warn!("failed to write stats: {e}");
            }
        }

        for peer in peers.iter_mut() {
            peer.shutdown().await;
        }
        Ok(report)
    }

    /// Keep collecting ACKs for up to `linger_ms` after the last frame.
    async fn linger(&self, waiter: &Waiter, peers: &mut [Peer]) {
        let deadline = Instant::now() + Duration::from_millis(self.config.stream.linger_ms);
        drain_acks(peers);
        while Instant::now() < deadline
            && peers
                .iter()
                .any(|p| !p.ext().acks.is_empty() && !p.is_closed())
        {
            waiter.wait_until(deadline).await;
            drain_acks(peers);
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Resolve every ACK waiting in the peers' inboxes.
fn drain_acks(peers: &mut [Peer]) {
    for peer in peers.iter_mut() {
        for envelope in peer.drain_received() {
            if envelope.kind() != EnvelopeKind::Ack {
                debug!(peer = %peer.info(), kind = %envelope.kind(), "ignoring envelope");
                continue;
            }
            let t = peer.ext_mut();
            match t.acks.acknowledge(envelope.name()) {
                Ok(seq) => {
                    t.acked += 1;
                    debug!("ack: {} (frame {seq})", envelope.name());
                }
                Err(e) => warn!("{e}"),
            }
        }
    }
}

/// Closed sessions are retired by the loop; anything else is fatal.
fn drop_on_transport_error(peer: &Peer, e: FramelinkError) -> Result<(), FramelinkError> {
    match e {
        FramelinkError::ConnectionClosed | FramelinkError::Io(_) => {
            warn!(peer = %peer.info(), "send failed: {e}");
            peer.close();
            Ok(())
        }
        other => Err(other),
    }
}

fn retire_closed(peers: &mut Vec<Peer>, retired: &mut Vec<Peer>) {
    let mut i = 0;
    while i < peers.len() {
        if peers[i].is_closed() {
            let peer = peers.remove(i);
            warn!(peer = %peer.info(), "receiver {}", peer.state());
            retired.push(peer);
        } else {
            i += 1;
        }
    }
}

fn build_report(
    begin: Instant,
    frames: u64,
    pacer: &Pacer,
    frame_loop: &RunningStats,
    peers: &[Peer],
    retired: &[Peer],
) -> ProducerReport {
    ProducerReport {
        elapsed_secs: begin.elapsed().as_secs_f64(),
        frames,
        late: pacer.late_count(),
        frame_loop: frame_loop.snapshot(),
        peers: peers
            .iter()
            .chain(retired)
            .map(PeerReport::from_peer)
            .collect(),
    }
}

// ── Tests ────────────────────────────────────────────────────────
