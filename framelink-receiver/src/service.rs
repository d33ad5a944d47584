//! Receiver service core logic.
//!
//! Accepts producer sessions one at a time. For every session the
//! control loop waits on the session's [`Waiter`] and handles each
//! received envelope:
//!
//! - IMAGE: ACK it at once, verify it, queue it for display.
//! - DISPLAY_NOW: ask the display task to present the named frame.
//! - START_TIMER: reset the elapsed-time base.
//!
//! The display pipeline and its task outlive individual sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use framelink_core::{
    Connection, DisplayHandle, DisplayPipeline, DisplayStats, Envelope, EnvelopeKind, FrameSink,
    FramelinkError, PipeSink, PipelineCounters, RunningStats, StatsSnapshot, Waiter,
    write_snapshot,
};

use crate::config::ReceiverConfig;
use crate::verify::{FrameVerifier, VerifyCounters};

/// Upper bound on how long the control loop sleeps before re-checking
/// the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ── Display output ───────────────────────────────────────────────

/// The display pipeline together with the task draining it.
#[derive(Debug)]
pub struct DisplayOutput {
    pipeline: DisplayPipeline,
    handle: DisplayHandle,
    frame_size: usize,
}

impl DisplayOutput {
    pub fn pipeline(&self) -> &DisplayPipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> DisplayStats {
        self.handle.stats()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.stop();
    }
}

// ── Report ───────────────────────────────────────────────────────

/// Counters for one session, written to the stats file and returned
/// from [`ReceiverService::serve`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub peer: String,
    pub elapsed_secs: f64,
    pub images: u64,
    /// Images smaller than one frame, never queued for display.
    pub undersized: u64,
    pub start_timers: u64,
    /// Intervals between DISPLAY_NOW requests.
    pub display_requests: StatsSnapshot,
    pub verify: VerifyCounters,
    pub pipeline: Option<PipelineCounters>,
    pub display: Option<DisplayStats>,
}

// ── ReceiverService ──────────────────────────────────────────────

pub struct ReceiverService {
    config: ReceiverConfig,
    running: Arc<AtomicBool>,
}

impl ReceiverService {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Handle that stops the service when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Start the display pipeline writing into `sink`.
    pub fn start_display<S>(&self, sink: S) -> Result<DisplayOutput, FramelinkError>
    where
        S: FrameSink + 'static,
    {
        let display_config = self.config.display_config();
        let pipeline = DisplayPipeline::new(display_config)?;
        let handle = pipeline.spawn(sink);
        Ok(DisplayOutput {
            pipeline,
            handle,
            frame_size: display_config.geometry.frame_size(),
        })
    }

    /// Listen on the configured address and serve sessions until stopped.
    pub async fn run(&self) -> Result<(), FramelinkError> {
        self.config.validate()?;
        let display = if self.config.display.enabled {
            let viewer = &self.config.viewer;
            let sink = PipeSink::spawn(&viewer.program, &self.config.viewer_args())?;
            Some(self.start_display(sink)?)
        } else {
            None
        };

        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FramelinkError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        info!("receiver listening on {addr}");

        while self.running.load(Ordering::SeqCst) {
            let waiter = Waiter::new();
            let accepted = tokio::select! {
                result = Connection::accept_from(&listener, Some(waiter.clone())) => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let report = self.serve(conn, waiter, display.as_ref()).await;
            info!(
                peer = %report.peer,
                images = report.images,
                matched = report.verify.matched,
                mismatched = report.verify.mismatched,
                "session ended"
            );
        }

        if let Some(display) = display {
            display.stop();
        }
        info!("receiver stopped");
        Ok(())
    }

    /// Handle one session until the producer disconnects or the service
    /// is stopped.
    pub async fn serve(
        &self,
        conn: Connection,
        waiter: Waiter,
        display: Option<&DisplayOutput>,
    ) -> SessionReport {
        let mut session = Session::new(&self.config, &conn, display);
        let mut display_lost = false;

        loop {
            waiter.wait_for(POLL_INTERVAL).await;
            let closed = conn.is_closed();

            for envelope in conn.drain_received() {
                session.handle(&conn, envelope).await;
            }

            if !display_lost && display.is_some_and(|d| !d.is_running()) {
                error!("display task ended; frames are no longer shown");
                display_lost = true;
            }

            if closed {
                info!(peer = %conn.info(), "session {}", conn.state());
                break;
            }
            if !self.running.load(Ordering::SeqCst) {
                conn.close();
                break;
            }
        }

        let report = session.report();
        session.write_stats(&report);
        report
    }

    async fn wait_for_stop(running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

struct Session<'a> {
    config: &'a ReceiverConfig,
    peer: String,
    display: Option<&'a DisplayOutput>,
    verifier: FrameVerifier,
    begin: Instant,
    images: u64,
    undersized: u64,
    start_timers: u64,
    display_requests: RunningStats,
}

impl<'a> Session<'a> {
    fn new(config: &'a ReceiverConfig, conn: &Connection, display: Option<&'a DisplayOutput>) -> Self {
        let verifier = FrameVerifier::load(&config.verify.reference_images).unwrap_or_else(|e| {
            warn!("payload verification disabled: {e}");
            FrameVerifier::new()
        });
        Self {
            config,
            peer: conn.info().to_string(),
            display,
            verifier,
            begin: Instant::now(),
            images: 0,
            undersized: 0,
            start_timers: 0,
            display_requests: RunningStats::new(),
        }
    }

    async fn handle(&mut self, conn: &Connection, envelope: Envelope) {
        match envelope.kind() {
            EnvelopeKind::Image => {
                debug!("got image '{}' sz:{}", envelope.name(), envelope.payload().len());
                if let Err(e) = conn.send_ack(envelope.name()).await {
                    debug!("ack for {} not sent: {e}", envelope.name());
                }
                self.images += 1;
                if !self.verifier.is_empty() {
                    self.verifier.check(envelope.name(), envelope.payload());
                }
                if let Some(display) = self.display {
                    if envelope.payload().len() >= display.frame_size {
                        if let Some(dropped) = display.pipeline.enqueue(envelope) {
                            debug!("display queue full, dropped {dropped}");
                        }
                    } else {
                        self.undersized += 1;
                        let frame_size = display.frame_size;
                        warn!(
                            "image '{}' is {} bytes, smaller than one {}-byte frame",
                            envelope.name(),
                            envelope.payload().len(),
                            frame_size
                        );
                    }
                }
            }
            EnvelopeKind::DisplayNow => {
                let interval = self.display_requests.observe_now();
                debug!(
                    "display now {} t:{:.3}s 1f:{:.4}",
                    envelope.name(),
                    self.begin.elapsed().as_secs_f64(),
                    interval.as_secs_f64()
                );
                if let Some(display) = self.display {
                    display.pipeline.signal_display(Some(envelope.name()));
                }
                let report = self.report();
                self.write_stats(&report);
            }
            EnvelopeKind::StartTimer => {
                info!("start timer from {}", self.peer);
                self.begin = Instant::now();
                self.start_timers += 1;
            }
            EnvelopeKind::Ack => {
                warn!("unexpected ACK for {} from {}", envelope.name(), self.peer);
            }
        }
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            peer: self.peer.clone(),
            elapsed_secs: self.begin.elapsed().as_secs_f64(),
            images: self.images,
            undersized: self.undersized,
            start_timers: self.start_timers,
            display_requests: self.display_requests.snapshot(),
            verify: self.verifier.counters(),
            pipeline: self.display.map(|d| d.pipeline.counters()),
            display: self.display.map(|d| d.stats()),
        }
    }

    fn write_stats(&self, report: &SessionReport) {
        let Some(path) = self.config.stats_path() else {
            return;
        };
        if let Err(e) = write_snapshot(&path, report) {
            warn!("failed to write stats: {e}");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use framelink_core::{ConnectionInfo, FrameGeometry, NullSink, SendMode};

    fn small_config() -> ReceiverConfig {
        let mut cfg = ReceiverConfig::default();
        cfg.geometry = FrameGeometry {
            width: 4,
            height: 2,
            bits_per_pixel: 8,
        };
        cfg.display.fps = 200.0;
        cfg
    }

    /// (producer side, receiver side, receiver waiter)
    async fn session_pair() -> (Connection, Connection, Waiter) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info = ConnectionInfo::from(addr);
        let waiter = Waiter::new();
        let (producer, receiver) = tokio::join!(
            Connection::connect(&info, None),
            Connection::accept_from(&listener, Some(waiter.clone())),
        );
        (producer.unwrap(), receiver.unwrap(), waiter)
    }

    async fn collect_acks(conn: &Connection, n: usize) -> Vec<String> {
        let mut acks = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while acks.len() < n {
                for env in conn.drain_received() {
                    assert_eq!(env.kind(), EnvelopeKind::Ack);
                    acks.push(env.name().to_string());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("acks did not arrive");
        acks
    }

    #[tokio::test]
    async fn acks_every_image_in_order() {
        let service = ReceiverService::new(small_config());
        let (mut producer, receiver, waiter) = session_pair().await;

        let script = async {
            producer.send_start_timer().await.unwrap();
            for i in 0..4 {
                producer
                    .send_image(format!("f__{i}"), vec![0u8; 8], SendMode::NonBlocking)
                    .await
                    .unwrap();
            }
            let acks = collect_acks(&producer, 4).await;
            producer.shutdown().await;
            acks
        };
        let (report, acks) = tokio::join!(service.serve(receiver, waiter, None), script);

        assert_eq!(acks, vec!["f__0", "f__1", "f__2", "f__3"]);
        assert_eq!(report.images, 4);
        assert_eq!(report.start_timers, 1);
        assert!(report.pipeline.is_none());
    }

    #[tokio::test]
    async fn verifies_payloads_against_references() {
        let path = std::env::temp_dir().join(format!("framelink-ref-{}.raw", std::process::id()));
        std::fs::write(&path, [5u8; 8]).unwrap();
        let label = path.display().to_string();

        let mut cfg = small_config();
        cfg.verify.reference_images = vec![path.clone()];
        let service = ReceiverService::new(cfg);
        let (mut producer, receiver, waiter) = session_pair().await;

        let script = async {
            producer
                .send_image(format!("{label}__0"), vec![5u8; 8], SendMode::NonBlocking)
                .await
                .unwrap();
            producer
                .send_image(format!("{label}__1"), vec![6u8; 8], SendMode::NonBlocking)
                .await
                .unwrap();
            collect_acks(&producer, 2).await;
            producer.shutdown().await;
        };
        let (report, ()) = tokio::join!(service.serve(receiver, waiter, None), script);

        assert_eq!(report.verify.matched, 1);
        assert_eq!(report.verify.mismatched, 1);
        std::fs::remove_file(&path).ok();
    }

    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn write_frame(&mut self, frame: &[u8]) -> Result<(), FramelinkError> {
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn display_now_reaches_the_sink() {
        let service = ReceiverService::new(small_config());
        let frames = Arc::new(Mutex::new(Vec::new()));
        let display = service
            .start_display(RecordingSink {
                frames: Arc::clone(&frames),
            })
            .unwrap();
        let (mut producer, receiver, waiter) = session_pair().await;

        let script = async {
            producer
                .send_image("a__0", vec![1u8; 8], SendMode::NonBlocking)
                .await
                .unwrap();
            // Too small for a 4x2x8 frame: ACKed but never displayed.
            producer
                .send_image("b__1", vec![2u8; 3], SendMode::NonBlocking)
                .await
                .unwrap();
            producer.send_display_now("a__0").await.unwrap();
            collect_acks(&producer, 2).await;

            tokio::time::timeout(Duration::from_secs(2), async {
                while frames.lock().unwrap().is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("frame never displayed");
            producer.shutdown().await;
        };
        let (report, ()) = tokio::join!(service.serve(receiver, waiter, Some(&display)), script);

        assert_eq!(*frames.lock().unwrap(), vec![vec![1u8; 8]]);
        assert_eq!(report.undersized, 1);
        assert_eq!(report.display_requests.count, 1);
        assert_eq!(report.pipeline.unwrap().presented, 1);
        display.stop();
    }

    #[tokio::test]
    async fn stop_handle_ends_session() {
        let service = ReceiverService::new(small_config());
        let display = service.start_display(NullSink).unwrap();
        let (_producer, receiver, waiter) = session_pair().await;

        service.stop_handle().store(false, Ordering::SeqCst);
        let report = tokio::time::timeout(
            Duration::from_secs(2),
            service.serve(receiver, waiter, Some(&display)),
        )
        .await
        .expect("serve ignored the stop flag");
        assert_eq!(report.images, 0);
    }

    #[tokio::test]
    async fn run_rejects_invalid_config() {
        let mut cfg = small_config();
        cfg.display.capacity = 0;
        let err = ReceiverService::new(cfg).run().await.unwrap_err();
        assert!(matches!(err, FramelinkError::Config(_)));
    }
}
