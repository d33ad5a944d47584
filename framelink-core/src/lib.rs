//! # framelink-core
//!
//! Transport library for streaming raw image frames over TCP at a fixed
//! rate, with per-frame acknowledgements and receiver-side display
//! pacing.
//!
//! This crate contains:
//! - **Envelope**: `Envelope`, `EnvelopeKind` and the little-endian wire layout
//! - **Codec**: `EnvelopeCodec` for framed TCP I/O via `tokio_util`
//! - **Network**: `Connection` with background read/write tasks and an inbox
//! - **Waiter**: deadline-bounded wait that receive tasks notify
//! - **Ack**: `AckTracker` for unacknowledged frames and backpressure
//! - **Pacing**: `Pacer` deadline schedule and late-frame accounting
//! - **Stats**: `RunningStats` interval statistics
//! - **Display**: `DisplayPipeline` bounded queue, display task and sinks
//! - **Error**: `FramelinkError`, a `thiserror`-based error type

pub mod ack;
pub mod codec;
pub mod diag;
pub mod display;
pub mod envelope;
pub mod error;
pub mod network;
pub mod pacing;
pub mod stats;
pub mod waiter;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use ack::{AckTracker, Admission, BackpressureConfig, BackpressurePolicy};
pub use codec::EnvelopeCodec;
pub use diag::write_snapshot;
pub use display::{
    DisplayConfig, DisplayHandle, DisplayMode, DisplayPipeline, DisplayStats, FrameGeometry,
    FrameSink, NullSink, PipeSink, PipelineCounters, SinkContext,
};
pub use envelope::{Envelope, EnvelopeKind, MAX_NAME_LEN, MAX_PAYLOAD_SIZE};
pub use error::FramelinkError;
pub use network::{CloseReason, Connection, ConnectionInfo, ConnectionState, Role, SendMode};
pub use pacing::{MIN_FPS, Pacer, check_fps};
pub use stats::{RunningStats, StatsSnapshot};
pub use waiter::{WaitResult, Waiter};
