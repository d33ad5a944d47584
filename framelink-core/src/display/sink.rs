//! Output boundary of the display task.
//!
//! The display task only needs to write raw frame bytes somewhere and
//! ask whether that somewhere is still accepting them. Everything the
//! write needs travels in a [`SinkContext`] owned by the task.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{info, warn};

use crate::error::FramelinkError;

// ── FrameGeometry ────────────────────────────────────────────────

/// Dimensions of a raw frame; used only to size sink writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            bits_per_pixel: 8,
        }
    }
}

impl FrameGeometry {
    /// Bytes in one frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bits_per_pixel as usize / 8
    }

    pub fn validate(&self) -> Result<(), FramelinkError> {
        if self.width == 0 || self.height == 0 || self.bits_per_pixel == 0 {
            return Err(FramelinkError::Config(format!(
                "frame geometry must be non-zero, got {}x{}x{}",
                self.width, self.height, self.bits_per_pixel
            )));
        }
        Ok(())
    }
}

// ── SinkContext ──────────────────────────────────────────────────

/// Per-sink write parameters, owned by the display task.
#[derive(Debug, Clone, Copy)]
pub struct SinkContext {
    frame_size: usize,
}

impl SinkContext {
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            frame_size: geometry.frame_size(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// The part of `payload` written to the sink: exactly one frame.
    pub fn frame_bytes<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        &payload[..payload.len().min(self.frame_size)]
    }
}

// ── FrameSink ────────────────────────────────────────────────────

/// Destination for presented frames.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one raw frame.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), FramelinkError>;

    /// Whether the sink still accepts frames.
    fn is_ready(&mut self) -> bool {
        true
    }
}

/// Discards every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl FrameSink for NullSink {
    async fn write_frame(&mut self, _frame: &[u8]) -> Result<(), FramelinkError> {
        Ok(())
    }
}

/// Pipes frames into the stdin of an external viewer process.
#[derive(Debug)]
pub struct PipeSink {
    child: Child,
    stdin: ChildStdin,
    program: String,
}

impl PipeSink {
    /// Launch `program` with `args`, its stdin connected to the sink.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, FramelinkError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FramelinkError::Sink(format!("failed to start {program}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FramelinkError::Sink(format!("{program} has no stdin pipe")))?;
        info!("started viewer: {program} {}", args.join(" "));
        Ok(Self {
            child,
            stdin,
            program: program.to_string(),
        })
    }
}

#[async_trait]
impl FrameSink for PipeSink {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), FramelinkError> {
        self.stdin
            .write_all(frame)
            .await
            .map_err(|e| FramelinkError::Sink(format!("{}: {e}", self.program)))
    }

    fn is_ready(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("{} exited: {status}", self.program);
                false
            }
            Err(e) => {
                warn!("{}: {e}", self.program);
                false
            }
        }
    }
}
