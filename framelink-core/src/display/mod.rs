//! Receiver-side display: a bounded frame queue drained by its own task.

pub mod pipeline;
pub mod sink;

pub use pipeline::{
    DisplayConfig, DisplayHandle, DisplayMode, DisplayPipeline, DisplayStats, PipelineCounters,
};
pub use sink::{FrameGeometry, FrameSink, NullSink, PipeSink, SinkContext};
