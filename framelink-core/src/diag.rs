//! End-of-run counter files.
//!
//! Both binaries can dump their counters (skips, late frames, missing
//! acks, presents...) as pretty JSON so test harnesses can read them
//! after the process exits.

use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::FramelinkError;

/// Serialize `snapshot` as pretty JSON and write it to `path`,
/// replacing any existing file.
pub fn write_snapshot<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    snapshot: &T,
) -> Result<(), FramelinkError> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| FramelinkError::Config(format!("failed to serialize stats: {e}")))?;
    std::fs::write(path, json)?;
    info!("stats written to {}", path.display());
    Ok(())
}
