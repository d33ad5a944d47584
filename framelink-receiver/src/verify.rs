//! Received-payload verification against reference images.
//!
//! Frame names have the form `<label>__<index>`, where the label is the
//! path of the raw file the producer read. When the receiver is given
//! the same files, each received payload is compared byte for byte with
//! the file its label names.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use framelink_core::FramelinkError;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch,
    /// No reference image for this frame's label.
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifyCounters {
    pub matched: u64,
    pub mismatched: u64,
    pub unknown: u64,
}

#[derive(Debug, Default)]
pub struct FrameVerifier {
    references: HashMap<String, Bytes>,
    counters: VerifyCounters,
}

impl FrameVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, FramelinkError> {
        let mut verifier = Self::new();
        for path in paths {
            let path = path.as_ref();
            let data = std::fs::read(path).map_err(|e| {
                FramelinkError::Config(format!("cannot read reference {}: {e}", path.display()))
            })?;
            info!("reference image {} ({} bytes)", path.display(), data.len());
            verifier.insert(path.display().to_string(), data);
        }
        Ok(verifier)
    }

    pub fn insert(&mut self, label: impl Into<String>, data: impl Into<Bytes>) {
        self.references.insert(label.into(), data.into());
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Compare a received frame with its reference and count the result.
    pub fn check(&mut self, name: &str, payload: &[u8]) -> Verdict {
        let label = name.rsplit_once("__").map_or(name, |(label, _)| label);
        let verdict = match self.references.get(label) {
            None => Verdict::Unknown,
            Some(reference) if reference.as_ref() == payload => Verdict::Match,
            Some(_) => Verdict::Mismatch,
        };
        match verdict {
            Verdict::Match => self.counters.matched += 1,
            Verdict::Mismatch => {
                self.counters.mismatched += 1;
                warn!("payload of {name} differs from its reference");
            }
            Verdict::Unknown => {
                self.counters.unknown += 1;
                debug!("no reference for {name}");
            }
        }
        verdict
    }

    pub fn counters(&self) -> VerifyCounters {
        self.counters
    }
}
