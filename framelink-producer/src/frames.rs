//! Frame payloads for the paced loop.
//!
//! Frames come either from raw image files on disk or from a set of
//! generated grayscale gradients. Either way the source is a fixed list
//! cycled by frame index, and every sent frame gets a unique name of the
//! form `<label>__<index>` so ACKs and display requests can refer to it.

use std::path::Path;

use bytes::Bytes;
use framelink_core::FramelinkError;
use tracing::info;

use crate::config::FramesConfig;

/// Separator between a frame's source label and its index.
pub const NAME_SEPARATOR: &str = "__";

/// Build the wire name of frame `index` from source `label`.
pub fn frame_name(label: &str, index: u64) -> String {
    format!("{label}{NAME_SEPARATOR}{index}")
}

#[derive(Debug, Clone)]
struct SourceFrame {
    label: String,
    data: Bytes,
}

/// Fixed list of payloads cycled by frame index.
#[derive(Debug, Clone)]
pub struct FrameSource {
    frames: Vec<SourceFrame>,
}

impl FrameSource {
    pub fn from_config(config: &FramesConfig) -> Result<Self, FramelinkError> {
        if config.files.is_empty() {
            Self::gradients(config.width, config.height, config.generated_count)
        } else {
            Self::from_files(&config.files)
        }
    }

    /// Load raw image files. The label of each frame is the path as given.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, FramelinkError> {
        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let data = std::fs::read(path).map_err(|e| {
                FramelinkError::Config(format!("cannot read frame {}: {e}", path.display()))
            })?;
            info!("loaded {} ({} bytes)", path.display(), data.len());
            frames.push(SourceFrame {
                label: path.display().to_string(),
                data: Bytes::from(data),
            });
        }
        if frames.is_empty() {
            return Err(FramelinkError::Config("no frame files given".into()));
        }
        Ok(Self { frames })
    }

    /// `count` 8-bit grayscale frames of `width` x `height`, each a
    /// horizontal gradient shifted by its position in the cycle.
    pub fn gradients(width: u32, height: u32, count: usize) -> Result<Self, FramelinkError> {
        if width == 0 || height == 0 || count == 0 {
            return Err(FramelinkError::Config(
                "generated frames need a non-zero size and count".into(),
            ));
        }
        let (w, h) = (width as usize, height as usize);
        let frames = (0..count)
            .map(|n| {
                let offset = n * 256 / count;
                let mut data = Vec::with_capacity(w * h);
                for _ in 0..h {
                    data.extend((0..w).map(|x| ((x * 256 / w + offset) % 256) as u8));
                }
                SourceFrame {
                    label: format!("gradient-{n}"),
                    data: Bytes::from(data),
                }
            })
            .collect();
        Ok(Self { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Name and payload of frame `index`. The payload shares the source
    /// buffer, so this is cheap to call once per frame.
    pub fn frame(&self, index: u64) -> (String, Bytes) {
        let source = &self.frames[(index % self.frames.len() as u64) as usize];
        (frame_name(&source.label, index), source.data.clone())
    }
}
