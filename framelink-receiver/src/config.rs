//! Receiver configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use framelink_core::{DisplayConfig, DisplayMode, FrameGeometry, FramelinkError};
use serde::{Deserialize, Serialize};

/// Port the receiver listens on when none is given.
pub const DEFAULT_PORT: u16 = 5569;

/// Top-level configuration for the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Size of the raw frames being streamed.
    pub geometry: FrameGeometry,
    /// Display queue and pacing.
    pub display: DisplaySettings,
    /// External viewer the frames are piped into.
    pub viewer: ViewerConfig,
    /// Payload verification against known images.
    pub verify: VerifyConfig,
    /// Diagnostics output.
    pub stats: StatsConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Display settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Queue frames and write them to the viewer.
    pub enabled: bool,
    /// Display task tick rate. About twice the producer's rate works well.
    pub fps: f64,
    /// Frames held before the oldest is dropped.
    pub capacity: usize,
    pub mode: DisplayMode,
}

/// External viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub program: String,
    pub pixel_format: String,
    /// Extra arguments placed before the input selection.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Raw files the producer sends; received payloads are compared
    /// against the file their name refers to.
    pub reference_images: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// JSON counter file rewritten on every DISPLAY_NOW. Empty disables it.
    pub file: String,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            geometry: FrameGeometry::default(),
            display: DisplaySettings::default(),
            viewer: ViewerConfig::default(),
            verify: VerifyConfig::default(),
            stats: StatsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            fps: 60.0,
            capacity: 2,
            mode: DisplayMode::Signal,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            program: "ffplay".into(),
            pixel_format: "gray".into(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ReceiverConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn validate(&self) -> Result<(), FramelinkError> {
        self.listen_addr()?;
        self.display_config().validate()?;
        if self.display.enabled && self.viewer.program.is_empty() {
            return Err(FramelinkError::Config("viewer program is empty".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, FramelinkError> {
        format!("{}:{}", self.network.bind_address, self.network.port)
            .parse()
            .map_err(|e| {
                FramelinkError::Config(format!(
                    "bad listen address {}:{}: {e}",
                    self.network.bind_address, self.network.port
                ))
            })
    }

    /// Settings for the display pipeline.
    pub fn display_config(&self) -> DisplayConfig {
        DisplayConfig {
            capacity: self.display.capacity,
            fps: self.display.fps,
            mode: self.display.mode,
            geometry: self.geometry,
        }
    }

    /// Arguments for the viewer so it reads raw frames from stdin.
    pub fn viewer_args(&self) -> Vec<String> {
        let g = &self.geometry;
        let mut args: Vec<String> = [
            "-f",
            "rawvideo",
            "-vcodec",
            "rawvideo",
            "-pixel_format",
            &self.viewer.pixel_format,
            "-framerate",
            &self.display.fps.to_string(),
            "-video_size",
            &format!("{}x{}", g.width, g.height),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(self.viewer.extra_args.iter().cloned());
        args.extend(["-i".to_string(), "-".to_string()]);
        args
    }

    pub fn stats_path(&self) -> Option<PathBuf> {
        (!self.stats.file.is_empty()).then(|| PathBuf::from(&self.stats.file))
    }
}

// ── Tests ────────────────────────────────────────────────────────
