//! Configuration for the frame producer.

use std::path::{Path, PathBuf};

use framelink_core::{BackpressureConfig, ConnectionInfo, FramelinkError, SendMode, check_fps};
use serde::{Deserialize, Serialize};

/// Port a receiver listens on when none is given.
pub const DEFAULT_PORT: u16 = 5569;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Pacing and send behaviour.
    pub stream: StreamConfig,
    /// Receivers to fan frames out to.
    pub receivers: Vec<ReceiverAddr>,
    /// Bound on unacknowledged frames per receiver.
    pub backpressure: BackpressureConfig,
    /// Where frame payloads come from.
    pub frames: FramesConfig,
    /// Diagnostics output.
    pub stats: StatsConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frames to send; 0 streams until interrupted.
    pub repeat_count: u64,
    /// Target frames per second.
    pub fps: f64,
    /// Whether image sends wait for the socket flush.
    pub send_mode: SendMode,
    /// How long to keep collecting ACKs after the last frame.
    pub linger_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverAddr {
    pub ip: String,
    pub port: u16,
}

/// Frame payload source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramesConfig {
    /// Raw image files, sent in turn. Empty means generated frames.
    pub files: Vec<PathBuf>,
    /// Size of generated frames.
    pub width: u32,
    pub height: u32,
    /// Distinct generated frames cycled through.
    pub generated_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// JSON counter file rewritten after every frame. Empty disables it.
    pub file: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            receivers: vec![ReceiverAddr::default()],
            backpressure: BackpressureConfig::default(),
            frames: FramesConfig::default(),
            stats: StatsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            repeat_count: 100,
            fps: 30.0,
            send_mode: SendMode::NonBlocking,
            linger_ms: 1000,
        }
    }
}

impl Default for ReceiverAddr {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for FramesConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            width: 1024,
            height: 768,
            generated_count: 5,
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

impl ProducerConfig {
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

    /// Replace the receiver list with `-i`/`-p` pairs from the command
    /// line, matched by position.
    ///
    /// With no `-i` given, the ports are applied to the default address.
    /// With no `-p` given, every address uses [`DEFAULT_PORT`].
    pub fn set_receivers(&mut self, ips: &[String], ports: &[u16]) -> Result<(), FramelinkError> {
        let receivers = match (ips.is_empty(), ports.is_empty()) {
            (true, true) => return Ok(()),
            (true, false) => ports
                .iter()
                .map(|&port| ReceiverAddr {
                    port,
                    ..Default::default()
                })
                .collect(),
            (false, true) => ips
                .iter()
                .map(|ip| ReceiverAddr {
                    ip: ip.clone(),
                    port: DEFAULT_PORT,
                })
                .collect(),
            (false, false) => {
                if ips.len() != ports.len() {
                    return Err(FramelinkError::Config(format!(
                        "{} addresses but {} ports; each -i needs a matching -p",
                        ips.len(),
                        ports.len()
                    )));
                }
                ips.iter()
                    .zip(ports)
                    .map(|(ip, &port)| ReceiverAddr {
                        ip: ip.clone(),
                        port,
                    })
                    .collect()
            }
        };
        self.receivers = receivers;
        Ok(())
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), FramelinkError> {
        check_fps(self.stream.fps)?;
        if self.receivers.is_empty() {
            return Err(FramelinkError::Config("no receivers configured".into()));
        }
        if let Some(r) = self.receivers.iter().find(|r| r.port == 0) {
            return Err(FramelinkError::Config(format!(
                "receiver {} has port 0",
                r.ip
            )));
        }
        self.backpressure.validate()?;
        if self.frames.files.is_empty()
            && (self.frames.width == 0 || self.frames.height == 0 || self.frames.generated_count == 0)
        {
            return Err(FramelinkError::Config(
                "generated frames need a non-zero size and count".into(),
            ));
        }
        Ok(())
    }

    /// Connection targets, in configuration order.
    pub fn receiver_infos(&self) -> Vec<ConnectionInfo> {
        self.receivers
            .iter()
            .map(|r| ConnectionInfo::new(r.ip.clone(), r.port))
            .collect()
    }

    pub fn stats_path(&self) -> Option<PathBuf> {
        (!self.stats.file.is_empty()).then(|| PathBuf::from(&self.stats.file))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::BackpressurePolicy;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ProducerConfig::default()).unwrap();
        assert!(text.contains("repeat_count"));
        assert!(text.contains("fps"));
        assert!(text.contains("send_mode = \"non_blocking\""));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&ProducerConfig::default()).unwrap();
        let parsed: ProducerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.stream.repeat_count, 100);
        assert_eq!(parsed.stream.fps, 30.0);
        assert_eq!(parsed.receivers, vec![ReceiverAddr::default()]);
        assert_eq!(parsed.backpressure.limit, 4);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: ProducerConfig = toml::from_str(
            r#"
            [stream]
            fps = 60.0

            [backpressure]
            policy = "evict_oldest"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.stream.fps, 60.0);
        assert_eq!(parsed.stream.repeat_count, 100);
        assert_eq!(parsed.backpressure.policy, BackpressurePolicy::EvictOldest);
        assert_eq!(parsed.backpressure.limit, 4);
    }

    #[test]
    fn receivers_pair_by_position() {
        let mut cfg = ProducerConfig::default();
        cfg.set_receivers(&["10.0.0.1".into(), "10.0.0.2".into()], &[5569, 5570])
            .unwrap();
        let infos: Vec<String> = cfg.receiver_infos().iter().map(|i| i.to_string()).collect();
        assert_eq!(infos, vec!["10.0.0.1:5569", "10.0.0.2:5570"]);
    }

    #[test]
    fn unpaired_receivers_rejected() {
        let mut cfg = ProducerConfig::default();
        let err = cfg
            .set_receivers(&["10.0.0.1".into(), "10.0.0.2".into()], &[5569])
            .unwrap_err();
        assert!(matches!(err, FramelinkError::Config(_)));
    }

    #[test]
    fn port_only_targets_localhost() {
        let mut cfg = ProducerConfig::default();
        cfg.set_receivers(&[], &[6000]).unwrap();
        assert_eq!(cfg.receiver_infos()[0].to_string(), "127.0.0.1:6000");
    }

    #[test]
    fn write_default_then_load() {
        let path = std::env::temp_dir().join(format!("framelink-producer-{}.toml", std::process::id()));
        ProducerConfig::write_default(&path).unwrap();
        let loaded = ProducerConfig::load(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.stream.repeat_count, 100);
        assert_eq!(loaded.receivers[0].port, DEFAULT_PORT);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = ProducerConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.stream.fps = 0.0;
        assert!(cfg.validate().is_err());
        cfg.stream.fps = 1e-20;
        assert!(cfg.validate().is_err());

        let mut cfg = ProducerConfig::default();
        cfg.backpressure.limit = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ProducerConfig::default();
        cfg.receivers.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_stats_file_disables_snapshots() {
        let mut cfg = ProducerConfig::default();
        assert!(cfg.stats_path().is_none());
        cfg.stats.file = "producer_stats.json".into();
        assert_eq!(cfg.stats_path().unwrap(), PathBuf::from("producer_stats.json"));
    }
}
