//! framelink-receiver: entry point.
//!
//! ```text
//! framelink-receiver                         Listen on the default port, no display
//! framelink-receiver -p 5577                 Listen on port 5577
//! framelink-receiver -w 640 -h 480 --ff      Show 640x480 frames in ffplay
//! framelink-receiver --ff -fs -loglevel quiet
//!                                            Everything after --ff goes to ffplay
//! framelink-receiver --config <path>         Use custom config TOML
//! framelink-receiver --gen-config            Dump default config and exit
//! framelink-receiver --gen-config <path>     Write default config to a file
//! ```

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use framelink_receiver::config::ReceiverConfig;
use framelink_receiver::service::ReceiverService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "framelink-receiver",
    about = "Receive paced frames and show them in an external viewer",
    disable_help_flag = true
)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "framelink-receiver.toml")]
    config: PathBuf,

    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Frame width in pixels.
    #[arg(short, long)]
    width: Option<u32>,

    /// Frame height in pixels.
    #[arg(short = 'h', long)]
    height: Option<u32>,

    /// Bits per pixel.
    #[arg(long)]
    bpp: Option<u32>,

    /// Viewer pixel format.
    #[arg(long = "pf")]
    pixel_format: Option<String>,

    /// Display rate; keep it around twice the producer's frame rate.
    #[arg(short, long)]
    fps: Option<f64>,

    /// Present frames on a timer instead of on DISPLAY_NOW.
    #[arg(long)]
    timer: bool,

    /// Raw reference image to verify payloads against; repeatable.
    #[arg(long = "reference")]
    references: Vec<PathBuf>,

    /// Write a JSON counter file on every DISPLAY_NOW.
    #[arg(long)]
    stats_file: Option<String>,

    /// Show frames in the viewer. Every argument after this one is
    /// passed to the viewer unchanged.
    #[arg(long = "ff", num_args = 0.., allow_hyphen_values = true, value_name = "VIEWER_ARGS")]
    ff: Option<Vec<String>>,

    /// Write the default configuration to PATH, or to stdout when no
    /// path is given, and exit.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    gen_config: Option<Option<PathBuf>>,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    fn apply(self, config: &mut ReceiverConfig) {
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(width) = self.width {
            config.geometry.width = width;
        }
        if let Some(height) = self.height {
            config.geometry.height = height;
        }
        if let Some(bpp) = self.bpp {
            config.geometry.bits_per_pixel = bpp;
        }
        if let Some(pf) = self.pixel_format {
            config.viewer.pixel_format = pf;
        }
        if let Some(fps) = self.fps {
            config.display.fps = fps;
        }
        if self.timer {
            config.display.mode = framelink_core::DisplayMode::Timer;
        }
        if !self.references.is_empty() {
            config.verify.reference_images = self.references;
        }
        if let Some(path) = self.stats_file {
            config.stats.file = path;
        }
        if let Some(args) = self.ff {
            config.display.enabled = true;
            config.viewer.extra_args = args;
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.gen_config {
        Some(Some(path)) => {
            ReceiverConfig::write_default(path)?;
            println!("wrote default config to {}", path.display());
            return Ok(());
        }
        Some(None) => {
            let text = toml::to_string_pretty(&ReceiverConfig::default())?;
            println!("{text}");
            return Ok(());
        }
        None => {}
    }

    let mut config = ReceiverConfig::load(&cli.config);
    cli.apply(&mut config);
    config.validate()?;

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("framelink-receiver v{}", env!("CARGO_PKG_VERSION"));
    info!("port: {}", config.network.port);
    info!(
        "frame: {}x{} @ {} bpp",
        config.geometry.width, config.geometry.height, config.geometry.bits_per_pixel
    );
    if config.display.enabled {
        info!(
            "viewer: {} {}",
            config.viewer.program,
            config.viewer_args().join(" ")
        );
    }

    let service = ReceiverService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
