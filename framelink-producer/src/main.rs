//! framelink-producer: entry point.
//!
//! ```text
//! framelink-producer                          Stream 100 frames at 30 fps to 127.0.0.1:5569
//! framelink-producer -i 10.0.0.2 -p 5569      Choose the receiver
//! framelink-producer -i A -p 5569 -i B -p 5570
//!                                             Fan out to two receivers (paired by position)
//! framelink-producer -r 0 -f 60               Stream at 60 fps until Ctrl-C
//! framelink-producer --config <path>          Load a custom config TOML
//! framelink-producer --gen-config             Write default config to stdout
//! framelink-producer --gen-config <path>      Write default config to a file
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use framelink_core::SendMode;
use framelink_producer::config::ProducerConfig;
use framelink_producer::service::ProducerService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "framelink-producer",
    about = "Stream raw image frames to framelink receivers at a fixed rate"
)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "framelink-producer.toml")]
    config: PathBuf,

    /// Frames to send (0 = until interrupted).
    #[arg(short = 'r', long)]
    repeat_count: Option<u64>,

    /// Target frames per second.
    #[arg(short = 'f', long)]
    fps: Option<f64>,

    /// Receiver address; repeat for several receivers.
    #[arg(short = 'i', long = "ip")]
    ips: Vec<String>,

    /// Receiver port, paired with the `-i` at the same position.
    #[arg(short = 'p', long = "port")]
    ports: Vec<u16>,

    /// Wait for each image send to be flushed before continuing.
    #[arg(long)]
    blocking: bool,

    /// Raw image files to send in turn (replaces the configured list).
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// Write a JSON counter file after every frame.
    #[arg(long)]
    stats_file: Option<String>,

    /// Write the default configuration to PATH, or to stdout when no
    /// path is given, and exit.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    gen_config: Option<Option<PathBuf>>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    match &cli.gen_config {
        Some(Some(path)) => {
            ProducerConfig::write_default(path)?;
            println!("wrote default config to {}", path.display());
            return Ok(());
        }
        Some(None) => {
            let text = toml::to_string_pretty(&ProducerConfig::default())?;
            println!("{text}");
            return Ok(());
        }
        None => {}
    }

    // Load config, then apply command-line overrides.
    let mut config = ProducerConfig::load(&cli.config);
    if let Some(r) = cli.repeat_count {
        config.stream.repeat_count = r;
    }
    if let Some(fps) = cli.fps {
        config.stream.fps = fps;
    }
    if cli.blocking {
        config.stream.send_mode = SendMode::Blocking;
    }
    if !cli.images.is_empty() {
        config.frames.files = cli.images;
    }
    if let Some(path) = cli.stats_file {
        config.stats.file = path;
    }
    config.set_receivers(&cli.ips, &cli.ports)?;
    config.validate()?;

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("framelink-producer v{}", env!("CARGO_PKG_VERSION"));
    for r in &config.receivers {
        info!("receiver: {}:{}", r.ip, r.port);
    }
    info!(
        "repeat count: {}, fps: {}, send mode: {:?}",
        config.stream.repeat_count, config.stream.fps, config.stream.send_mode
    );

    let service = ProducerService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, finishing the current frame");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
