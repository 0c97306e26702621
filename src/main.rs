use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use hotmod::{Daemon, DaemonOptions, WatcherKind};

#[derive(Parser)]
#[command(name = "hotmod")]
#[command(about = "Run a Rust library unit and hot-reload it when it changes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Entry unit (library path or bare library name)
    #[arg(short, long)]
    file: String,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Change source
    #[arg(short, long, value_enum, default_value_t = WatcherKind::Fs)]
    watcher: WatcherKind,

    /// Import once and never watch for changes
    #[arg(long)]
    no_watch: bool,

    /// Override the watcher debounce window
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(format!("hotmod={log_level}"))
        .with_target(false)
        .init();

    info!("🦀 Starting hotmod v{}", env!("CARGO_PKG_VERSION"));

    let options = DaemonOptions {
        file: cli.file,
        config_path: cli.config,
        watcher: cli.watcher,
        no_watch: cli.no_watch,
        debounce_ms: cli.debounce_ms,
    };

    match Daemon::new(options).await {
        Ok(mut daemon) => {
            if let Err(e) = daemon.run().await {
                error!("❌ Daemon error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to create daemon: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
