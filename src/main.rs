//! kloak - Wayland input anonymization daemon
//!
//! Entry point for the daemon binary.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kloak::config::{Config, DEFAULT_MAX_DELAY_MS, DEFAULT_SEAT};

/// Command-line arguments for kloak
#[derive(Parser, Debug)]
#[command(name = "kloak")]
#[command(version, about = "Anti-keystroke-deanonymization input daemon for Wayland", long_about = None)]
pub struct Args {
    /// Upper bound on the randomized event delay, in milliseconds
    #[arg(long, default_value_t = DEFAULT_MAX_DELAY_MS)]
    pub max_delay: u64,

    /// udev seat whose input devices are captured
    #[arg(long, default_value = DEFAULT_SEAT)]
    pub seat: String,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(
        "kloak v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let config = Config {
        max_delay_ms: args.max_delay,
        seat: args.seat.clone(),
    };

    if let Err(error) = kloak::daemon::run(config) {
        eprintln!("FATAL ERROR: {error:#}");
        return Err(error);
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kloak={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
