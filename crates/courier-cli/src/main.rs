//! Courier CLI entry point.

use clap::Parser;
use courier_queue::MessageQueue;
use tracing_subscriber::{fmt, EnvFilter};

use courier_cli::cli::Cli;
use courier_cli::commands;

fn main() {
    // Load .env.local if it exists (for COURIER_STATE_DIR etc.)
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().to_string()));

    fmt().with_env_filter(filter).with_target(false).init();

    let queue = MessageQueue::open(cli.state_dir(), cli.queue_config());

    if let Err(e) = commands::execute(cli.command, &queue) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
