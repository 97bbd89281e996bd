//! Demotape CLI - Command-line interface
//!
//! Runs the streaming server and exposes demo generation, format processing
//! and demo cache maintenance as one-shot commands.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use demotape_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "demotape")]
#[command(about = "Audio demos, protected streaming and download bundles")]
#[command(version)]
struct Cli {
    /// Console log level (RUST_LOG overrides it)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full-detail run log
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    commands::handle_command(cli.command).await
}
