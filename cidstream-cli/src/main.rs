//! cidstream CLI - Command-line interface
//!
//! Provides command-line access to provider validation, chunk fetching and
//! headless playback sessions.

mod commands;
mod player;

use std::path::PathBuf;

use anyhow::Context;
use cidstream_core::CidStreamConfig;
use cidstream_core::tracing_setup::{CliLogLevel, init_tracing};
use clap::Parser;

#[derive(Parser)]
#[command(name = "cidstream")]
#[command(about = "Stream CID-addressed video across HTTP gateways")]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace log of this run
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// Skip the trace log file
    #[arg(long, global = true)]
    no_log_file: bool,

    /// Directory holding persisted invalid-CID and provider state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_dir = (!cli.no_log_file).then_some(cli.log_dir.as_path());
    init_tracing(cli.log_level.as_tracing_level(), log_dir)
        .context("failed to initialize logging")?;

    let mut config = CidStreamConfig::from_env();
    if let Some(state_dir) = cli.state_dir {
        config.storage.state_dir = state_dir;
    }

    if let Err(e) = commands::handle_command(cli.command, config).await {
        tracing::debug!("Command failed: {:?}", e);
        anyhow::bail!("{}: {}", e.user_message(), e);
    }

    Ok(())
}
