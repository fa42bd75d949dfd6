//! Palisade - command-line client with resilient session handling
//!
//! Main entry point for the Palisade CLI.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use palisade_session::SessionConfig;

mod commands;

use commands::{logout, request, session, status};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Palisade - command-line client with resilient session handling
#[derive(Parser)]
#[command(name = "palisade")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Server URL (overrides the config file)
    #[arg(long, global = true, env = "PALISADE_SERVER_URL")]
    pub server: Option<String>,

    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true, env = "PALISADE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding config, the stored session and logs (default: <config dir>/palisade)
    #[arg(long, global = true, env = "PALISADE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send an authenticated request
    Request(request::RequestArgs),

    /// Show session status
    Status(status::StatusArgs),

    /// Manage the stored session
    Session(session::SessionArgs),

    /// End the session and clear stored tokens
    Logout(logout::LogoutArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| dirs::config_dir().map(|d| d.join("palisade")))
        .unwrap_or_else(|| PathBuf::from(".palisade"));

    // Initialize tracing: console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "palisade=debug,palisade_session=debug,info"
    } else {
        "palisade=info,palisade_session=warn,warn"
    };

    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "palisade.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "palisade=trace,palisade_session=trace,info",
                )),
        )
        .init();

    let mut config = load_config(cli.config.as_deref(), &data_dir)?;
    if let Some(server) = cli.server {
        config = config.with_base_url(server);
    }

    // Create context for commands
    let ctx = commands::Context {
        config,
        data_dir,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    // Dispatch to command handlers
    match cli.command {
        Commands::Request(args) => request::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Session(args) => session::run(args, &ctx).await,
        Commands::Logout(args) => logout::run(args, &ctx).await,
    }
}

/// An explicit config path must exist; the default one is optional.
fn load_config(explicit: Option<&std::path::Path>, data_dir: &std::path::Path) -> Result<SessionConfig> {
    if let Some(path) = explicit {
        return SessionConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }

    let default_path = data_dir.join("config.toml");
    if default_path.exists() {
        tracing::debug!(path = %default_path.display(), "Loading config");
        SessionConfig::load(&default_path)
            .with_context(|| format!("failed to load config from {}", default_path.display()))
    } else {
        Ok(SessionConfig::default())
    }
}
