//! shellwright
//!
//! Applies a manifest of command, run and copy resources, locally or on
//! remote hosts over SSH

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use shellwright_core::Engine;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod apply;
mod config;
mod state;

use config::Config;
use state::State;

#[derive(Parser)]
#[command(name = "shellwright")]
#[command(about = "Declarative local and remote command execution", long_about = None)]
struct Cli {
    /// Manifest to apply (defaults to shellwright.toml in the usual places)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Validate and report without running anything
    #[arg(long, global = true)]
    preview: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update every declared resource
    Apply,
    /// Run the delete command of every applied resource
    Destroy,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let config = Config::load_default(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let preview = cli.preview
        || config.preview
        || std::env::var("SHELLWRIGHT_PREVIEW").is_ok_and(|v| v == "1" || v == "true");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling running commands");
                cancel.cancel();
            }
        }
    });

    let engine = Engine::new(config.engine.clone());
    let mut state = State::load(&config.state_path)?;

    let outcome = match cli.command {
        Commands::Apply => apply::apply(&engine, &config, &mut state, preview, &cancel).await,
        Commands::Destroy => {
            apply::destroy(&engine, &config, &mut state, preview, &cancel).await
        }
    };

    // progress made before a failure is kept
    if !preview {
        state.save(&config.state_path)?;
    }

    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
