//! Concord CLI - command-line front end for the fan-out coordinator
//!
//! Provides a `concord` command that loads coordinator configuration, runs a
//! prediction across every configured backend, and reports backend status.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{config as config_cmd, predict, status};

/// Concord - fan a prediction out to many backends and compose one answer
#[derive(Parser, Debug)]
#[command(
    name = "concord",
    author,
    version,
    about = "Concord - prediction fan-out coordinator",
    long_about = "Concord sends one prediction request to every configured backend concurrently,\nscores how well they agreed, and returns a single composed response."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file (overrides CONCORD_CONFIG and ./concord.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one prediction across every configured backend
    ///
    /// The input is JSON (an envelope with a `payload` key, or the payload
    /// itself) or free text. Use `-` or omit it to read from stdin.
    Predict {
        /// Request input
        input: Option<String>,

        /// Context object as JSON
        #[arg(long)]
        context: Option<String>,

        /// Per-request backend weight as `id=weight` (repeatable)
        #[arg(long = "weight", value_name = "ID=WEIGHT")]
        weights: Vec<String>,

        /// Do not run the secondary analyzer
        #[arg(long)]
        skip_secondary: bool,

        /// Overall deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Show backend health, circuit state and cache counters
    Status {
        /// Probe every backend before reporting
        #[arg(long)]
        probe: bool,
    },

    /// Print the effective, validated configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = config::load_config(args.config.as_deref())?;

    match args.command {
        Command::Predict { input, context, weights, skip_secondary, deadline_ms } => {
            let options = predict::PredictOptions { context, weights, skip_secondary, deadline_ms };
            predict::execute(config, input, options).await
        }
        Command::Status { probe } => status::execute(config, probe).await,
        Command::Config => config_cmd::execute(&config),
    }
}
