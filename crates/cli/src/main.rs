//! ctxguard CLI — the main entry point.
//!
//! Commands:
//! - `resist`      — Score and transform a context with a resistance strategy
//! - `compress`    — Shielded compression of a context
//! - `decompress`  — Restore a compressed state
//! - `reconstruct` — Rebuild a context from a snapshot, with emergency recovery
//! - `score`       — Per-branch importance scores
//! - `config`      — Show, locate or validate configuration
//!
//! Every command reads JSON from a file, or from stdin when given `-`.

use clap::{Parser, Subcommand};
use ctxguard_engine::{CompressionLevel, ResilienceEngine, Strategy};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "ctxguard",
    about = "ctxguard — context resilience for AI agents",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to ~/.ctxguard/config.toml)
    #[arg(short, long, global = true, env = "CTXGUARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score and transform a context
    Resist {
        /// JSON file, or `-` for stdin
        input: String,

        /// Force a strategy (lowMemory, highImportance, balanced, aggressive)
        #[arg(short, long)]
        strategy: Option<Strategy>,

        /// Also compress sensitive fields
        #[arg(long)]
        compress_critical: bool,
    },

    /// Compress a context, shielding sensitive fields
    Compress {
        input: String,

        /// Force a level (none, light, moderate, heavy)
        #[arg(short, long)]
        level: Option<CompressionLevel>,

        #[arg(long)]
        compress_critical: bool,
    },

    /// Restore a compressed state
    Decompress {
        input: String,

        /// Fail instead of passing undecodable entries through
        #[arg(long)]
        strict: bool,
    },

    /// Rebuild a context from a snapshot
    Reconstruct {
        input: String,

        #[arg(long)]
        skip_cache: bool,
    },

    /// Show importance scores of every branch
    Score { input: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the default configuration file
    Default,
    /// Print the config file path
    Path,
    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays valid JSON.
    let filter = if cli.verbose { "debug" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config_path = cli.config.as_deref();
    let engine = || -> Result<ResilienceEngine, Box<dyn std::error::Error>> {
        let config = commands::config_cmd::load(config_path)?;
        Ok(ResilienceEngine::new(config)?)
    };

    match cli.command {
        Commands::Resist {
            input,
            strategy,
            compress_critical,
        } => commands::resist::run(&engine()?, &input, strategy, compress_critical)?,
        Commands::Compress {
            input,
            level,
            compress_critical,
        } => commands::compress::compress(&engine()?, &input, level, compress_critical)?,
        Commands::Decompress { input, strict } => {
            commands::compress::decompress(&engine()?, &input, strict)?
        }
        Commands::Reconstruct { input, skip_cache } => {
            commands::reconstruct::run(&engine()?, &input, skip_cache)?
        }
        Commands::Score { input } => commands::score::run(&engine()?, &input)?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path)?,
            ConfigAction::Default => commands::config_cmd::default_file(),
            ConfigAction::Path => commands::config_cmd::path(config_path),
            ConfigAction::Validate => commands::config_cmd::validate(config_path)?,
        },
    }

    Ok(())
}
