use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use convsync_cli::cli::{cache_clear, cache_stats, replay, Script};
use convsync_core::tracing_setup::init_tracing_with_level;
use convsync_core::SyncConfig;
use serde::Serialize;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "convsync")]
#[command(about = "Replay and inspect conversation sync sessions")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short, global = true)]
    pretty: bool,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Path to JSON config file (dataDir, pageSize, fetchTimeoutMs, ...)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted session and print the converged store
    Replay {
        /// Script file (JSON)
        script: PathBuf,
    },

    /// Inspect or clear the on-disk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,

        /// Override the data directory holding the cache file
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Session key whose entries are counted
        #[arg(long, default_value = "default")]
        session: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry counts
    Stats,
    /// Remove every session's entries
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing_with_level(if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    });

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Commands::Replay { script } => {
            let script = Script::load(&script)?;
            let output = replay(script, &config).await?;
            print_json(&output, cli.pretty)
        }
        Commands::Cache {
            action,
            data_dir,
            session,
        } => {
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            let result = match action {
                CacheAction::Stats => cache_stats(&config, &session)?,
                CacheAction::Clear => cache_clear(&config)?,
            };
            print_json(&result, cli.pretty)
        }
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", output);
    Ok(())
}
