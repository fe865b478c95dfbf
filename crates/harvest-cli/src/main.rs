//! harvest CLI entry point.
//!
//! Parses arguments, initialises logging and hands off to `commands`.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "harvest", version)]
#[command(about = "Distributed fetch-and-process task coordination", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./harvest.toml when present)
    #[arg(short, long, global = true, env = "HARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database URL: sqlite://path or postgres://...
    #[arg(long, global = true, env = "HARVEST_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the schema if it does not exist
    Init,

    /// Admit discoveries from a file (or stdin)
    Admit {
        /// URLs, JSON lines, or a listing export; `-` or absent reads stdin
        file: Option<PathBuf>,
    },

    /// Fetch one listing page and admit every link on it
    Discover {
        /// Listing page URL
        listing_url: String,
    },

    /// Claim and process tasks from the backlog
    Work {
        /// Stop after this many tasks
        #[arg(long)]
        max_tasks: Option<u64>,

        /// Exit as soon as the backlog is empty
        #[arg(long)]
        exit_when_idle: bool,
    },

    /// Run a bounded pool of worker processes
    Dispatch {
        /// Listing pages to visit (with --backlog: worker launches, 0 = until drained)
        max_targets: usize,

        /// Workers running at once (defaults to dispatcher.concurrency)
        concurrency: Option<usize>,

        /// Launch `work` processes against the backlog instead of visiting listings
        #[arg(long)]
        backlog: bool,

        /// Listing root (defaults to dispatcher.base_url)
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Print task, duplicate and result counts as JSON
    Status,

    /// Return claimed tasks to the backlog
    Reset {
        /// Only tasks claimed at least this many seconds ago
        #[arg(long, value_name = "SECS")]
        older_than: Option<u64>,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match commands::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
