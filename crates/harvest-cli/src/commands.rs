//! Subcommand handlers.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use harvest_core::HarvestConfig;
use harvest_core::config::FetcherKind;
use harvest_core::app::discovery::{fetch_listing, listing_targets, parse_discoveries};
use harvest_core::app::{DedupTracker, Dispatcher, WorkSource, Worker, snapshot};
use harvest_core::impls::{ProcessLauncher, Stores, build_fetcher, open_stores};
use harvest_core::ports::BacklogStore;

use crate::{Cli, Command};

/// Flags every child process must see to talk to the same store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildGlobals {
    pub config: Option<PathBuf>,
    pub database_url: Option<String>,
    pub verbose: bool,
}

impl ChildGlobals {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            database_url: cli.database_url.clone(),
            verbose: cli.verbose,
        }
    }

    /// `[--config X] [--database-url Y] [--verbose] <subcommand...>`
    pub fn argv(&self, subcommand: &[&str]) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(config) = &self.config {
            argv.push("--config".to_string());
            argv.push(config.display().to_string());
        }
        if let Some(url) = &self.database_url {
            argv.push("--database-url".to_string());
            argv.push(url.clone());
        }
        if self.verbose {
            argv.push("--verbose".to_string());
        }
        argv.extend(subcommand.iter().map(|s| s.to_string()));
        argv
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = HarvestConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    let globals = ChildGlobals::from_cli(&cli);

    match cli.command {
        Command::Init => init(&config).await,
        Command::Admit { file } => admit(&config, file.as_deref()).await,
        Command::Discover { listing_url } => discover(&config, &listing_url).await,
        Command::Work {
            max_tasks,
            exit_when_idle,
        } => work(&config, max_tasks, exit_when_idle).await,
        Command::Dispatch {
            max_targets,
            concurrency,
            backlog,
            base_url,
        } => {
            dispatch(
                &config,
                &globals,
                max_targets,
                concurrency,
                backlog,
                base_url,
            )
            .await
        }
        Command::Status => status(&config).await,
        Command::Reset { older_than } => reset(&config, older_than).await,
    }
}

async fn stores(config: &HarvestConfig) -> anyhow::Result<Stores> {
    open_stores(&config.database_url)
        .await
        .with_context(|| format!("opening store at {}", config.database_url))
}

async fn init(config: &HarvestConfig) -> anyhow::Result<ExitCode> {
    stores(config).await?;
    tracing::info!(database_url = %config.database_url, "schema ready");
    Ok(ExitCode::SUCCESS)
}

async fn admit(config: &HarvestConfig, file: Option<&Path>) -> anyhow::Result<ExitCode> {
    let text = match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        _ => std::io::read_to_string(std::io::stdin()).context("reading stdin")?,
    };
    let discoveries = parse_discoveries(&text)?;

    let stores = stores(config).await?;
    let tracker = DedupTracker::new(stores.backlog, stores.duplicates);
    let report = tracker.admit_all(discoveries).await?;

    println!("{}", serde_json::to_string(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn discover(config: &HarvestConfig, listing_url: &str) -> anyhow::Result<ExitCode> {
    let fetcher = build_fetcher(&config.fetcher)?;
    let links = fetch_listing(fetcher.as_ref(), listing_url, &config.retry_policy())
        .await
        .with_context(|| format!("fetching listing {listing_url}"))?;

    let stores = stores(config).await?;
    let tracker = DedupTracker::new(stores.backlog, stores.duplicates);
    tracker.admit_all(links).await?;
    Ok(ExitCode::SUCCESS)
}

async fn work(
    config: &HarvestConfig,
    max_tasks: Option<u64>,
    exit_when_idle: bool,
) -> anyhow::Result<ExitCode> {
    let stores = stores(config).await?;
    let fetcher = build_fetcher(&config.fetcher)?;

    let mut worker_config = config.worker_config();
    worker_config.max_tasks = max_tasks;
    worker_config.exit_when_idle = exit_when_idle;
    let worker = Worker::new(stores.backlog, stores.results, fetcher, worker_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing current task");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = worker.run(shutdown_rx).await;
    Ok(if report.errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn dispatch(
    config: &HarvestConfig,
    globals: &ChildGlobals,
    max_targets: usize,
    concurrency: Option<usize>,
    backlog: bool,
    base_url: Option<String>,
) -> anyhow::Result<ExitCode> {
    let concurrency = concurrency.unwrap_or(config.dispatcher.concurrency);
    if concurrency == 0 {
        bail!("concurrency must be at least 1");
    }
    let exe = std::env::current_exe().context("locating the harvest binary")?;
    let exe = exe.display().to_string();

    let report = if backlog {
        let launcher = ProcessLauncher::new(exe, globals.argv(&["work", "--exit-when-idle"]));
        let launches = (max_targets > 0).then_some(max_targets);
        let mut dispatcher = Dispatcher::new(Arc::new(launcher), concurrency);
        if launches.is_none() {
            let watched: Arc<dyn BacklogStore> = stores(config).await?.backlog;
            dispatcher = dispatcher.with_backlog(watched);
        }
        dispatcher.run(WorkSource::Backlog { launches }).await?
    } else {
        let Some(base) = base_url.or_else(|| config.dispatcher.base_url.clone()) else {
            bail!("no listing root: pass --base-url or set dispatcher.base_url");
        };
        let launcher = if config.dispatcher.worker_command.is_empty() {
            if config.fetcher.kind == FetcherKind::Http {
                tracing::warn!(
                    "discover children use the http fetcher; \
                     listings must be JSON with a \"links\" array"
                );
            }
            ProcessLauncher::new(exe, globals.argv(&["discover"]))
        } else {
            ProcessLauncher::from_argv(&config.dispatcher.worker_command)?
        };
        let targets = listing_targets(&base, max_targets);
        Dispatcher::new(Arc::new(launcher), concurrency)
            .run(WorkSource::Targets(targets))
            .await?
    };

    for failed in &report.failed {
        tracing::warn!(
            target_url = ?failed.target,
            reason = %failed.reason,
            "worker did not succeed"
        );
    }
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn status(config: &HarvestConfig) -> anyhow::Result<ExitCode> {
    let stores = stores(config).await?;
    let snapshot = snapshot(&stores).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(ExitCode::SUCCESS)
}

/// `now - older_than`, or `None` (every claim) when no age is given.
fn reset_cutoff(
    now: DateTime<Utc>,
    older_than: Option<u64>,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    let Some(secs) = older_than else {
        return Ok(None);
    };
    let cutoff = i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| now.checked_sub_signed(age))
        .context("--older-than is out of range")?;
    Ok(Some(cutoff))
}

async fn reset(config: &HarvestConfig, older_than: Option<u64>) -> anyhow::Result<ExitCode> {
    let cutoff = reset_cutoff(Utc::now(), older_than)?;

    let stores = stores(config).await?;
    let released = stores.backlog.reset_claims(cutoff).await?;
    tracing::info!(released, "claims reset");
    println!("{}", serde_json::json!({ "released": released }));
    Ok(ExitCode::SUCCESS)
}
