//! TOML configuration.
//!
//! Every field has a default, so an absent file and an empty file are equivalent.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;
use crate::app::worker::{DelayRange, WorkerConfig};
use crate::error::HarvestError;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "harvest.toml";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://harvest.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    pub database_url: String,
    pub worker: WorkerSettings,
    pub fetcher: FetcherSettings,
    pub dispatcher: DispatcherSettings,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            worker: WorkerSettings::default(),
            fetcher: FetcherSettings::default(),
            dispatcher: DispatcherSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Politeness pause after every task.
    pub pause_min_ms: u64,
    pub pause_max_ms: u64,
    /// Back-off when the backlog is empty or unreachable.
    pub idle_min_ms: u64,
    pub idle_max_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1500,
            multiplier: 2.0,
            jitter_ms: 1000,
            pause_min_ms: 4000,
            pause_max_ms: 8000,
            idle_min_ms: 2000,
            idle_max_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetcherKind {
    /// Run an external program per target.
    Command,
    /// Plain HTTP GET.
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetcherSettings {
    pub kind: FetcherKind,
    /// Program and leading arguments; the target is appended.
    pub command: Vec<String>,
    /// Exit codes that mean "try again".
    pub transient_exit_codes: Vec<i32>,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            kind: FetcherKind::Http,
            command: Vec::new(),
            // EX_TEMPFAIL
            transient_exit_codes: vec![75],
            timeout_secs: 30,
            user_agent: format!("harvest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetcherSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherSettings {
    /// Root listing page. Page `n > 1` is `{base_url}/{n}`.
    pub base_url: Option<String>,
    pub concurrency: usize,
    /// Child worker argv. Empty means this binary's `discover` subcommand, which
    /// needs a fetcher whose payload carries a `links` array. The `http` fetcher
    /// only does that for JSON endpoints, so HTML listings need `kind = "command"`.
    pub worker_command: Vec<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            concurrency: 5,
            worker_command: Vec::new(),
        }
    }
}

impl HarvestConfig {
    /// Load from `path`, or from `harvest.toml` if it exists, or fall back to defaults.
    /// An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, HarvestError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, HarvestError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&text)
            .map_err(|e| HarvestError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, HarvestError> {
        toml::from_str(text).map_err(|e| HarvestError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        let w = &self.worker;
        if w.max_attempts == 0 {
            return Err(HarvestError::Config("worker.max_attempts must be at least 1".into()));
        }
        if !(w.multiplier.is_finite() && w.multiplier >= 1.0) {
            return Err(HarvestError::Config("worker.multiplier must be >= 1.0".into()));
        }
        if w.pause_min_ms > w.pause_max_ms {
            return Err(HarvestError::Config(
                "worker.pause_min_ms is greater than worker.pause_max_ms".into(),
            ));
        }
        if w.idle_min_ms > w.idle_max_ms {
            return Err(HarvestError::Config(
                "worker.idle_min_ms is greater than worker.idle_max_ms".into(),
            ));
        }
        if self.fetcher.kind == FetcherKind::Command && self.fetcher.command.is_empty() {
            return Err(HarvestError::Config(
                "fetcher.command is required when fetcher.kind = \"command\"".into(),
            ));
        }
        if self.fetcher.timeout_secs == 0 {
            return Err(HarvestError::Config("fetcher.timeout_secs must be at least 1".into()));
        }
        if self.dispatcher.concurrency == 0 {
            return Err(HarvestError::Config(
                "dispatcher.concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let w = &self.worker;
        RetryPolicy {
            max_attempts: w.max_attempts,
            base_delay: Duration::from_millis(w.base_delay_ms),
            multiplier: w.multiplier,
            jitter: Duration::from_millis(w.jitter_ms),
        }
    }

    /// Worker settings with no task limit; the CLI layers its flags on top.
    pub fn worker_config(&self) -> WorkerConfig {
        let w = &self.worker;
        WorkerConfig {
            retry: self.retry_policy(),
            pause: DelayRange::from_millis(w.pause_min_ms, w.pause_max_ms),
            idle: DelayRange::from_millis(w.idle_min_ms, w.idle_max_ms),
            max_tasks: None,
            exit_when_idle: false,
        }
    }
}
