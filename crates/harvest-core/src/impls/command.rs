//! Fetcher that runs an external program per target.
//!
//! The program gets the target as its last argument and must print one JSON
//! document on stdout. Exit status decides the failure class:
//! - 0: stdout is the payload (unparseable stdout is fatal)
//! - a code in `transient_exit_codes`: transient
//! - any other code, or death by signal: fatal
//!
//! Spawn failures and timeouts are transient. stderr is inherited.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::FetcherSettings;
use crate::domain::FetchError;
use crate::error::HarvestError;
use crate::ports::Fetcher;

#[derive(Debug, Clone)]
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
    transient_exit_codes: Vec<i32>,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn new(argv: &[String], timeout: Duration) -> Result<Self, HarvestError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(HarvestError::Config("fetcher command is empty".into()));
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            transient_exit_codes: vec![75],
            timeout,
        })
    }

    pub fn from_settings(settings: &FetcherSettings) -> Result<Self, HarvestError> {
        Ok(Self::new(&settings.command, settings.timeout())?
            .with_transient_exit_codes(settings.transient_exit_codes.clone()))
    }

    pub fn with_transient_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.transient_exit_codes = codes;
        self
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, target: &str) -> Result<serde_json::Value, FetchError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::transient(format!("cannot start {}: {e}", self.program)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(FetchError::transient(format!("waiting for fetcher: {e}"))),
            Err(_) => {
                return Err(FetchError::transient(format!(
                    "fetcher timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        match output.status.code() {
            Some(0) => serde_json::from_slice(&output.stdout)
                .map_err(|e| FetchError::fatal(format!("fetcher printed invalid JSON: {e}"))),
            Some(code) if self.transient_exit_codes.contains(&code) => Err(
                FetchError::transient(format!("fetcher exited with code {code}")),
            ),
            Some(code) => Err(FetchError::fatal(format!("fetcher exited with code {code}"))),
            None => Err(FetchError::fatal("fetcher killed by signal")),
        }
    }
}
