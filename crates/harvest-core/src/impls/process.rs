//! Launcher that runs each worker as a child process.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::HarvestError;
use crate::ports::{Launcher, WorkerExit};

/// Spawns `program args... [target]` with inherited stdout and stderr.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_argv(argv: &[String]) -> Result<Self, HarvestError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarvestError::Config("worker command is empty".into()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn run(&self, target: Option<&str>) -> Result<WorkerExit, HarvestError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(target) = target {
            command.arg(target);
        }

        let mut child = command
            .spawn()
            .map_err(|e| HarvestError::Launch(format!("{}: {e}", self.program)))?;
        let status = child.wait().await?;

        Ok(if status.success() {
            WorkerExit::Success
        } else {
            WorkerExit::Failed {
                code: status.code(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessLauncher {
        ProcessLauncher::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        )
    }

    #[tokio::test]
    async fn exit_status_maps_to_worker_exit() {
        assert_eq!(sh("exit 0").run(None).await.unwrap(), WorkerExit::Success);
        assert_eq!(
            sh("exit 3").run(None).await.unwrap(),
            WorkerExit::Failed { code: Some(3) }
        );
    }

    #[tokio::test]
    async fn target_is_appended() {
        let launcher = sh(r#"test "$1" = "https://x/p/2""#);
        assert!(launcher.run(Some("https://x/p/2")).await.unwrap().is_success());
        assert!(!launcher.run(Some("https://x/p/3")).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let launcher = ProcessLauncher::new("/nonexistent/harvest-worker", Vec::new());
        assert!(matches!(
            launcher.run(None).await,
            Err(HarvestError::Launch(_))
        ));
    }
}
