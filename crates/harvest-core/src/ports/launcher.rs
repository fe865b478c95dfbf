//! Launcher port: how the dispatcher starts one worker.

use async_trait::async_trait;

use crate::error::HarvestError;

/// How a launched worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    /// Non-zero exit. `code` is `None` when the process was killed by a signal.
    Failed { code: Option<i32> },
}

impl WorkerExit {
    pub fn is_success(self) -> bool {
        matches!(self, WorkerExit::Success)
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start one worker and wait for it to finish.
    ///
    /// `target` is the discovery target in list mode and `None` when the worker
    /// should claim from the backlog. An `Err` means the worker could not be
    /// started at all.
    async fn run(&self, target: Option<&str>) -> Result<WorkerExit, HarvestError>;
}
