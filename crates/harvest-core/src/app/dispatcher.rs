//! Dispatcher: keeps up to N workers running over a target list or the backlog.
//!
//! The launch policy lives in [`PoolScheduler`]; this module only turns its
//! decisions into launcher calls and feeds exits back in. A failed worker is
//! logged and counted, never retried, and never stops the run.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;

use super::pool::PoolScheduler;
use crate::domain::DispatchId;
use crate::error::HarvestError;
use crate::ports::{BacklogStore, Launcher, WorkerExit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkSource {
    /// One worker per target, in order.
    Targets(Vec<String>),
    /// Workers claim from the backlog themselves. `None` keeps launching until the
    /// backlog has no unclaimed tasks left.
    Backlog { launches: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedLaunch {
    pub target: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub launched: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedLaunch>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Dispatcher {
    id: DispatchId,
    launcher: Arc<dyn Launcher>,
    concurrency: usize,
    backlog: Option<Arc<dyn BacklogStore>>,
}

type Exit = (Option<String>, Result<WorkerExit, HarvestError>);

impl Dispatcher {
    pub fn new(launcher: Arc<dyn Launcher>, concurrency: usize) -> Self {
        Self {
            id: DispatchId::generate(),
            launcher,
            concurrency: concurrency.max(1),
            backlog: None,
        }
    }

    /// Backlog consulted after each exit in unbounded backlog mode.
    pub fn with_backlog(mut self, backlog: Arc<dyn BacklogStore>) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn id(&self) -> DispatchId {
        self.id
    }

    pub async fn run(&self, source: WorkSource) -> Result<DispatchReport, HarvestError> {
        let (targets, total) = match source {
            WorkSource::Targets(targets) => {
                let total = targets.len();
                (Some(targets), Some(total))
            }
            WorkSource::Backlog { launches } => (None, launches),
        };
        let unbounded = total.is_none();
        if unbounded && self.backlog.is_none() {
            return Err(HarvestError::Config(
                "unbounded backlog dispatch needs a backlog to watch".into(),
            ));
        }

        tracing::info!(
            dispatch_id = %self.id,
            concurrency = self.concurrency,
            total = ?total,
            "dispatch started"
        );

        let mut pool = PoolScheduler::new(self.concurrency, total);
        let mut running: JoinSet<Exit> = JoinSet::new();
        let mut report = DispatchReport::default();

        for index in pool.start() {
            self.launch(&mut running, target_at(&targets, index));
        }

        while let Some(joined) = running.join_next().await {
            report.launched += 1;
            let (target, result) = match joined {
                Ok(exit) => exit,
                Err(err) => {
                    let reason = format!("worker task aborted: {err}");
                    (None, Err(HarvestError::Launch(reason)))
                }
            };

            match result {
                Ok(WorkerExit::Success) => {
                    report.succeeded += 1;
                    tracing::debug!(dispatch_id = %self.id, target = ?target, "worker finished");
                }
                Ok(WorkerExit::Failed { code }) => {
                    tracing::warn!(
                        dispatch_id = %self.id,
                        target = ?target,
                        code = ?code,
                        "worker failed"
                    );
                    let reason = match code {
                        Some(code) => format!("exit code {code}"),
                        None => "killed by signal".to_string(),
                    };
                    report.failed.push(FailedLaunch { target, reason });
                }
                Err(err) => {
                    tracing::error!(
                        dispatch_id = %self.id,
                        target = ?target,
                        error = %err,
                        "worker launch failed"
                    );
                    report.failed.push(FailedLaunch {
                        target,
                        reason: err.to_string(),
                    });
                    // A launcher that cannot start anything would spin forever.
                    if unbounded {
                        pool.close();
                    }
                }
            }

            if unbounded {
                self.close_if_drained(&mut pool).await;
            }
            for index in pool.slot_freed() {
                self.launch(&mut running, target_at(&targets, index));
            }
            tracing::debug!(
                dispatch_id = %self.id,
                running = pool.running(),
                launched = pool.launched(),
                "slot freed"
            );
        }

        tracing::info!(
            dispatch_id = %self.id,
            launched = report.launched,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            "dispatch finished"
        );
        Ok(report)
    }

    fn launch(&self, running: &mut JoinSet<Exit>, target: Option<String>) {
        tracing::debug!(dispatch_id = %self.id, target = ?target, "launching worker");
        let launcher = self.launcher.clone();
        running.spawn(async move {
            let result = launcher.run(target.as_deref()).await;
            (target, result)
        });
    }

    async fn close_if_drained(&self, pool: &mut PoolScheduler) {
        let Some(backlog) = &self.backlog else {
            return;
        };
        match backlog.counts().await {
            Ok(counts) if counts.unclaimed == 0 => {
                tracing::info!(dispatch_id = %self.id, "backlog drained, no more launches");
                pool.close();
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    dispatch_id = %self.id,
                    error = %err,
                    "cannot read backlog, no more launches"
                );
                pool.close();
            }
        }
    }
}

fn target_at(targets: &Option<Vec<String>>, index: usize) -> Option<String> {
    targets.as_ref().and_then(|t| t.get(index).cloned())
}
