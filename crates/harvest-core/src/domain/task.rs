//! Task: one backlog row, plus the discovery pair that creates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;
use crate::error::HarvestError;

/// Task status.
///
/// Persisted as a nullable boolean: `NULL` = unclaimed, `false` = claimed,
/// `true` = done.
///
/// Transitions:
/// - Unclaimed -> Claimed (atomic claim only)
/// - Claimed -> Unclaimed (requeue after failure)
/// - Claimed -> Done (completion signal from the result sink)
///
/// `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Unclaimed,
    Claimed,
    Done,
}

impl TaskStatus {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            None => TaskStatus::Unclaimed,
            Some(false) => TaskStatus::Claimed,
            Some(true) => TaskStatus::Done,
        }
    }

    pub fn as_flag(self) -> Option<bool> {
        match self {
            TaskStatus::Unclaimed => None,
            TaskStatus::Claimed => Some(false),
            TaskStatus::Done => Some(true),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    /// Eligible for `claim_next`.
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Unclaimed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub target: String,
    pub status: TaskStatus,
    pub discovered_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, target: impl Into<String>, discovered_at: DateTime<Utc>) -> Self {
        Self {
            id,
            target: target.into(),
            status: TaskStatus::Unclaimed,
            discovered_at,
            claimed_at: None,
        }
    }

    /// Returns false (and changes nothing) unless the task was unclaimed.
    pub fn claim(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.is_claimable() {
            return false;
        }
        self.status = TaskStatus::Claimed;
        self.claimed_at = Some(now);
        true
    }

    /// Back to unclaimed. A done task is left alone; an unclaimed one is a no-op.
    pub fn requeue(&mut self) -> bool {
        if self.status != TaskStatus::Claimed {
            return false;
        }
        self.status = TaskStatus::Unclaimed;
        self.claimed_at = None;
        true
    }

    /// Completion follows the stored result, not the claim. A worker may finish
    /// after an operator reset put its task back to unclaimed; the result still
    /// completes the task so it is not fetched again. The SQL stores' triggers
    /// behave the same way.
    pub fn mark_done(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Done;
        true
    }
}

/// A candidate task as produced by the discoverer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub id: TaskId,
    #[serde(alias = "url")]
    pub target: String,
}

impl Discovery {
    pub fn new(id: TaskId, target: impl Into<String>) -> Self {
        Self {
            id,
            target: target.into(),
        }
    }

    /// Build a discovery whose id is derived from the target.
    pub fn from_target(target: impl Into<String>) -> Result<Self, HarvestError> {
        let target = target.into();
        let id = TaskId::from_target(&target)?;
        Ok(Self { id, target })
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogCounts {
    pub unclaimed: u64,
    pub claimed: u64,
    pub done: u64,
}

impl BacklogCounts {
    pub fn total(&self) -> u64 {
        self.unclaimed + self.claimed + self.done
    }

    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Unclaimed => self.unclaimed += 1,
            TaskStatus::Claimed => self.claimed += 1,
            TaskStatus::Done => self.done += 1,
        }
    }
}
