//! BacklogStore port: the durable task table and its claim protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BacklogCounts, Task, TaskId};
use crate::error::HarvestError;

/// Source of truth for task state.
///
/// Every method is a single atomic operation against the store; workers share no
/// memory and coordinate only through these calls.
#[async_trait]
pub trait BacklogStore: Send + Sync {
    /// Insert a new unclaimed task unless a row with `id` already exists.
    ///
    /// Returns `true` when a row was inserted. This is the only admission point
    /// that distinguishes a new discovery from a duplicate.
    async fn insert_if_absent(&self, id: &TaskId, target: &str) -> Result<bool, HarvestError>;

    /// Atomically pick the oldest unclaimed task, mark it claimed and stamp
    /// `claimed_at`.
    ///
    /// Two concurrent callers never receive the same task. `None` means the
    /// backlog is empty right now, not that work is over.
    async fn claim_next(&self) -> Result<Option<Task>, HarvestError>;

    /// Return a claimed task to the unclaimed state and clear `claimed_at`.
    ///
    /// No-op for unclaimed tasks, unknown ids and done tasks.
    async fn requeue(&self, id: &TaskId) -> Result<(), HarvestError>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, HarvestError>;

    /// Operator maintenance: requeue claimed tasks, optionally only those claimed
    /// before `claimed_before`. Returns how many were reset.
    ///
    /// There is no lease expiry; nothing calls this automatically.
    async fn reset_claims(
        &self,
        claimed_before: Option<DateTime<Utc>>,
    ) -> Result<u64, HarvestError>;

    async fn counts(&self) -> Result<BacklogCounts, HarvestError>;
}
