//! ResultSink port.

use async_trait::async_trait;

use crate::domain::{ResultRecord, TaskId};
use crate::error::HarvestError;

/// Idempotent result persistence.
///
/// # Completion signal
/// Implementations that share storage with a [`BacklogStore`](super::BacklogStore)
/// flip the task to `done` in the same atomic step as the first insert (the SQL
/// stores use an `AFTER INSERT` trigger). The worker never marks tasks done itself.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store the payload for `id`.
    ///
    /// Returns `true` when a new row was written and `false` when a row for `id`
    /// already existed; a repeat write is not an error and does not overwrite.
    async fn store(
        &self,
        id: &TaskId,
        target: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, HarvestError>;

    async fn get(&self, id: &TaskId) -> Result<Option<ResultRecord>, HarvestError>;

    async fn total(&self) -> Result<u64, HarvestError>;
}
