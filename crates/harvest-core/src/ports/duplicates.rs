use async_trait::async_trait;

use crate::domain::{DuplicateRecord, TaskId};
use crate::error::HarvestError;

/// Counter store for re-sighted task ids.
#[async_trait]
pub trait DuplicateLedger: Send + Sync {
    /// Create the record with `count = 1`, or bump `count` and `last_seen`.
    /// Returns the record as it stands after the update.
    async fn record_sighting(
        &self,
        id: &TaskId,
        target: &str,
    ) -> Result<DuplicateRecord, HarvestError>;

    async fn get(&self, id: &TaskId) -> Result<Option<DuplicateRecord>, HarvestError>;

    /// Number of distinct ids with at least one duplicate sighting.
    async fn total(&self) -> Result<u64, HarvestError>;
}
