//! Point-in-time view of the backlog for operators.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::BacklogCounts;
use crate::error::HarvestError;
use crate::impls::Stores;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub tasks: BacklogCounts,
    /// Ids seen more than once.
    pub duplicate_ids: u64,
    pub results: u64,
}

impl StatusSnapshot {
    /// Done tasks without a result row point at a sink that is not wired to the backlog.
    pub fn is_consistent(&self) -> bool {
        self.tasks.done == self.results
    }
}

pub async fn snapshot(stores: &Stores) -> Result<StatusSnapshot, HarvestError> {
    Ok(StatusSnapshot {
        taken_at: Utc::now(),
        tasks: stores.backlog.counts().await?,
        duplicate_ids: stores.duplicates.total().await?,
        results: stores.results.total().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;

    #[tokio::test]
    async fn counts_every_table() {
        let stores = Stores::in_memory();
        for id in ["a/1", "a/2", "a/3"] {
            stores.backlog.insert_if_absent(&TaskId::new(id), "https://s").await.unwrap();
        }
        stores.duplicates.record_sighting(&TaskId::new("a/1"), "https://s").await.unwrap();
        stores.backlog.claim_next().await.unwrap();
        stores
            .results
            .store(&TaskId::new("a/2"), "https://s", &serde_json::json!({}))
            .await
            .unwrap();

        let status = snapshot(&stores).await.unwrap();
        assert_eq!(
            status.tasks,
            BacklogCounts {
                unclaimed: 1,
                claimed: 1,
                done: 1
            }
        );
        assert_eq!(status.duplicate_ids, 1);
        assert_eq!(status.results, 1);
        assert!(status.is_consistent());
    }
}
