//! Dedup tracker: the single admission path into the backlog.

use std::sync::Arc;

use serde::Serialize;

use crate::domain::{Discovery, TaskId};
use crate::error::HarvestError;
use crate::ports::{BacklogStore, DuplicateLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Known id. `count` is the number of extra sightings so far.
    Duplicate { count: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionReport {
    pub admitted: u64,
    pub duplicates: u64,
}

impl AdmissionReport {
    pub fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Admitted => self.admitted += 1,
            Admission::Duplicate { .. } => self.duplicates += 1,
        }
    }

    pub fn seen(&self) -> u64 {
        self.admitted + self.duplicates
    }
}

#[derive(Clone)]
pub struct DedupTracker {
    backlog: Arc<dyn BacklogStore>,
    ledger: Arc<dyn DuplicateLedger>,
}

impl DedupTracker {
    pub fn new(backlog: Arc<dyn BacklogStore>, ledger: Arc<dyn DuplicateLedger>) -> Self {
        Self { backlog, ledger }
    }

    /// A duplicate is never an error; only store failures are.
    pub async fn admit(&self, id: &TaskId, target: &str) -> Result<Admission, HarvestError> {
        if self.backlog.insert_if_absent(id, target).await? {
            tracing::debug!(task_id = %id, target, "admitted");
            return Ok(Admission::Admitted);
        }

        let record = self.ledger.record_sighting(id, target).await?;
        tracing::debug!(task_id = %id, target, count = record.count, "duplicate sighting");
        Ok(Admission::Duplicate {
            count: record.count,
        })
    }

    /// Admit a batch in order. Stops at the first store error.
    pub async fn admit_all<I>(&self, discoveries: I) -> Result<AdmissionReport, HarvestError>
    where
        I: IntoIterator<Item = Discovery>,
    {
        let mut report = AdmissionReport::default();
        for discovery in discoveries {
            let admission = self.admit(&discovery.id, &discovery.target).await?;
            report.record(admission);
        }

        tracing::info!(
            admitted = report.admitted,
            duplicates = report.duplicates,
            "admission batch finished"
        );
        Ok(report)
    }
}
