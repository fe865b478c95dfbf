//! In-memory store: backlog, duplicate ledger and result sink behind one lock.
//!
//! Used by tests and single-process runs. All three ports share one state so the
//! result insert and the `done` transition happen under the same lock, the same
//! guarantee the SQL stores get from their trigger.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{BacklogCounts, DuplicateRecord, ResultRecord, Task, TaskId, TaskStatus};
use crate::error::HarvestError;
use crate::ports::{BacklogStore, Clock, DuplicateLedger, ResultSink, SystemClock};

/// Claim-order entry. `BinaryHeap` is a max-heap, so ordering is reversed to pop
/// the oldest discovery first; `seq` breaks ties in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    discovered_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.discovered_at, other.seq).cmp(&(self.discovered_at, self.seq))
    }
}

struct StoredTask {
    task: Task,
    seq: u64,
}

#[derive(Default)]
struct InMemoryState {
    /// Single source of truth for task rows.
    tasks: HashMap<TaskId, StoredTask>,

    /// Unclaimed task ids in claim order. May hold stale entries for tasks completed
    /// while unclaimed; `claim_next` skips those.
    ready: BinaryHeap<ReadyTask>,

    duplicates: HashMap<TaskId, DuplicateRecord>,
    results: HashMap<TaskId, ResultRecord>,
    next_seq: u64,
}

impl InMemoryState {
    fn push_ready(&mut self, id: &TaskId) {
        if let Some(stored) = self.tasks.get(id) {
            self.ready.push(ReadyTask {
                discovered_at: stored.task.discovered_at,
                seq: stored.seq,
                task_id: id.clone(),
            });
        }
    }

    fn claim_next(&mut self, now: DateTime<Utc>) -> Option<Task> {
        while let Some(entry) = self.ready.pop() {
            if let Some(stored) = self.tasks.get_mut(&entry.task_id)
                && stored.task.claim(now)
            {
                return Some(stored.task.clone());
            }
        }
        None
    }

    fn counts(&self) -> BacklogCounts {
        let mut counts = BacklogCounts::default();
        for stored in self.tasks.values() {
            counts.add(stored.task.status);
        }
        counts
    }
}

pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            clock,
        }
    }

    /// Put a task into an arbitrary state. Test setup only.
    #[cfg(test)]
    pub(crate) async fn force_status(&self, id: &TaskId, status: TaskStatus) {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.tasks.get_mut(id) {
            stored.task.status = status;
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BacklogStore for InMemoryStore {
    async fn insert_if_absent(&self, id: &TaskId, target: &str) -> Result<bool, HarvestError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(id) {
            return Ok(false);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert(
            id.clone(),
            StoredTask {
                task: Task::new(id.clone(), target, now),
                seq,
            },
        );
        state.push_ready(id);
        Ok(true)
    }

    async fn claim_next(&self) -> Result<Option<Task>, HarvestError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.claim_next(now))
    }

    async fn requeue(&self, id: &TaskId) -> Result<(), HarvestError> {
        let mut state = self.state.lock().await;
        let requeued = state
            .tasks
            .get_mut(id)
            .is_some_and(|stored| stored.task.requeue());
        if requeued {
            state.push_ready(id);
        }
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, HarvestError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(id).map(|stored| stored.task.clone()))
    }

    async fn reset_claims(
        &self,
        claimed_before: Option<DateTime<Utc>>,
    ) -> Result<u64, HarvestError> {
        let mut state = self.state.lock().await;
        let stale: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|stored| stored.task.status == TaskStatus::Claimed)
            .filter(|stored| match (claimed_before, stored.task.claimed_at) {
                (Some(cutoff), Some(claimed_at)) => claimed_at < cutoff,
                _ => true,
            })
            .map(|stored| stored.task.id.clone())
            .collect();

        for id in &stale {
            if let Some(stored) = state.tasks.get_mut(id) {
                stored.task.requeue();
            }
            state.push_ready(id);
        }
        Ok(stale.len() as u64)
    }

    async fn counts(&self) -> Result<BacklogCounts, HarvestError> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }
}

#[async_trait]
impl DuplicateLedger for InMemoryStore {
    async fn record_sighting(
        &self,
        id: &TaskId,
        target: &str,
    ) -> Result<DuplicateRecord, HarvestError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state
            .duplicates
            .entry(id.clone())
            .and_modify(|rec| rec.record_sighting(now))
            .or_insert_with(|| DuplicateRecord::first_sighting(id.clone(), target, now));
        Ok(record.clone())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<DuplicateRecord>, HarvestError> {
        let state = self.state.lock().await;
        Ok(state.duplicates.get(id).cloned())
    }

    async fn total(&self) -> Result<u64, HarvestError> {
        let state = self.state.lock().await;
        Ok(state.duplicates.len() as u64)
    }
}

#[async_trait]
impl ResultSink for InMemoryStore {
    async fn store(
        &self,
        id: &TaskId,
        target: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, HarvestError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.results.contains_key(id) {
            return Ok(false);
        }

        state.results.insert(
            id.clone(),
            ResultRecord {
                id: id.clone(),
                target: target.to_string(),
                payload: payload.clone(),
                captured_at: now,
            },
        );
        // Completion signal, under the same lock as the insert.
        if let Some(stored) = state.tasks.get_mut(id) {
            stored.task.mark_done();
        }
        Ok(true)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<ResultRecord>, HarvestError> {
        let state = self.state.lock().await;
        Ok(state.results.get(id).cloned())
    }

    async fn total(&self) -> Result<u64, HarvestError> {
        let state = self.state.lock().await;
        Ok(state.results.len() as u64)
    }
}
