//! Worker: claim one task, fetch with bounded retries, hand the payload to the sink.
//!
//! A worker is strictly sequential. It never marks a task done itself; the sink's
//! insert is the completion signal. On exhausted retries or a fatal failure the
//! task goes back to the backlog and the worker moves on.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;

use super::retry::RetryPolicy;
use crate::domain::{FailureKind, FetchError, Task, WorkerId};
use crate::error::HarvestError;
use crate::ports::{BacklogStore, Fetcher, ResultSink};

/// Uniform random delay in `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max.max(min)),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub retry: RetryPolicy,
    /// Politeness pause after every task.
    pub pause: DelayRange,
    /// Back-off when there is nothing to claim.
    pub idle: DelayRange,
    /// Stop after this many claimed tasks.
    pub max_tasks: Option<u64>,
    /// Stop on the first empty (or failed) claim instead of backing off.
    pub exit_when_idle: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pause: DelayRange::from_millis(4000, 8000),
            idle: DelayRange::from_millis(2000, 3000),
            max_tasks: None,
            exit_when_idle: false,
        }
    }
}

/// Per-task fetch state.
///
/// ```text
/// Idle -> Fetching(1) -> Succeeded
///                     -> Retrying(1) -> Fetching(2) -> ...
///                     -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching { attempt: u32 },
    /// Attempt `attempt` failed transiently and the budget allows another.
    Retrying { attempt: u32 },
    Succeeded { attempts: u32 },
    Failed { attempts: u32, kind: FailureKind },
}

impl FetchState {
    /// Start the next attempt. No-op outside `Idle` and `Retrying`.
    pub fn begin(self) -> Self {
        match self {
            FetchState::Idle => FetchState::Fetching { attempt: 1 },
            FetchState::Retrying { attempt } => FetchState::Fetching {
                attempt: attempt + 1,
            },
            other => other,
        }
    }

    pub fn succeeded(self) -> Self {
        match self {
            FetchState::Fetching { attempt } => FetchState::Succeeded { attempts: attempt },
            other => other,
        }
    }

    /// Fatal failures and the last allowed attempt end in `Failed`.
    pub fn failed(self, kind: FailureKind, policy: &RetryPolicy) -> Self {
        match self {
            FetchState::Fetching { attempt }
                if kind == FailureKind::Transient && policy.should_retry(attempt) =>
            {
                FetchState::Retrying { attempt }
            }
            FetchState::Fetching { attempt } => FetchState::Failed {
                attempts: attempt,
                kind,
            },
            other => other,
        }
    }

    /// Attempts made so far.
    pub fn attempts(self) -> u32 {
        match self {
            FetchState::Idle => 0,
            FetchState::Fetching { attempt } | FetchState::Retrying { attempt } => attempt,
            FetchState::Succeeded { attempts } | FetchState::Failed { attempts, .. } => attempts,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Succeeded { .. } | FetchState::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Payload handed to the sink. `stored` is false when a result already existed.
    Completed { attempts: u32, stored: bool },
    /// Task returned to the backlog.
    Requeued {
        attempts: u32,
        kind: FailureKind,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub claimed: u64,
    pub completed: u64,
    pub requeued: u64,
    pub errors: u64,
}

pub struct Worker {
    id: WorkerId,
    backlog: Arc<dyn BacklogStore>,
    sink: Arc<dyn ResultSink>,
    fetcher: Arc<dyn Fetcher>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        backlog: Arc<dyn BacklogStore>,
        sink: Arc<dyn ResultSink>,
        fetcher: Arc<dyn Fetcher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: WorkerId::generate(),
            backlog,
            sink,
            fetcher,
            config,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run one claimed task to an outcome.
    ///
    /// `Err` only for store failures; the task has then been requeued if the
    /// store allowed it.
    pub async fn process(&self, task: &Task) -> Result<TaskOutcome, HarvestError> {
        let mut state = FetchState::Idle.begin();

        loop {
            let attempt = state.attempts();
            tracing::debug!(worker_id = %self.id, task_id = %task.id, attempt, "fetching");

            let err = match self.fetcher.fetch(&task.target).await {
                Ok(payload) => {
                    state = state.succeeded();
                    return self.complete(task, state.attempts(), &payload).await;
                }
                Err(err) => err,
            };

            state = state.failed(err.kind, &self.config.retry);
            let FetchState::Retrying { attempt } = state else {
                return self.give_up(task, state, err).await;
            };

            let delay = self
                .config
                .retry
                .jittered_delay(attempt, &mut rand::thread_rng());
            tracing::warn!(
                worker_id = %self.id,
                task_id = %task.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient fetch failure, backing off"
            );
            tokio::time::sleep(delay).await;
            state = state.begin();
        }
    }

    async fn complete(
        &self,
        task: &Task,
        attempts: u32,
        payload: &serde_json::Value,
    ) -> Result<TaskOutcome, HarvestError> {
        match self.sink.store(&task.id, &task.target, payload).await {
            Ok(stored) => {
                tracing::info!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    attempt = attempts,
                    stored,
                    "task completed"
                );
                Ok(TaskOutcome::Completed { attempts, stored })
            }
            Err(err) => {
                tracing::error!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    error = %err,
                    "result write failed, requeueing"
                );
                if let Err(requeue_err) = self.backlog.requeue(&task.id).await {
                    tracing::error!(task_id = %task.id, error = %requeue_err, "requeue failed");
                }
                Err(err)
            }
        }
    }

    async fn give_up(
        &self,
        task: &Task,
        state: FetchState,
        err: FetchError,
    ) -> Result<TaskOutcome, HarvestError> {
        let attempts = state.attempts();
        tracing::warn!(
            worker_id = %self.id,
            task_id = %task.id,
            attempt = attempts,
            kind = ?err.kind,
            error = %err.message,
            "giving up on task, requeueing"
        );
        self.backlog.requeue(&task.id).await?;
        Ok(TaskOutcome::Requeued {
            attempts,
            kind: err.kind,
            reason: err.message,
        })
    }

    /// Claim and process a single task. `None` when the backlog had nothing.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>, HarvestError> {
        let Some(task) = self.backlog.claim_next().await? else {
            return Ok(None);
        };
        tracing::debug!(worker_id = %self.id, task_id = %task.id, "claimed");
        self.process(&task).await.map(Some)
    }

    /// Loop until shutdown, the task limit, or (with `exit_when_idle`) an empty claim.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        let mut report = WorkerReport::default();
        tracing::info!(worker_id = %self.id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(max) = self.config.max_tasks
                && report.claimed >= max
            {
                tracing::info!(worker_id = %self.id, max, "task limit reached");
                break;
            }

            let task = match self.backlog.claim_next().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    if self.config.exit_when_idle {
                        tracing::info!(worker_id = %self.id, "backlog empty, exiting");
                        break;
                    }
                    tracing::debug!(worker_id = %self.id, "backlog empty, idling");
                    if !pause(self.config.idle, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(worker_id = %self.id, error = %err, "claim failed");
                    if self.config.exit_when_idle || !pause(self.config.idle, &mut shutdown).await
                    {
                        break;
                    }
                    continue;
                }
            };

            report.claimed += 1;
            match self.process(&task).await {
                Ok(TaskOutcome::Completed { .. }) => report.completed += 1,
                Ok(TaskOutcome::Requeued { .. }) => report.requeued += 1,
                Err(err) => {
                    report.errors += 1;
                    tracing::error!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        error = %err,
                        "task failed"
                    );
                }
            }

            if !pause(self.config.pause, &mut shutdown).await {
                break;
            }
        }

        tracing::info!(
            worker_id = %self.id,
            claimed = report.claimed,
            completed = report.completed,
            requeued = report.requeued,
            errors = report.errors,
            "worker stopped"
        );
        report
    }
}

/// Sleep for a random delay from `range`. False if shutdown was requested meanwhile.
async fn pause(range: DelayRange, shutdown: &mut watch::Receiver<bool>) -> bool {
    let delay = range.sample(&mut rand::thread_rng());
    if delay.is_zero() {
        return !*shutdown.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::domain::{BacklogCounts, ResultRecord, TaskId, TaskStatus};
    use crate::impls::InMemoryStore;

    /// Replays scripted results, then succeeds forever. Records call instants.
    #[derive(Default)]
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<serde_json::Value, FetchError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<serde_json::Value, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, target: &str) -> Result<serde_json::Value, FetchError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({ "target": target })))
        }
    }

    fn quiet(retry: RetryPolicy) -> WorkerConfig {
        WorkerConfig {
            retry,
            pause: DelayRange::ZERO,
            idle: DelayRange::ZERO,
            max_tasks: None,
            exit_when_idle: true,
        }
    }

    async fn seeded(ids: &[&str]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for id in ids {
            store
                .insert_if_absent(&TaskId::new(*id), &format!("https://s/{id}"))
                .await
                .unwrap();
        }
        store
    }

    fn worker(
        store: &Arc<InMemoryStore>,
        fetcher: Arc<dyn Fetcher>,
        config: WorkerConfig,
    ) -> Worker {
        Worker::new(store.clone(), store.clone(), fetcher, config)
    }

    #[test]
    fn state_machine_walks_the_retry_budget() {
        let policy = RetryPolicy::default();
        let mut state = FetchState::Idle.begin();
        assert_eq!(state, FetchState::Fetching { attempt: 1 });

        for n in 1..4 {
            state = state.failed(FailureKind::Transient, &policy);
            assert_eq!(state, FetchState::Retrying { attempt: n });
            state = state.begin();
        }
        assert_eq!(state, FetchState::Fetching { attempt: 4 });

        state = state.failed(FailureKind::Transient, &policy);
        assert_eq!(
            state,
            FetchState::Failed {
                attempts: 4,
                kind: FailureKind::Transient
            }
        );
        assert!(state.is_terminal());
        assert_eq!(state.begin(), state);
    }

    #[test]
    fn fatal_failure_skips_remaining_attempts() {
        let state = FetchState::Idle
            .begin()
            .failed(FailureKind::Fatal, &RetryPolicy::default());
        assert_eq!(
            state,
            FetchState::Failed {
                attempts: 1,
                kind: FailureKind::Fatal
            }
        );
    }

    #[test]
    fn success_records_attempts() {
        let state = FetchState::Retrying { attempt: 2 }.begin().succeeded();
        assert_eq!(state, FetchState::Succeeded { attempts: 3 });
    }

    #[test]
    fn delay_range_samples_within_bounds() {
        let range = DelayRange::from_millis(4000, 8000);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let d = range.sample(&mut rng);
            assert!(d >= range.min && d <= range.max);
        }
        assert_eq!(DelayRange::from_millis(5, 1).sample(&mut rng), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn three_transient_failures_then_success() {
        let store = seeded(&["x/1"]).await;
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Err(FetchError::transient("HTTP 429")),
            Err(FetchError::transient("HTTP 429")),
            Err(FetchError::transient("timeout")),
        ]));
        let worker = worker(
            &store,
            fetcher.clone(),
            quiet(RetryPolicy::default().without_jitter()),
        );

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                attempts: 4,
                stored: true
            }
        );

        let id = TaskId::new("x/1");
        let task = BacklogStore::get(store.as_ref(), &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(ResultSink::total(store.as_ref()).await.unwrap(), 1);

        let calls = fetcher.calls();
        assert_eq!(calls.len(), 4);
        let expected = [1500, 3000, 6000];
        for (pair, ms) in calls.windows(2).zip(expected) {
            let gap = pair[1] - pair[0];
            let want = Duration::from_millis(ms);
            assert!(
                gap >= want && gap < want + Duration::from_millis(10),
                "gap {gap:?}, want {want:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_requeue_the_task() {
        let store = seeded(&["x/1"]).await;
        let fetcher = Arc::new(ScriptedFetcher::new(
            (0..4).map(|_| Err(FetchError::transient("HTTP 503"))).collect(),
        ));
        let worker = worker(&store, fetcher.clone(), quiet(RetryPolicy::default()));

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            TaskOutcome::Requeued {
                attempts: 4,
                kind: FailureKind::Transient,
                ..
            }
        ));
        assert_eq!(fetcher.calls().len(), 4);

        let task = BacklogStore::get(store.as_ref(), &TaskId::new("x/1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Unclaimed);
        assert_eq!(task.claimed_at, None);
        assert_eq!(ResultSink::total(store.as_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fatal_failure_requeues_without_retrying() {
        let store = seeded(&["x/1"]).await;
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(FetchError::fatal("HTTP 404"))]));
        let worker = worker(&store, fetcher.clone(), quiet(RetryPolicy::default()));

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Requeued {
                attempts: 1,
                kind: FailureKind::Fatal,
                reason: "HTTP 404".to_string()
            }
        );
        assert_eq!(fetcher.calls().len(), 1);
        assert_eq!(store.counts().await.unwrap().unclaimed, 1);
    }

    #[tokio::test]
    async fn run_once_on_empty_backlog_is_none() {
        let store = seeded(&[]).await;
        let worker = worker(
            &store,
            Arc::new(ScriptedFetcher::default()),
            quiet(RetryPolicy::default()),
        );
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_drains_the_backlog_and_exits_when_idle() {
        let store = seeded(&["a/1", "a/2", "a/3"]).await;
        let worker = worker(
            &store,
            Arc::new(ScriptedFetcher::default()),
            quiet(RetryPolicy::default()),
        );
        let (_tx, rx) = watch::channel(false);

        let report = worker.run(rx).await;
        assert_eq!(
            report,
            WorkerReport {
                claimed: 3,
                completed: 3,
                requeued: 0,
                errors: 0
            }
        );
        assert_eq!(
            store.counts().await.unwrap(),
            BacklogCounts {
                unclaimed: 0,
                claimed: 0,
                done: 3
            }
        );
    }

    #[tokio::test]
    async fn run_honours_task_limit() {
        let store = seeded(&["a/1", "a/2", "a/3"]).await;
        let mut config = quiet(RetryPolicy::default());
        config.max_tasks = Some(2);
        let worker = worker(&store, Arc::new(ScriptedFetcher::default()), config);
        let (_tx, rx) = watch::channel(false);

        let report = worker.run(rx).await;
        assert_eq!(report.claimed, 2);
        assert_eq!(store.counts().await.unwrap().unclaimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_idle_wait() {
        let store = seeded(&[]).await;
        let mut config = quiet(RetryPolicy::default());
        config.exit_when_idle = false;
        config.idle = DelayRange::from_millis(60_000, 60_000);
        let worker = Arc::new(worker(&store, Arc::new(ScriptedFetcher::default()), config));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    struct BrokenSink;

    #[async_trait]
    impl ResultSink for BrokenSink {
        async fn store(
            &self,
            _: &TaskId,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<bool, HarvestError> {
            Err(HarvestError::Io(std::io::Error::other("disk full")))
        }

        async fn get(&self, _: &TaskId) -> Result<Option<ResultRecord>, HarvestError> {
            Ok(None)
        }

        async fn total(&self) -> Result<u64, HarvestError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn sink_failure_requeues_and_reports_error() {
        let store = seeded(&["x/1"]).await;
        let worker = Worker::new(
            store.clone(),
            Arc::new(BrokenSink),
            Arc::new(ScriptedFetcher::default()),
            quiet(RetryPolicy::default()),
        );

        assert!(worker.run_once().await.is_err());
        let task = BacklogStore::get(store.as_ref(), &TaskId::new("x/1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Unclaimed);
    }

    struct UnreachableBacklog;

    #[async_trait]
    impl BacklogStore for UnreachableBacklog {
        async fn insert_if_absent(&self, _: &TaskId, _: &str) -> Result<bool, HarvestError> {
            Err(HarvestError::Config("down".into()))
        }
        async fn claim_next(&self) -> Result<Option<Task>, HarvestError> {
            Err(HarvestError::Config("down".into()))
        }
        async fn requeue(&self, _: &TaskId) -> Result<(), HarvestError> {
            Ok(())
        }
        async fn get(&self, _: &TaskId) -> Result<Option<Task>, HarvestError> {
            Ok(None)
        }
        async fn reset_claims(&self, _: Option<DateTime<Utc>>) -> Result<u64, HarvestError> {
            Ok(0)
        }
        async fn counts(&self) -> Result<BacklogCounts, HarvestError> {
            Ok(BacklogCounts::default())
        }
    }

    #[tokio::test]
    async fn claim_error_counts_as_idle() {
        let worker = Worker::new(
            Arc::new(UnreachableBacklog),
            Arc::new(BrokenSink),
            Arc::new(ScriptedFetcher::default()),
            quiet(RetryPolicy::default()),
        );
        let (_tx, rx) = watch::channel(false);
        let report = worker.run(rx).await;
        assert_eq!(report.errors, 1);
        assert_eq!(report.claimed, 0);
    }
}
