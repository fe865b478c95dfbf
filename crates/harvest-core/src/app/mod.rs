//! Application layer: the coordination logic built on the ports.
//!
//! - **DedupTracker**: admission into the backlog, duplicate counting
//! - **RetryPolicy**: attempt budget and backoff schedule
//! - **Worker**: claim, fetch with retries, store or requeue
//! - **PoolScheduler**: pure bounded-concurrency policy
//! - **Dispatcher**: runs workers under the pool policy
//! - **discovery**: listing pages and discovery files into `(id, target)` pairs
//! - **status**: operator snapshot

pub mod dedup;
pub mod discovery;
pub mod dispatcher;
pub mod pool;
pub mod retry;
pub mod status;
pub mod worker;

pub use self::dedup::{Admission, AdmissionReport, DedupTracker};
pub use self::dispatcher::{DispatchReport, Dispatcher, FailedLaunch, WorkSource};
pub use self::pool::PoolScheduler;
pub use self::retry::RetryPolicy;
pub use self::status::{StatusSnapshot, snapshot};
pub use self::worker::{DelayRange, FetchState, TaskOutcome, Worker, WorkerConfig, WorkerReport};
