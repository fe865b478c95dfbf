//! harvest-core
//!
//! Task coordination for distributed fetch-and-process work: a durable backlog with
//! an atomic claim, duplicate tracking at admission, retrying workers and a bounded
//! worker-pool dispatcher.
//!
//! # Modules
//! - **domain**: ids, tasks, duplicate records, results, fetch failures
//! - **ports**: `BacklogStore`, `DuplicateLedger`, `ResultSink`, `Fetcher`, `Launcher`, `Clock`
//! - **impls**: in-memory, SQLite and Postgres stores; command and HTTP fetchers; process launcher
//! - **app**: dedup tracker, retry policy, worker, pool scheduler, dispatcher, status
//! - **config**: TOML configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use config::HarvestConfig;
pub use error::HarvestError;
