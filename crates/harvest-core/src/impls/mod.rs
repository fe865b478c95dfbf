//! Port implementations.
//!
//! Stores: in-memory (tests, single process), SQLite (one host), Postgres (many hosts).
//! Fetchers: external command, plain HTTP. Launcher: child process.

pub mod command;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod process;
pub mod sqlite;

use std::sync::Arc;

pub use self::command::CommandFetcher;
pub use self::http::HttpFetcher;
pub use self::memory::InMemoryStore;
pub use self::postgres::PgStore;
pub use self::process::ProcessLauncher;
pub use self::sqlite::SqliteStore;

use crate::config::{FetcherKind, FetcherSettings};
use crate::error::HarvestError;
use crate::ports::{BacklogStore, DuplicateLedger, Fetcher, ResultSink};

/// The three storage ports, backed by one store so that a result insert and the
/// matching `done` transition stay a single atomic step.
#[derive(Clone)]
pub struct Stores {
    pub backlog: Arc<dyn BacklogStore>,
    pub duplicates: Arc<dyn DuplicateLedger>,
    pub results: Arc<dyn ResultSink>,
}

impl Stores {
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: BacklogStore + DuplicateLedger + ResultSink + 'static,
    {
        Self {
            backlog: store.clone(),
            duplicates: store.clone(),
            results: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_shared(Arc::new(InMemoryStore::new()))
    }
}

/// `postgres://` and `postgresql://` select Postgres; anything else is a SQLite location.
pub async fn open_stores(database_url: &str) -> Result<Stores, HarvestError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let store = PgStore::connect(database_url).await?;
        Ok(Stores::from_shared(Arc::new(store)))
    } else {
        let store = SqliteStore::open(database_url).await?;
        Ok(Stores::from_shared(Arc::new(store)))
    }
}

pub fn build_fetcher(settings: &FetcherSettings) -> Result<Arc<dyn Fetcher>, HarvestError> {
    Ok(match settings.kind {
        FetcherKind::Command => Arc::new(CommandFetcher::from_settings(settings)?),
        FetcherKind::Http => Arc::new(HttpFetcher::from_settings(settings)?),
    })
}
