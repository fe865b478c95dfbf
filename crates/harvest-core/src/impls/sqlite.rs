//! SQLite-backed store for single-host deployments.
//!
//! SQLite serialises writers, so `claim_next` is a single `UPDATE … RETURNING`
//! whose sub-select and update run under one write lock; no two connections, in
//! this process or another, can return the same row. Timestamps are stored as
//! unix milliseconds so `ORDER BY discovered_at` is a plain integer sort.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::types::Json;
use sqlx::{Row, SqlitePool};

use crate::domain::{BacklogCounts, DuplicateRecord, ResultRecord, Task, TaskId, TaskStatus};
use crate::error::HarvestError;
use crate::ports::{BacklogStore, Clock, DuplicateLedger, ResultSink, SystemClock};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT    PRIMARY KEY,
    target          TEXT    NOT NULL,
    -- NULL = unclaimed, 0 = claimed, 1 = done
    status          INTEGER,
    discovered_at   INTEGER NOT NULL,
    claimed_at      INTEGER
);

CREATE INDEX IF NOT EXISTS idx_tasks_unclaimed ON tasks(discovered_at) WHERE status IS NULL;

CREATE TABLE IF NOT EXISTS duplicates (
    id          TEXT    PRIMARY KEY,
    target      TEXT    NOT NULL,
    count       INTEGER NOT NULL,
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS results (
    id          TEXT    PRIMARY KEY,
    target      TEXT    NOT NULL,
    payload     TEXT    NOT NULL,
    captured_at INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS results_mark_done
AFTER INSERT ON results
BEGIN
    UPDATE tasks SET status = 1 WHERE id = NEW.id;
END;
"#;

const TASK_COLUMNS: &str = "id, target, status, discovered_at, claimed_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and apply the schema.
    ///
    /// Accepts `sqlite://path`, `sqlite:path` or a bare path.
    pub async fn open(url: &str) -> Result<Self, HarvestError> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{url}")
        };
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        store.migrate().await?;

        tracing::info!(url = %url, "sqlite store opened");
        Ok(store)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn migrate(&self) -> Result<(), HarvestError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn task_from_row(row: &SqliteRow) -> Result<Task, HarvestError> {
    let status: Option<i64> = row.try_get("status")?;
    let claimed_at: Option<i64> = row.try_get("claimed_at")?;
    Ok(Task {
        id: TaskId::new(row.try_get::<String, _>("id")?),
        target: row.try_get("target")?,
        status: TaskStatus::from_flag(status.map(|v| v != 0)),
        discovered_at: from_millis(row.try_get("discovered_at")?),
        claimed_at: claimed_at.map(from_millis),
    })
}

fn duplicate_from_row(row: &SqliteRow) -> Result<DuplicateRecord, HarvestError> {
    Ok(DuplicateRecord {
        id: TaskId::new(row.try_get::<String, _>("id")?),
        target: row.try_get("target")?,
        count: row.try_get::<i64, _>("count")? as u64,
        first_seen: from_millis(row.try_get("first_seen")?),
        last_seen: from_millis(row.try_get("last_seen")?),
    })
}

#[async_trait]
impl BacklogStore for SqliteStore {
    async fn insert_if_absent(&self, id: &TaskId, target: &str) -> Result<bool, HarvestError> {
        let done = sqlx::query(
            "INSERT INTO tasks (id, target, status, discovered_at)
             VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(target)
        .bind(self.now_ms())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn claim_next(&self) -> Result<Option<Task>, HarvestError> {
        let row = sqlx::query(&format!(
            "UPDATE tasks SET status = 0, claimed_at = ?1
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status IS NULL
                 ORDER BY discovered_at, rowid
                 LIMIT 1
             )
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(self.now_ms())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn requeue(&self, id: &TaskId) -> Result<(), HarvestError> {
        sqlx::query(
            "UPDATE tasks SET status = NULL, claimed_at = NULL WHERE id = ?1 AND status = 0",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, HarvestError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn reset_claims(
        &self,
        claimed_before: Option<DateTime<Utc>>,
    ) -> Result<u64, HarvestError> {
        let done = match claimed_before {
            Some(cutoff) => {
                sqlx::query(
                    "UPDATE tasks SET status = NULL, claimed_at = NULL
                     WHERE status = 0 AND (claimed_at IS NULL OR claimed_at < ?1)",
                )
                .bind(cutoff.timestamp_millis())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE tasks SET status = NULL, claimed_at = NULL WHERE status = 0")
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(done.rows_affected())
    }

    async fn counts(&self) -> Result<BacklogCounts, HarvestError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = BacklogCounts::default();
        for row in rows {
            let status: Option<i64> = row.try_get("status")?;
            let n = row.try_get::<i64, _>("n")? as u64;
            match TaskStatus::from_flag(status.map(|v| v != 0)) {
                TaskStatus::Unclaimed => counts.unclaimed = n,
                TaskStatus::Claimed => counts.claimed = n,
                TaskStatus::Done => counts.done = n,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl DuplicateLedger for SqliteStore {
    async fn record_sighting(
        &self,
        id: &TaskId,
        target: &str,
    ) -> Result<DuplicateRecord, HarvestError> {
        let row = sqlx::query(
            "INSERT INTO duplicates (id, target, count, first_seen, last_seen)
             VALUES (?1, ?2, 1, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 count = duplicates.count + 1,
                 last_seen = excluded.last_seen
             RETURNING id, target, count, first_seen, last_seen",
        )
        .bind(id.as_str())
        .bind(target)
        .bind(self.now_ms())
        .fetch_one(&self.pool)
        .await?;
        duplicate_from_row(&row)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<DuplicateRecord>, HarvestError> {
        let row = sqlx::query(
            "SELECT id, target, count, first_seen, last_seen FROM duplicates WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(duplicate_from_row).transpose()
    }

    async fn total(&self) -> Result<u64, HarvestError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM duplicates")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

#[async_trait]
impl ResultSink for SqliteStore {
    async fn store(
        &self,
        id: &TaskId,
        target: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, HarvestError> {
        // The results_mark_done trigger fires only when a row is actually inserted.
        let done = sqlx::query(
            "INSERT INTO results (id, target, payload, captured_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(target)
        .bind(Json(payload))
        .bind(self.now_ms())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<ResultRecord>, HarvestError> {
        let row = sqlx::query("SELECT id, target, payload, captured_at FROM results WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;
        Ok(Some(ResultRecord {
            id: TaskId::new(row.try_get::<String, _>("id")?),
            target: row.try_get("target")?,
            payload,
            captured_at: from_millis(row.try_get("captured_at")?),
        }))
    }

    async fn total(&self) -> Result<u64, HarvestError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}
