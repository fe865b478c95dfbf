//! PostgreSQL-backed store for many workers on many hosts.
//!
//! `claim_next` locks one candidate row with `FOR UPDATE SKIP LOCKED`, so
//! concurrent claimers skip each other's picks instead of blocking on them.
//! Completion is an `AFTER INSERT` trigger on `results`.
//!
//! Every process migrates on connect. Catalog DDL is not safe to run
//! concurrently, so the schema is applied in one transaction holding
//! [`SCHEMA_LOCK_KEY`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::domain::{BacklogCounts, DuplicateRecord, ResultRecord, Task, TaskId, TaskStatus};
use crate::error::HarvestError;
use crate::ports::{BacklogStore, Clock, DuplicateLedger, ResultSink, SystemClock};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT        PRIMARY KEY,
    target          TEXT        NOT NULL,
    -- NULL = unclaimed, FALSE = claimed, TRUE = done
    status          BOOLEAN,
    discovered_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    claimed_at      TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_tasks_unclaimed ON tasks (discovered_at) WHERE status IS NULL;

CREATE TABLE IF NOT EXISTS duplicates (
    id          TEXT        PRIMARY KEY,
    target      TEXT        NOT NULL,
    count       BIGINT      NOT NULL,
    first_seen  TIMESTAMPTZ NOT NULL,
    last_seen   TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS results (
    id          TEXT        PRIMARY KEY,
    target      TEXT        NOT NULL,
    payload     JSONB       NOT NULL,
    captured_at TIMESTAMPTZ NOT NULL
);

DO $migrate$
BEGIN
    IF NOT EXISTS (SELECT 1 FROM pg_proc WHERE proname = 'results_mark_done') THEN
        CREATE FUNCTION results_mark_done() RETURNS trigger AS $body$
        BEGIN
            UPDATE tasks SET status = TRUE WHERE id = NEW.id;
            RETURN NEW;
        END;
        $body$ LANGUAGE plpgsql;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM pg_trigger
        WHERE tgname = 'results_mark_done' AND tgrelid = 'results'::regclass
    ) THEN
        CREATE TRIGGER results_mark_done
            AFTER INSERT ON results
            FOR EACH ROW EXECUTE FUNCTION results_mark_done();
    END IF;
END
$migrate$;
"#;

/// Advisory lock serialising schema setup across processes ("harvest" in ASCII).
pub const SCHEMA_LOCK_KEY: i64 = 0x0068_6172_7665_7374;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, HarvestError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;

        let store = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        store.migrate().await?;

        tracing::info!("postgres store connected");
        Ok(store)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Idempotent, and safe to run from many processes at once.
    pub async fn migrate(&self) -> Result<(), HarvestError> {
        let mut tx = self.pool.begin().await?;
        // Released at commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(SCHEMA_SQL)).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, HarvestError> {
    Ok(Task {
        id: TaskId::new(row.try_get::<String, _>("id")?),
        target: row.try_get("target")?,
        status: TaskStatus::from_flag(row.try_get("status")?),
        discovered_at: row.try_get("discovered_at")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

fn duplicate_from_row(row: &PgRow) -> Result<DuplicateRecord, HarvestError> {
    Ok(DuplicateRecord {
        id: TaskId::new(row.try_get::<String, _>("id")?),
        target: row.try_get("target")?,
        count: row.try_get::<i64, _>("count")? as u64,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

#[async_trait]
impl BacklogStore for PgStore {
    async fn insert_if_absent(&self, id: &TaskId, target: &str) -> Result<bool, HarvestError> {
        let done = sqlx::query(
            "INSERT INTO tasks (id, target, status, discovered_at)
             VALUES ($1, $2, NULL, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(target)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn claim_next(&self) -> Result<Option<Task>, HarvestError> {
        let row = sqlx::query(
            "WITH next AS (
                 SELECT id FROM tasks
                 WHERE status IS NULL
                 ORDER BY discovered_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE tasks
             SET status = FALSE, claimed_at = $1
             FROM next
             WHERE tasks.id = next.id
             RETURNING tasks.id, tasks.target, tasks.status, tasks.discovered_at, tasks.claimed_at",
        )
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn requeue(&self, id: &TaskId) -> Result<(), HarvestError> {
        sqlx::query(
            "UPDATE tasks SET status = NULL, claimed_at = NULL WHERE id = $1 AND status = FALSE",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, HarvestError> {
        let row = sqlx::query(
            "SELECT id, target, status, discovered_at, claimed_at FROM tasks WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn reset_claims(
        &self,
        claimed_before: Option<DateTime<Utc>>,
    ) -> Result<u64, HarvestError> {
        // A NULL cutoff matches every claimed row.
        let done = sqlx::query(
            "UPDATE tasks SET status = NULL, claimed_at = NULL
             WHERE status = FALSE
               AND ($1::timestamptz IS NULL OR claimed_at IS NULL OR claimed_at < $1)",
        )
        .bind(claimed_before)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn counts(&self) -> Result<BacklogCounts, HarvestError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = BacklogCounts::default();
        for row in rows {
            let n = row.try_get::<i64, _>("n")? as u64;
            match TaskStatus::from_flag(row.try_get("status")?) {
                TaskStatus::Unclaimed => counts.unclaimed = n,
                TaskStatus::Claimed => counts.claimed = n,
                TaskStatus::Done => counts.done = n,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl DuplicateLedger for PgStore {
    async fn record_sighting(
        &self,
        id: &TaskId,
        target: &str,
    ) -> Result<DuplicateRecord, HarvestError> {
        let row = sqlx::query(
            "INSERT INTO duplicates (id, target, count, first_seen, last_seen)
             VALUES ($1, $2, 1, $3, $3)
             ON CONFLICT (id) DO UPDATE SET
                 count = duplicates.count + 1,
                 last_seen = EXCLUDED.last_seen
             RETURNING id, target, count, first_seen, last_seen",
        )
        .bind(id.as_str())
        .bind(target)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;
        duplicate_from_row(&row)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<DuplicateRecord>, HarvestError> {
        let row = sqlx::query(
            "SELECT id, target, count, first_seen, last_seen FROM duplicates WHERE id = $1",
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
impl ResultSink for PgStore {
    async fn store(
        &self,
        id: &TaskId,
        target: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, HarvestError> {
        let done = sqlx::query(
            "INSERT INTO results (id, target, payload, captured_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(target)
        .bind(Json(payload))
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<ResultRecord>, HarvestError> {
        let row = sqlx::query("SELECT id, target, payload, captured_at FROM results WHERE id = $1")
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
            captured_at: row.try_get("captured_at")?,
        }))
    }

    async fn total(&self) -> Result<u64, HarvestError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

/// These run only when `HARVEST_TEST_POSTGRES_URL` points at a scratch database.
#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use ulid::Ulid;

    async fn connect() -> Option<PgStore> {
        let url = std::env::var("HARVEST_TEST_POSTGRES_URL").ok()?;
        Some(PgStore::connect(&url).await.unwrap())
    }

    #[tokio::test]
    async fn claim_store_and_complete() {
        let Some(store) = connect().await else {
            return;
        };
        let id = TaskId::new(format!("pg-{}/1", Ulid::new()));
        assert!(store.insert_if_absent(&id, "https://x/pg/1").await.unwrap());
        assert!(!store.insert_if_absent(&id, "https://x/pg/1").await.unwrap());

        let payload = serde_json::json!({"ok": true});
        assert!(store.store(&id, "https://x/pg/1", &payload).await.unwrap());
        assert!(!store.store(&id, "https://x/pg/1", &payload).await.unwrap());

        let task = BacklogStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn concurrent_connects_all_migrate() {
        let Ok(url) = std::env::var("HARVEST_TEST_POSTGRES_URL") else {
            return;
        };
        for _round in 0..3 {
            let mut connects = tokio::task::JoinSet::new();
            for _ in 0..8 {
                let url = url.clone();
                connects.spawn(async move { PgStore::connect(&url).await });
            }
            while let Some(joined) = connects.join_next().await {
                let store = joined.unwrap().unwrap();
                store.counts().await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_task() {
        let Some(store) = connect().await else {
            return;
        };
        // Other rows may exist; only our own ids are checked.
        let run = Ulid::new();
        for n in 0..20 {
            store
                .insert_if_absent(&TaskId::new(format!("pg-{run}/{n}")), "https://x")
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(task) = store.claim_next().await.unwrap() {
                    mine.push(task.id);
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "task claimed twice");
            }
        }
        let prefix = format!("pg-{run}/");
        assert_eq!(
            seen.iter().filter(|id| id.as_str().starts_with(&prefix)).count(),
            20
        );
    }
}
