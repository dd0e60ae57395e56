use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

use crate::job::{Job, JobId, JobStatus, ListFilter, MetricsSnapshot};

use super::{Result, StoreError, CLAIM_TIMEOUT};

/// Postgres-backed job store.
///
/// Claims rely on `FOR UPDATE SKIP LOCKED`, so concurrent pollers in this
/// process or any other skip rows another claimer holds instead of
/// blocking on them.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Call [`PgStore::migrate`] separately if the
    /// schema may not exist yet.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotently create the jobs table and its indexes.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                owner_id UUID,
                name TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}'::jsonb,
                run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Supports the "earliest eligible" scan in claim_next.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_status_run_at ON jobs(status, run_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_owner_id ON jobs(owner_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(&self, row: PgRow) -> Result<Job> {
        let id: Uuid = row.get("id");
        let owner: Option<Uuid> = row.get("owner_id");
        let name: String = row.get("name");
        let payload: serde_json::Value = row.get("payload");
        let run_at = row.get("run_at");
        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");
        let status: String = row.get("status");
        let last_error: Option<String> = row.get("last_error");
        let created_at = row.get("created_at");
        let updated_at = row.get("updated_at");

        Ok(Job {
            id: JobId(id),
            owner,
            name,
            payload,
            run_at,
            attempts,
            max_attempts,
            status: JobStatus::from_db(&status),
            last_error,
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl super::Store for PgStore {
    async fn enqueue(&self, job: Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, owner_id, name, payload, run_at, attempts, max_attempts, status, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id.0)
        .bind(job.owner)
        .bind(&job.name)
        .bind(&job.payload)
        .bind(job.run_at)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.status.as_str())
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate(job.id),
            _ => StoreError::Database(e),
        })?;

        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        // Single transactional statement: lock the earliest eligible row,
        // skipping rows other claimers hold, and flip it to running while
        // spending one attempt.
        let claim = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status IN ('pending', 'retry')
                  AND run_at <= NOW()
                ORDER BY run_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool);

        let row = match tokio::time::timeout(CLAIM_TIMEOUT, claim).await {
            Ok(row) => row?,
            Err(_) => return Err(StoreError::Timeout),
        };

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn mark_done(&self, id: JobId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_retry(&self, id: JobId, reason: &str, owner: Option<Uuid>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'retry',
                last_error = $2,
                run_at = NOW() + INTERVAL '15 seconds',
                updated_at = NOW()
            WHERE id = $1
              AND ($3::uuid IS NULL OR owner_id = $3)
            "#,
        )
        .bind(id.0)
        .bind(reason)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_pending(&self, id: JobId, owner: Option<Uuid>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                run_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND ($2::uuid IS NULL OR owner_id = $2)
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn cancel(&self, id: JobId, reason: &str, owner: Option<Uuid>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
              AND ($3::uuid IS NULL OR owner_id = $3)
            "#,
        )
        .bind(id.0)
        .bind(reason)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE ($1::uuid IS NULL OR owner_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.owner)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.effective_limit())
        .bind(filter.effective_offset())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_job(row)).collect()
    }

    async fn count_by_status(&self, owner: Option<Uuid>) -> Result<HashMap<JobStatus, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM jobs
            WHERE ($1::uuid IS NULL OR owner_id = $1)
            GROUP BY status
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            counts.insert(JobStatus::from_db(&status), count);
        }
        Ok(counts)
    }

    async fn metrics(&self, owner: Option<Uuid>) -> Result<MetricsSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'retry') AS retry,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'done') AS done,
                COUNT(*) FILTER (WHERE status = 'done' AND updated_at >= NOW() - INTERVAL '1 hour') AS done_last_hour,
                COUNT(*) FILTER (WHERE status = 'failed' AND updated_at >= NOW() - INTERVAL '1 hour') AS failed_last_hour,
                MIN(run_at) FILTER (WHERE status IN ('pending', 'retry')) AS next_scheduled
            FROM jobs
            WHERE ($1::uuid IS NULL OR owner_id = $1)
            "#,
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;

        Ok(MetricsSnapshot {
            total: row.get("total"),
            pending: row.get("pending"),
            running: row.get("running"),
            retry: row.get("retry"),
            failed: row.get("failed"),
            done: row.get("done"),
            done_last_hour: row.get("done_last_hour"),
            failed_last_hour: row.get("failed_last_hour"),
            next_scheduled: row.get("next_scheduled"),
        })
    }

    async fn recover_stuck(&self, stale_after: chrono::Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now() - stale_after;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'retry' END,
                last_error = CASE WHEN attempts >= max_attempts
                                  THEN 'worker lost; attempts exhausted'
                                  ELSE last_error END,
                run_at = NOW(),
                updated_at = NOW()
            WHERE status = 'running'
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
