use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::model::{Job, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} does not exist")]
    NotFound(Uuid),

    #[error("stored job row is invalid: {0}")]
    InvalidRow(String),

    #[error("store call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// Durable job records, keyed by job id.
///
/// `save` is a full replace of status, verdict and `updated_at`, committed in
/// its own transaction. Implementations must roll back on every error path.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn save(&self, job: &Job) -> Result<(), StoreError>;
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    status: String,
    verdict: Option<Value>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
        Ok(Job {
            id: row.id,
            status,
            verdict: row.verdict,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Tooling helpers (ingress creates jobs in production)
    // ----------------------------

    pub async fn insert_pending(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO analysis_jobs (id, status, verdict)
            VALUES ($1, $2, NULL)
            ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status,
                    verdict = NULL,
                    updated_at = now()
            RETURNING id, status, verdict, updated_at
            "#,
        )
        .bind(id)
        .bind(JobStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*)::bigint
            FROM analysis_jobs
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn truncate(&self) -> Result<(), StoreError> {
        sqlx::query("TRUNCATE TABLE analysis_jobs")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, status, verdict, updated_at FROM analysis_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        // Dropping `tx` without commit rolls back.
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = $2,
                verdict = $3,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(&job.verdict)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(job.id));
        }

        tx.commit().await?;
        Ok(())
    }
}
