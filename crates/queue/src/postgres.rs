//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim` is a single statement: a `FOR UPDATE SKIP LOCKED` selection of due
//! pending rows feeding an `UPDATE ... RETURNING`. Concurrent claimers in any
//! number of processes skip rows another transaction already holds, so a
//! pending row is transitioned by exactly one of them.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Storage` (duplicate id) |
//! | Database (check violation) | `23514` | `Corrupt` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use forgejobs_core::JobId;

use crate::error::QueueError;
use crate::store::{FailOutcome, JobStore};
use crate::types::{BackoffPolicy, ClaimToken, JobFilter, JobRecord, JobStatus, QueueStats};

const RECORD_COLUMNS: &str = "id, job_type, payload, priority, status, attempts, max_attempts, \
     scheduled_for, claimed_at, error, created_at, updated_at";

/// Job store over the `job_records` table.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, operation: &str, id: JobId) -> Result<bool, QueueError> {
        Ok(self.status_of(operation, id).await?.is_some())
    }

    async fn status_of(&self, operation: &str, id: JobId) -> Result<Option<JobStatus>, QueueError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_records WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        status.map(|s| s.parse()).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, record), fields(job_id = %record.id, job_type = %record.job_type), err)]
    async fn insert(&self, record: &JobRecord) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO job_records (
                id, job_type, payload, priority, status, attempts, max_attempts,
                scheduled_for, claimed_at, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.job_type)
        .bind(&record.payload)
        .bind(record.priority)
        .bind(record.status.as_str())
        .bind(to_db_count(record.attempts))
        .bind(to_db_count(record.max_attempts))
        .bind(record.scheduled_for)
        .bind(record.claimed_at)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let row: Option<JobRecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM job_records WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(JobRecord::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, QueueError> {
        let rows: Vec<JobRecordRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM job_records
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY priority DESC, scheduled_for ASC, created_at ASC
            LIMIT $3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.as_deref())
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<JobRecordRow> = sqlx::query_as(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM job_records
                WHERE status = 'pending' AND scheduled_for <= $1
                ORDER BY priority DESC, scheduled_for ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_records j
            SET status = 'processing',
                attempts = j.attempts + 1,
                claimed_at = $1,
                updated_at = $1
            FROM next_jobs
            WHERE j.id = next_jobs.id AND j.status = 'pending'
            RETURNING j.id, j.job_type, j.payload, j.priority, j.status, j.attempts,
                      j.max_attempts, j.scheduled_for, j.claimed_at, j.error,
                      j.created_at, j.updated_at
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        // RETURNING does not preserve the CTE's order.
        let mut claimed = rows
            .into_iter()
            .map(JobRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(claimed)
    }

    #[instrument(skip(self), fields(job_id = %claim.id, attempt = claim.attempt), err)]
    async fn complete(&self, claim: ClaimToken, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = 'completed', error = NULL, claimed_at = NULL, updated_at = $3
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            "#,
        )
        .bind(claim.id.as_uuid())
        .bind(to_db_count(claim.attempt))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.status_of("complete", claim.id).await? {
            Some(status) => Ok(status == JobStatus::Completed),
            None => Err(QueueError::NotFound(claim.id)),
        }
    }

    #[instrument(skip(self, error, backoff), fields(job_id = %claim.id, attempt = claim.attempt), err)]
    async fn fail(
        &self,
        claim: ClaimToken,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let id = claim.id;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("fail", e))?;

        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts
            FROM job_records
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_db_count(claim.attempt))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("fail", e))?;
            return if self.exists("fail", id).await? {
                Ok(FailOutcome::Stale)
            } else {
                Err(QueueError::NotFound(id))
            };
        };

        let attempts = from_db_count(
            row.try_get("attempts")
                .map_err(|e| map_sqlx_error("fail", e))?,
        )?;
        let max_attempts = from_db_count(
            row.try_get("max_attempts")
                .map_err(|e| map_sqlx_error("fail", e))?,
        )?;

        let outcome = if attempts < max_attempts {
            let retry_at = backoff.retry_at(attempts, now);
            sqlx::query(
                r#"
                UPDATE job_records
                SET status = 'pending', error = $2, scheduled_for = $3,
                    claimed_at = NULL, updated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(error)
            .bind(retry_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("fail", e))?;
            FailOutcome::Retrying { attempts, retry_at }
        } else {
            sqlx::query(
                r#"
                UPDATE job_records
                SET status = 'failed', error = $2, claimed_at = NULL, updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("fail", e))?;
            FailOutcome::Exhausted { attempts }
        };

        tx.commit().await.map_err(|e| map_sqlx_error("fail", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self, error), fields(job_id = %claim.id, attempt = claim.attempt), err)]
    async fn fail_permanently(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = 'failed', error = $3, claimed_at = NULL, updated_at = $4
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            "#,
        )
        .bind(claim.id.as_uuid())
        .bind(to_db_count(claim.attempt))
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_permanently", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists("fail_permanently", claim.id).await? {
            Ok(false)
        } else {
            Err(QueueError::NotFound(claim.id))
        }
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                MIN(scheduled_for) FILTER (WHERE status = 'pending') AS oldest_pending
            FROM job_records
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, QueueError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as u64)
        };

        Ok(QueueStats {
            pending: count("pending")?,
            processing: count("processing")?,
            completed: count("completed")?,
            failed: count("failed")?,
            oldest_pending_scheduled_for: row
                .try_get("oldest_pending")
                .map_err(|e| map_sqlx_error("stats", e))?,
        })
    }

    #[instrument(skip(self), err)]
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let result =
            sqlx::query("DELETE FROM job_records WHERE status = 'completed' AND updated_at < $1")
                .bind(cutoff)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_completed_before", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn reset_failed(&self, max_attempts: u32, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = 'pending', max_attempts = GREATEST(max_attempts, $1), error = NULL,
                scheduled_for = $2, claimed_at = NULL, updated_at = $2
            WHERE status = 'failed' AND attempts < $1
            "#,
        )
        .bind(to_db_count(max_attempts))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_failed", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_one(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = 'pending', max_attempts = GREATEST(max_attempts, attempts + 1),
                error = NULL, scheduled_for = $2, claimed_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_one", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists("retry_one", id).await? {
            Ok(false)
        } else {
            Err(QueueError::NotFound(id))
        }
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                error = CASE
                    WHEN attempts < max_attempts THEN 'lease expired'
                    ELSE 'lease expired after ' || attempts || ' attempts'
                END,
                scheduled_for = CASE WHEN attempts < max_attempts THEN $2 ELSE scheduled_for END,
                claimed_at = NULL,
                updated_at = $2
            WHERE status = 'processing' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        Ok(result.rows_affected())
    }
}

/// Map SQLx errors to queue errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => QueueError::Storage(format!("duplicate job id ({msg})")),
                Some("23514") => QueueError::Corrupt(msg),
                _ => QueueError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            QueueError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => QueueError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32) -> Result<u32, QueueError> {
    u32::try_from(value).map_err(|_| QueueError::corrupt(format!("negative counter: {value}")))
}

/// Database row representation.
#[derive(Debug)]
struct JobRecordRow {
    id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    scheduled_for: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRecordRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_for: row.try_get("scheduled_for")?,
            claimed_at: row.try_get("claimed_at")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRecordRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: JobRecordRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            payload: row.payload,
            priority: row.priority,
            status: row.status.parse::<JobStatus>()?,
            attempts: from_db_count(row.attempts)?,
            max_attempts: from_db_count(row.max_attempts)?,
            scheduled_for: row.scheduled_for,
            claimed_at: row.claimed_at,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;
    use crate::types::EnqueueOptions;
    use chrono::Duration;

    /// Connect to the database named by `TEST_DATABASE_URL`, or skip.
    async fn test_store() -> Option<PostgresJobStore> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        ensure_schema(&pool).await.ok()?;
        Some(PostgresJobStore::new(pool))
    }

    fn unique_type() -> String {
        format!("pg_test_{}", JobId::new())
    }

    #[tokio::test]
    async fn claim_transitions_exactly_once() {
        let Some(store) = test_store().await else {
            return;
        };
        let now = Utc::now();
        let job_type = unique_type();
        let job = JobRecord::new(&job_type, serde_json::json!({"n": 1}), Default::default(), now);
        store.insert(&job).await.unwrap();

        let first = store.claim(now, 10).await.unwrap();
        assert!(first.iter().any(|j| j.id == job.id));
        let claimed = first.iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        let second = store.claim(now, 10).await.unwrap();
        assert!(second.iter().all(|j| j.id != job.id));

        assert!(store.complete(claimed.claim_token(), now).await.unwrap());
        assert!(store.complete(claimed.claim_token(), now).await.unwrap());
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn fail_applies_backoff_and_exhausts() {
        let Some(store) = test_store().await else {
            return;
        };
        let now = Utc::now();
        let job = JobRecord::new(
            unique_type(),
            serde_json::Value::Null,
            EnqueueOptions::default().with_max_attempts(1),
            now,
        );
        store.insert(&job).await.unwrap();
        let claimed = store.claim(now, 100).await.unwrap();
        let claim = claimed
            .iter()
            .find(|j| j.id == job.id)
            .map(JobRecord::claim_token)
            .unwrap();

        let outcome = store
            .fail(claim, "boom", &BackoffPolicy::default(), now)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 1 });

        let outcome = store
            .fail(claim, "again", &BackoffPolicy::default(), now)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Stale);

        assert!(store.retry_one(job.id, now).await.unwrap());
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.max_attempts, 2);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let Some(store) = test_store().await else {
            return;
        };
        let now = Utc::now();
        let unknown = ClaimToken {
            id: JobId::new(),
            attempt: 1,
        };
        assert!(matches!(
            store.complete(unknown, now).await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            store.fail(unknown, "x", &BackoffPolicy::none(), now).await,
            Err(QueueError::NotFound(_))
        ));
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_type() {
        let Some(store) = test_store().await else {
            return;
        };
        let now = Utc::now() - Duration::minutes(1);
        let job_type = unique_type();
        for priority in [1, 5] {
            let job = JobRecord::new(
                &job_type,
                serde_json::Value::Null,
                EnqueueOptions::default().with_priority(priority),
                now,
            );
            store.insert(&job).await.unwrap();
        }

        let listed = store
            .list(&JobFilter::default().with_job_type(&job_type))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].priority, 5);
    }

    #[tokio::test]
    async fn late_report_after_reclaim_is_stale() {
        let Some(store) = test_store().await else {
            return;
        };
        let start = Utc::now() - Duration::hours(1);
        let job = JobRecord::new(
            unique_type(),
            serde_json::Value::Null,
            EnqueueOptions::default().with_priority(1000),
            start,
        );
        store.insert(&job).await.unwrap();

        let first = store
            .claim(start, 1)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.id == job.id)
            .unwrap();
        let later = start + Duration::minutes(16);
        store
            .reclaim_expired(later - Duration::minutes(15), later)
            .await
            .unwrap();
        let second = store
            .claim(later, 1)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.id == job.id)
            .unwrap();

        let outcome = store
            .fail(first.claim_token(), "slow", &BackoffPolicy::none(), later)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Stale);
        assert!(!store.complete(first.claim_token(), later).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, second.attempts);
        assert!(store.complete(second.claim_token(), later).await.unwrap());
    }
}
