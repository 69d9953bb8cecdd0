//! DDL for the `job_records` table.

use sqlx::PgPool;

use crate::error::QueueError;

/// Idempotent schema for the job record table.
///
/// The partial index covers exactly the rows `claim` scans, in claim order.
pub const JOB_RECORDS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_records (
    id UUID PRIMARY KEY,
    job_type TEXT NOT NULL,
    payload JSONB NOT NULL DEFAULT '{}'::jsonb,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    max_attempts INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts >= 1),
    scheduled_for TIMESTAMPTZ NOT NULL,
    claimed_at TIMESTAMPTZ,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS job_records_claim_idx
    ON job_records (priority DESC, scheduled_for ASC, created_at ASC)
    WHERE status = 'pending';

CREATE INDEX IF NOT EXISTS job_records_status_updated_idx
    ON job_records (status, updated_at);

CREATE INDEX IF NOT EXISTS job_records_lease_idx
    ON job_records (claimed_at)
    WHERE status = 'processing';
"#;

/// Create the job record table and indexes if missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), QueueError> {
    sqlx::raw_sql(JOB_RECORDS_SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| QueueError::storage(format!("failed to apply job_records schema: {e}")))?;
    tracing::debug!("job_records schema ensured");
    Ok(())
}
