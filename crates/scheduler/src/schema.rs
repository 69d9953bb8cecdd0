//! DDL for the `scheduled_jobs` table.

use sqlx::PgPool;

use crate::repository::RepositoryError;

pub const SCHEDULED_JOBS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    job_type TEXT NOT NULL,
    expression TEXT NOT NULL,
    config JSONB NOT NULL DEFAULT '{}'::jsonb,
    priority INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts >= 1),
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    last_run TIMESTAMPTZ,
    next_run TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS scheduled_jobs_due_idx
    ON scheduled_jobs (next_run)
    WHERE is_active;
"#;

/// Create the schedule table if missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), RepositoryError> {
    sqlx::raw_sql(SCHEDULED_JOBS_SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| {
            RepositoryError::storage(format!("failed to apply scheduled_jobs schema: {e}"))
        })?;
    tracing::debug!("scheduled_jobs schema ensured");
    Ok(())
}
