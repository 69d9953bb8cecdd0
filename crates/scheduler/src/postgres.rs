//! Postgres-backed schedule repository.
//!
//! Shares the database (usually the pool) with the job store, so definitions
//! and their `last_run`/`next_run` survive restarts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use forgejobs_core::ScheduleId;

use crate::cron::ScheduleExpression;
use crate::definition::ScheduledJobDefinition;
use crate::repository::{RepositoryError, ScheduleRepository};

const DEFINITION_COLUMNS: &str = "id, name, job_type, expression, config, priority, \
     max_attempts, is_active, last_run, next_run, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresScheduleRepository {
    pool: Arc<PgPool>,
}

impl PostgresScheduleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ScheduleRepository for PostgresScheduleRepository {
    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<ScheduledJobDefinition>, RepositoryError> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_jobs ORDER BY name ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.into_iter().map(ScheduledJobDefinition::try_from).collect()
    }

    #[instrument(skip(self), fields(schedule_id = %id), err)]
    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduledJobDefinition>, RepositoryError> {
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_jobs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(ScheduledJobDefinition::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ScheduledJobDefinition>, RepositoryError> {
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_jobs WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_name", e))?;

        row.map(ScheduledJobDefinition::try_from).transpose()
    }

    #[instrument(skip(self, definition), fields(schedule_id = %definition.id, name = %definition.name), err)]
    async fn put(&self, definition: &ScheduledJobDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, name, job_type, expression, config, priority, max_attempts,
                is_active, last_run, next_run, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                job_type = EXCLUDED.job_type,
                expression = EXCLUDED.expression,
                config = EXCLUDED.config,
                priority = EXCLUDED.priority,
                max_attempts = EXCLUDED.max_attempts,
                is_active = EXCLUDED.is_active,
                last_run = EXCLUDED.last_run,
                next_run = EXCLUDED.next_run,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(definition.id.as_uuid())
        .bind(&definition.name)
        .bind(&definition.job_type)
        .bind(definition.expression.to_string())
        .bind(&definition.config)
        .bind(definition.priority)
        .bind(i32::try_from(definition.max_attempts).unwrap_or(i32::MAX))
        .bind(definition.is_active)
        .bind(definition.last_run)
        .bind(definition.next_run)
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
                RepositoryError::DuplicateName(definition.name.clone())
            }
            other => map_sqlx_error("put", other),
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(schedule_id = %id), err)]
    async fn delete(&self, id: ScheduleId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(schedule_id = %id), err)]
    async fn advance(
        &self,
        id: ScheduleId,
        expected_next_run: DateTime<Utc>,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET last_run = $3,
                next_run = $4,
                is_active = $5,
                updated_at = $3
            WHERE id = $1 AND next_run = $2 AND is_active
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected_next_run)
        .bind(last_run)
        .bind(next_run)
        .bind(next_run.is_some())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("advance", e))?;

        Ok(result.rows_affected() > 0)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => RepositoryError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            RepositoryError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct DefinitionRow {
    id: uuid::Uuid,
    name: String,
    job_type: String,
    expression: String,
    config: serde_json::Value,
    priority: i32,
    max_attempts: i32,
    is_active: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for DefinitionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(DefinitionRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            job_type: row.try_get("job_type")?,
            expression: row.try_get("expression")?,
            config: row.try_get("config")?,
            priority: row.try_get("priority")?,
            max_attempts: row.try_get("max_attempts")?,
            is_active: row.try_get("is_active")?,
            last_run: row.try_get("last_run")?,
            next_run: row.try_get("next_run")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<DefinitionRow> for ScheduledJobDefinition {
    type Error = RepositoryError;

    fn try_from(row: DefinitionRow) -> Result<Self, Self::Error> {
        let expression: ScheduleExpression = row.expression.parse().map_err(|e| {
            RepositoryError::Corrupt(format!("schedule '{}' has invalid expression: {e}", row.name))
        })?;
        let max_attempts = u32::try_from(row.max_attempts).map_err(|_| {
            RepositoryError::Corrupt(format!("schedule '{}' has negative max_attempts", row.name))
        })?;

        Ok(ScheduledJobDefinition {
            id: ScheduleId::from_uuid(row.id),
            name: row.name,
            job_type: row.job_type,
            expression,
            config: row.config,
            priority: row.priority,
            max_attempts,
            is_active: row.is_active,
            last_run: row.last_run,
            next_run: row.next_run,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;

    async fn test_repository() -> Option<PostgresScheduleRepository> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        ensure_schema(&pool).await.ok()?;
        Some(PostgresScheduleRepository::new(pool))
    }

    #[tokio::test]
    async fn definitions_round_trip_through_postgres() {
        let Some(repo) = test_repository().await else {
            return;
        };
        let name = format!("pg-test-{}", ScheduleId::new());
        let mut def = ScheduledJobDefinition::new(
            &name,
            "generate_report",
            "0 6 * * 1".parse().unwrap(),
            serde_json::json!({"kind": "weekly"}),
            3,
            Utc::now(),
        );
        repo.put(&def).await.unwrap();

        def.record_run(Utc::now());
        repo.put(&def).await.unwrap();

        let stored = repo.find_by_name(&name).await.unwrap().unwrap();
        assert_eq!(stored.id, def.id);
        assert_eq!(stored.expression, def.expression);
        assert!(stored.last_run.is_some());

        let clash = ScheduledJobDefinition::new(
            &name,
            "generate_report",
            "0 6 * * 1".parse().unwrap(),
            serde_json::Value::Null,
            0,
            Utc::now(),
        );
        assert!(matches!(
            repo.put(&clash).await,
            Err(RepositoryError::DuplicateName(_))
        ));

        assert!(repo.delete(def.id).await.unwrap());
    }

    #[tokio::test]
    async fn advance_is_won_once_and_skips_deleted_rows() {
        let Some(repo) = test_repository().await else {
            return;
        };
        let def = ScheduledJobDefinition::new(
            format!("pg-advance-{}", ScheduleId::new()),
            "send_email",
            "0 8 * * *".parse().unwrap(),
            serde_json::json!({}),
            0,
            Utc::now(),
        );
        repo.put(&def).await.unwrap();
        let expected = def.next_run.unwrap();
        let now = Utc::now();
        let following = expected + chrono::Duration::days(1);

        assert!(repo.advance(def.id, expected, now, Some(following)).await.unwrap());
        assert!(!repo.advance(def.id, expected, now, Some(following)).await.unwrap());
        assert_eq!(
            repo.get(def.id).await.unwrap().unwrap().next_run,
            Some(following)
        );

        assert!(repo.delete(def.id).await.unwrap());
        assert!(!repo.advance(def.id, following, now, None).await.unwrap());
        assert!(repo.get(def.id).await.unwrap().is_none());
    }
}
