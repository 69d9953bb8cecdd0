//! Storage for scheduled job definitions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use forgejobs_core::ScheduleId;

use crate::definition::ScheduledJobDefinition;

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("a schedule named '{0}' already exists")]
    DuplicateName(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt schedule definition: {0}")]
    Corrupt(String),
}

impl RepositoryError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Durable registry of recurring job definitions.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<ScheduledJobDefinition>, RepositoryError>;

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduledJobDefinition>, RepositoryError>;

    async fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ScheduledJobDefinition>, RepositoryError>;

    /// Insert or replace by id. Names are unique across definitions.
    async fn put(&self, definition: &ScheduledJobDefinition) -> Result<(), RepositoryError>;

    /// Remove by id; `false` if it did not exist.
    async fn delete(&self, id: ScheduleId) -> Result<bool, RepositoryError>;

    /// Record a firing of an active definition whose `next_run` is still
    /// `expected_next_run`, moving it to `next_run` (deactivating it when
    /// `None`).
    ///
    /// Never inserts. Returns `false` when the definition is gone, inactive,
    /// or already advanced by someone else; only the caller that gets `true`
    /// owns the occurrence.
    async fn advance(
        &self,
        id: ScheduleId,
        expected_next_run: DateTime<Utc>,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
impl<R> ScheduleRepository for Arc<R>
where
    R: ScheduleRepository + ?Sized,
{
    async fn list(&self) -> Result<Vec<ScheduledJobDefinition>, RepositoryError> {
        (**self).list().await
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduledJobDefinition>, RepositoryError> {
        (**self).get(id).await
    }

    async fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ScheduledJobDefinition>, RepositoryError> {
        (**self).find_by_name(name).await
    }

    async fn put(&self, definition: &ScheduledJobDefinition) -> Result<(), RepositoryError> {
        (**self).put(definition).await
    }

    async fn delete(&self, id: ScheduleId) -> Result<bool, RepositoryError> {
        (**self).delete(id).await
    }

    async fn advance(
        &self,
        id: ScheduleId,
        expected_next_run: DateTime<Utc>,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        (**self)
            .advance(id, expected_next_run, last_run, next_run)
            .await
    }
}

/// In-memory repository for tests/dev. Definitions are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryScheduleRepository {
    definitions: RwLock<HashMap<ScheduleId, ScheduledJobDefinition>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::storage("in-memory schedule repository lock poisoned")
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn list(&self) -> Result<Vec<ScheduledJobDefinition>, RepositoryError> {
        let definitions = self.definitions.read().map_err(|_| poisoned())?;
        Ok(definitions.values().cloned().collect())
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduledJobDefinition>, RepositoryError> {
        let definitions = self.definitions.read().map_err(|_| poisoned())?;
        Ok(definitions.get(&id).cloned())
    }

    async fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ScheduledJobDefinition>, RepositoryError> {
        let definitions = self.definitions.read().map_err(|_| poisoned())?;
        Ok(definitions.values().find(|d| d.name == name).cloned())
    }

    async fn put(&self, definition: &ScheduledJobDefinition) -> Result<(), RepositoryError> {
        let mut definitions = self.definitions.write().map_err(|_| poisoned())?;
        let clash = definitions
            .values()
            .any(|d| d.name == definition.name && d.id != definition.id);
        if clash {
            return Err(RepositoryError::DuplicateName(definition.name.clone()));
        }
        definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn delete(&self, id: ScheduleId) -> Result<bool, RepositoryError> {
        let mut definitions = self.definitions.write().map_err(|_| poisoned())?;
        Ok(definitions.remove(&id).is_some())
    }

    async fn advance(
        &self,
        id: ScheduleId,
        expected_next_run: DateTime<Utc>,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let mut definitions = self.definitions.write().map_err(|_| poisoned())?;
        let Some(definition) = definitions.get_mut(&id) else {
            return Ok(false);
        };
        if !definition.is_active || definition.next_run != Some(expected_next_run) {
            return Ok(false);
        }
        definition.last_run = Some(last_run);
        definition.next_run = next_run;
        definition.is_active = next_run.is_some();
        definition.updated_at = last_run;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn definition(name: &str) -> ScheduledJobDefinition {
        ScheduledJobDefinition::new(
            name,
            "send_email",
            "0 8 * * *".parse().unwrap(),
            serde_json::json!({}),
            0,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn put_get_delete() {
        let repo = InMemoryScheduleRepository::new();
        let mut def = definition("digest");
        repo.put(&def).await.unwrap();

        def.priority = 7;
        repo.put(&def).await.unwrap();
        assert_eq!(repo.get(def.id).await.unwrap().unwrap().priority, 7);
        assert_eq!(repo.find_by_name("digest").await.unwrap().unwrap().id, def.id);
        assert_eq!(repo.list().await.unwrap().len(), 1);

        assert!(repo.delete(def.id).await.unwrap());
        assert!(!repo.delete(def.id).await.unwrap());
        assert!(repo.get(def.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn advance_only_moves_the_expected_occurrence() {
        let repo = InMemoryScheduleRepository::new();
        let def = definition("digest");
        repo.put(&def).await.unwrap();
        let expected = def.next_run.unwrap();
        let now = expected + chrono::Duration::minutes(1);
        let following = expected + chrono::Duration::days(1);

        assert!(repo.advance(def.id, expected, now, Some(following)).await.unwrap());
        // A second caller holding the same occurrence loses.
        assert!(!repo.advance(def.id, expected, now, Some(following)).await.unwrap());

        let stored = repo.get(def.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run, Some(now));
        assert_eq!(stored.next_run, Some(following));
        assert!(stored.is_active);

        assert!(repo.advance(def.id, following, now, None).await.unwrap());
        assert!(!repo.get(def.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn advance_never_resurrects_or_reactivates() {
        let repo = InMemoryScheduleRepository::new();
        let mut paused = definition("paused");
        let expected = paused.next_run.unwrap();
        paused.is_active = false;
        repo.put(&paused).await.unwrap();
        assert!(!repo.advance(paused.id, expected, Utc::now(), Some(expected)).await.unwrap());
        assert!(!repo.get(paused.id).await.unwrap().unwrap().is_active);

        let gone = definition("gone");
        repo.put(&gone).await.unwrap();
        repo.delete(gone.id).await.unwrap();
        assert!(!repo.advance(gone.id, expected, Utc::now(), Some(expected)).await.unwrap());
        assert!(repo.get(gone.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn names_are_unique() {
        let repo = InMemoryScheduleRepository::new();
        repo.put(&definition("digest")).await.unwrap();
        assert!(matches!(
            repo.put(&definition("digest")).await,
            Err(RepositoryError::DuplicateName(name)) if name == "digest"
        ));
    }
}
