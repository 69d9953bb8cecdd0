//! Job storage abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use forgejobs_core::JobId;

use crate::error::QueueError;
use crate::types::{BackoffPolicy, ClaimToken, JobFilter, JobRecord, QueueStats};

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending, claimable again at `retry_at`.
    Retrying { attempts: u32, retry_at: DateTime<Utc> },
    /// Attempts exhausted; the record is terminally failed.
    Exhausted { attempts: u32 },
    /// The record is no longer processing under the reported claim (already
    /// reported, or reclaimed and possibly claimed again). Nothing changed.
    Stale,
}

/// Durable table of job records.
///
/// Every state transition is a single atomic operation on the store. Callers
/// pass `now` explicitly so all time comparisons follow the caller's clock.
///
/// Implementations must guarantee that `claim` never hands the same pending
/// record to two callers, including callers in different processes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, record: &JobRecord) -> Result<(), QueueError>;

    /// Get a record by id.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError>;

    /// List records, highest priority and oldest schedule first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, QueueError>;

    /// Atomically claim up to `limit` due pending records.
    ///
    /// Claimed records are `processing`, have `attempts` incremented and
    /// `claimed_at = now`. Returned highest priority first, then oldest
    /// `scheduled_for`.
    async fn claim(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, QueueError>;

    /// Mark the claimed record completed.
    ///
    /// Returns `true` if the record is completed afterwards (completing twice
    /// is a no-op) and `false` if `claim` is stale.
    async fn complete(&self, claim: ClaimToken, now: DateTime<Utc>) -> Result<bool, QueueError>;

    /// Record a failed attempt of the claimed record.
    ///
    /// Goes back to pending with `scheduled_for` pushed out by `backoff` while
    /// attempts remain, otherwise becomes terminally failed.
    async fn fail(
        &self,
        claim: ClaimToken,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError>;

    /// Mark the claimed record terminally failed regardless of remaining
    /// attempts. Returns `false` if `claim` is stale.
    async fn fail_permanently(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    /// Count records per status.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Delete completed records last updated before `cutoff`.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Requeue failed records with `attempts < max_attempts`, raising their
    /// ceiling to at least `max_attempts` (never lowering it).
    async fn reset_failed(&self, max_attempts: u32, now: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Requeue one failed record with one more attempt allowed.
    async fn retry_one(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, QueueError>;

    /// Release processing records whose lease started before `claimed_before`.
    async fn reclaim_expired(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, record: &JobRecord) -> Result<(), QueueError> {
        (**self).insert(record).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        (**self).get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, QueueError> {
        (**self).list(filter).await
    }

    async fn claim(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        (**self).claim(now, limit).await
    }

    async fn complete(&self, claim: ClaimToken, now: DateTime<Utc>) -> Result<bool, QueueError> {
        (**self).complete(claim, now).await
    }

    async fn fail(
        &self,
        claim: ClaimToken,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        (**self).fail(claim, error, backoff, now).await
    }

    async fn fail_permanently(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        (**self).fail_permanently(claim, error, now).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats().await
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        (**self).delete_completed_before(cutoff).await
    }

    async fn reset_failed(&self, max_attempts: u32, now: DateTime<Utc>) -> Result<u64, QueueError> {
        (**self).reset_failed(max_attempts, now).await
    }

    async fn retry_one(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        (**self).retry_one(id, now).await
    }

    async fn reclaim_expired(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        (**self).reclaim_expired(claimed_before, now).await
    }
}
