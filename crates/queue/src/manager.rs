//! Queue manager: the API producers, workers and operators talk to.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use forgejobs_core::{Clock, JobId, SystemClock};

use crate::error::QueueError;
use crate::store::{FailOutcome, JobStore};
use crate::types::{
    BackoffPolicy, ClaimToken, EnqueueOptions, JobFilter, JobRecord, QueueStats, to_chrono,
};

/// Upper bound on records claimed in one call.
pub const MAX_CLAIM_BATCH: usize = 10;

/// Mediates every job record transition.
///
/// Cheap to clone; clones share the store and clock.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Manager on the wall clock with the default backoff.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Queue a job; it becomes claimable once `options.delay` has elapsed.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let record = JobRecord::new(job_type, payload, options, self.clock.now());
        self.store.insert(&record).await?;

        debug!(
            job_id = %record.id,
            job_type = %record.job_type,
            priority = record.priority,
            scheduled_for = %record.scheduled_for,
            "job enqueued"
        );
        Ok(record.id)
    }

    /// Claim the next due job, if any.
    pub async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.claim_batch(1).await?.into_iter().next())
    }

    /// Claim up to `limit` due jobs (at most [`MAX_CLAIM_BATCH`]).
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        let limit = limit.min(MAX_CLAIM_BATCH);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let claimed = self.store.claim(self.clock.now(), limit).await?;
        for job in &claimed {
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                "job claimed"
            );
        }
        Ok(claimed)
    }

    /// Mark a claimed job completed. Completing twice is a no-op.
    ///
    /// Returns `false` without touching the record if the claim is stale: its
    /// lease was reclaimed and the job may be running elsewhere.
    pub async fn complete(&self, claim: impl Into<ClaimToken>) -> Result<bool, QueueError> {
        let claim = claim.into();
        let completed = self.store.complete(claim, self.clock.now()).await?;
        if completed {
            debug!(job_id = %claim.id, "job completed");
        } else {
            warn!(
                job_id = %claim.id,
                attempt = claim.attempt,
                "completion reported for a stale claim"
            );
        }
        Ok(completed)
    }

    /// Record a failed attempt; retries with backoff while attempts remain.
    pub async fn fail_retryable(
        &self,
        claim: impl Into<ClaimToken>,
        error: impl AsRef<str>,
    ) -> Result<FailOutcome, QueueError> {
        let claim = claim.into();
        let id = claim.id;
        let error = error.as_ref();
        let outcome = self
            .store
            .fail(claim, error, &self.backoff, self.clock.now())
            .await?;

        match outcome {
            FailOutcome::Retrying { attempts, retry_at } => {
                info!(job_id = %id, attempts, retry_at = %retry_at, error, "job will be retried");
            }
            FailOutcome::Exhausted { attempts } => {
                warn!(job_id = %id, attempts, error, "job failed permanently: attempts exhausted");
            }
            FailOutcome::Stale => {
                warn!(job_id = %id, attempt = claim.attempt, "failure reported for a stale claim");
            }
        }
        Ok(outcome)
    }

    /// Mark a claimed job terminally failed regardless of remaining attempts.
    ///
    /// Returns `false` without touching the record if the claim is stale.
    pub async fn fail_permanently(
        &self,
        claim: impl Into<ClaimToken>,
        error: impl AsRef<str>,
    ) -> Result<bool, QueueError> {
        let claim = claim.into();
        let error = error.as_ref();
        let failed = self
            .store
            .fail_permanently(claim, error, self.clock.now())
            .await?;
        if failed {
            warn!(job_id = %claim.id, error, "job failed permanently");
        } else {
            warn!(
                job_id = %claim.id,
                attempt = claim.attempt,
                "permanent failure reported for a stale claim"
            );
        }
        Ok(failed)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats().await
    }

    /// Delete completed jobs last updated more than `older_than` ago.
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = self.clock.now() - to_chrono(older_than);
        let deleted = self.store.delete_completed_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "completed jobs cleaned up");
        }
        Ok(deleted)
    }

    /// Requeue failed jobs with fewer than `max_attempts` attempts, raising
    /// their ceiling to `max_attempts` (a higher ceiling is kept).
    pub async fn retry_failed(&self, max_attempts: u32) -> Result<u64, QueueError> {
        let reset = self
            .store
            .reset_failed(max_attempts, self.clock.now())
            .await?;
        info!(reset, max_attempts, "failed jobs requeued");
        Ok(reset)
    }

    /// Requeue one failed job with one more attempt.
    ///
    /// Returns `false` if the job exists but is not failed.
    pub async fn retry_job(&self, id: JobId) -> Result<bool, QueueError> {
        let requeued = self.store.retry_one(id, self.clock.now()).await?;
        if requeued {
            info!(job_id = %id, "failed job requeued");
        }
        Ok(requeued)
    }

    /// Release processing jobs whose lease is older than `lease`.
    pub async fn reclaim_expired(&self, lease: Duration) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let reclaimed = self
            .store
            .reclaim_expired(now - to_chrono(lease), now)
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, lease_secs = lease.as_secs(), "expired job leases reclaimed");
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, QueueError> {
        self.store.list(filter).await
    }
}
