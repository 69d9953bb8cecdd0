//! In-memory job store for tests/dev.
//!
//! Each operation runs inside one critical section, which gives the same
//! claim exclusivity the Postgres store gets from row locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use forgejobs_core::JobId;

use crate::error::QueueError;
use crate::store::{FailOutcome, JobStore};
use crate::types::{BackoffPolicy, ClaimToken, JobFilter, JobRecord, JobStatus, QueueStats};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn jobs(&self) -> Result<MutexGuard<'_, HashMap<JobId, JobRecord>>, QueueError> {
        self.jobs
            .lock()
            .map_err(|_| QueueError::storage("in-memory job store lock poisoned"))
    }
}

/// Claim order: highest priority, then oldest schedule, then oldest record.
fn claim_order(a: &JobRecord, b: &JobRecord) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_for.cmp(&b.scheduled_for))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<(), QueueError> {
        let mut jobs = self.jobs()?;
        if jobs.contains_key(&record.id) {
            return Err(QueueError::storage(format!(
                "job already exists: {}",
                record.id
            )));
        }
        jobs.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.jobs()?.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, QueueError> {
        let jobs = self.jobs()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by(claim_order);
        result.truncate(filter.limit);
        Ok(result)
    }

    async fn claim(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        let mut jobs = self.jobs()?;

        let mut candidates: Vec<&JobRecord> =
            jobs.values().filter(|j| j.is_claimable(now)).collect();
        candidates.sort_by(|a, b| claim_order(a, b));
        let ids: Vec<JobId> = candidates.iter().take(limit).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.attempts += 1;
                job.claimed_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, claim: ClaimToken, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(&claim.id).ok_or(QueueError::NotFound(claim.id))?;
        if job.status == JobStatus::Completed {
            return Ok(true);
        }
        if !job.is_held_by(claim) {
            return Ok(false);
        }

        job.status = JobStatus::Completed;
        job.error = None;
        job.claimed_at = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn fail(
        &self,
        claim: ClaimToken,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(&claim.id).ok_or(QueueError::NotFound(claim.id))?;
        if !job.is_held_by(claim) {
            return Ok(FailOutcome::Stale);
        }

        job.error = Some(error.to_string());
        job.claimed_at = None;
        job.updated_at = now;

        if job.can_retry() {
            let retry_at = backoff.retry_at(job.attempts, now);
            job.status = JobStatus::Pending;
            job.scheduled_for = retry_at;
            Ok(FailOutcome::Retrying {
                attempts: job.attempts,
                retry_at,
            })
        } else {
            job.status = JobStatus::Failed;
            Ok(FailOutcome::Exhausted {
                attempts: job.attempts,
            })
        }
    }

    async fn fail_permanently(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(&claim.id).ok_or(QueueError::NotFound(claim.id))?;
        if !job.is_held_by(claim) {
            return Ok(false);
        }

        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.claimed_at = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.jobs()?;
        let mut stats = QueueStats::default();

        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_scheduled_for = Some(
                        stats
                            .oldest_pending_scheduled_for
                            .map_or(job.scheduled_for, |t| t.min(job.scheduled_for)),
                    );
                }
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut jobs = self.jobs()?;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status == JobStatus::Completed && j.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn reset_failed(&self, max_attempts: u32, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut jobs = self.jobs()?;
        let mut reset = 0;

        for job in jobs.values_mut() {
            if job.status == JobStatus::Failed && job.attempts < max_attempts {
                job.status = JobStatus::Pending;
                job.max_attempts = job.max_attempts.max(max_attempts);
                job.error = None;
                job.scheduled_for = now;
                job.updated_at = now;
                reset += 1;
            }
        }

        Ok(reset)
    }

    async fn retry_one(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Failed {
            return Ok(false);
        }

        job.status = JobStatus::Pending;
        job.max_attempts = job.max_attempts.max(job.attempts + 1);
        job.error = None;
        job.scheduled_for = now;
        job.updated_at = now;
        Ok(true)
    }

    async fn reclaim_expired(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let mut jobs = self.jobs()?;
        let mut reclaimed = 0;

        for job in jobs.values_mut() {
            let expired = job.status == JobStatus::Processing
                && job.claimed_at.is_some_and(|at| at < claimed_before);
            if !expired {
                continue;
            }

            job.claimed_at = None;
            job.updated_at = now;
            if job.can_retry() {
                job.status = JobStatus::Pending;
                job.scheduled_for = now;
                job.error = Some("lease expired".to_string());
            } else {
                job.status = JobStatus::Failed;
                job.error = Some(format!("lease expired after {} attempts", job.attempts));
            }
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnqueueOptions;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn unknown_claim() -> ClaimToken {
        ClaimToken {
            id: JobId::new(),
            attempt: 1,
        }
    }

    fn record(priority: i32, at: DateTime<Utc>) -> JobRecord {
        JobRecord::new(
            "test",
            serde_json::json!({}),
            EnqueueOptions::default().with_priority(priority),
            at,
        )
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job = record(0, t0());
        store.insert(&job).await.unwrap();

        let claimed = store.claim(t0(), 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].status, JobStatus::Processing);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].claimed_at, Some(t0()));

        // No more jobs
        assert!(store.claim(t0(), 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = record(0, t0());
        store.insert(&job).await.unwrap();
        assert!(matches!(
            store.insert(&job).await,
            Err(QueueError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn claim_respects_priority_then_schedule() {
        let store = InMemoryJobStore::new();
        let late_low = record(1, t0());
        let early_low = record(1, t0() - Duration::minutes(5));
        let high = record(9, t0());
        for j in [&late_low, &early_low, &high] {
            store.insert(j).await.unwrap();
        }

        let claimed = store.claim(t0(), 10).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, early_low.id, late_low.id]);
    }

    #[tokio::test]
    async fn fail_retries_then_exhausts() {
        let store = InMemoryJobStore::new();
        let job = JobRecord::new(
            "test",
            serde_json::json!({}),
            EnqueueOptions::default().with_max_attempts(2),
            t0(),
        );
        store.insert(&job).await.unwrap();
        let backoff = BackoffPolicy::fixed(std::time::Duration::from_secs(10));

        let first = store.claim(t0(), 1).await.unwrap().remove(0);
        let outcome = store
            .fail(first.claim_token(), "boom", &backoff, t0())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempts: 1,
                retry_at: t0() + Duration::seconds(10)
            }
        );

        // Not claimable until the backoff elapses.
        assert!(store.claim(t0(), 1).await.unwrap().is_empty());
        let later = t0() + Duration::seconds(10);
        let second = store.claim(later, 1).await.unwrap().remove(0);
        assert_eq!(second.attempts, 2);

        let outcome = store
            .fail(second.claim_token(), "boom again", &backoff, later)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 2 });

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom again"));

        // Reporting again is a no-op.
        let outcome = store
            .fail(second.claim_token(), "late", &backoff, later)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Stale);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job = record(0, t0());
        store.insert(&job).await.unwrap();
        let claim = store.claim(t0(), 1).await.unwrap().remove(0).claim_token();

        assert!(store.complete(claim, t0()).await.unwrap());
        assert!(
            store
                .complete(claim, t0() + Duration::hours(1))
                .await
                .unwrap()
        );

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        // Second completion did not refresh the retention clock.
        assert_eq!(stored.updated_at, t0());

        assert!(matches!(
            store.complete(unknown_claim(), t0()).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store
                .insert(&record(0, t0() + Duration::minutes(i)))
                .await
                .unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 5);
        assert_eq!(stats.oldest_pending_scheduled_for, Some(t0()));

        store.claim(t0() + Duration::hours(1), 2).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 2);
        assert_eq!(stats.oldest_pending_scheduled_for, Some(t0() + Duration::minutes(2)));
        assert_eq!(stats.total(), 5);
    }

    #[tokio::test]
    async fn reclaim_only_touches_expired_leases() {
        let store = InMemoryJobStore::new();
        let old = record(0, t0());
        let fresh = record(0, t0());
        store.insert(&old).await.unwrap();
        store.claim(t0(), 1).await.unwrap();
        store.insert(&fresh).await.unwrap();
        store.claim(t0() + Duration::minutes(30), 1).await.unwrap();

        let now = t0() + Duration::minutes(40);
        let reclaimed = store
            .reclaim_expired(now - Duration::minutes(15), now)
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let old = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, JobStatus::Pending);
        assert_eq!(old.error.as_deref(), Some("lease expired"));
        let fresh = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn reports_from_a_reclaimed_claim_change_nothing() {
        let store = InMemoryJobStore::new();
        let job = record(0, t0());
        store.insert(&job).await.unwrap();
        let backoff = BackoffPolicy::none();

        let first = store.claim(t0(), 1).await.unwrap().remove(0);
        let later = t0() + Duration::minutes(16);
        store
            .reclaim_expired(later - Duration::minutes(15), later)
            .await
            .unwrap();
        let second = store.claim(later, 1).await.unwrap().remove(0);
        assert_eq!(second.attempts, 2);

        // The first holder reports late; the second claim stays intact.
        assert_eq!(
            store
                .fail(first.claim_token(), "slow", &backoff, later)
                .await
                .unwrap(),
            FailOutcome::Stale
        );
        assert!(!store.complete(first.claim_token(), later).await.unwrap());
        assert!(
            !store
                .fail_permanently(first.claim_token(), "slow", later)
                .await
                .unwrap()
        );

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, 2);
        assert!(store.claim(later, 1).await.unwrap().is_empty());

        assert!(store.complete(second.claim_token(), later).await.unwrap());
    }

    #[tokio::test]
    async fn reset_failed_never_lowers_the_ceiling() {
        let store = InMemoryJobStore::new();
        let job = JobRecord::new(
            "test",
            serde_json::json!({}),
            EnqueueOptions::default().with_max_attempts(5),
            t0(),
        );
        store.insert(&job).await.unwrap();
        let claim = store.claim(t0(), 1).await.unwrap().remove(0).claim_token();
        store.fail_permanently(claim, "bad", t0()).await.unwrap();

        assert_eq!(store.reset_failed(3, t0()).await.unwrap(), 1);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.max_attempts, 5);
    }
}
