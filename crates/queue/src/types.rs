//! Core job record types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgejobs_core::JobId;

use crate::error::QueueError;

/// Job record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for `scheduled_for` and a worker
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted or permanent failure; only an operator can requeue it
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::corrupt(format!("unknown job status '{other}'"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Failed jobs are eligible again immediately
    None,
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: base * attempt
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
}

/// Delay inserted before a failed job becomes claimable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_secs(30), Duration::from_secs(60 * 60))
    }
}

impl BackoffPolicy {
    /// Retry on the very next claim.
    pub fn none() -> Self {
        Self {
            strategy: BackoffStrategy::None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay,
            max_delay,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
        }
    }

    /// Calculate the delay after the given attempt failed (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }

    /// Instant at which a job that just failed `attempt` becomes claimable.
    pub fn retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.delay_for_attempt(attempt))
    }
}

/// Options for [`crate::QueueManager::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Higher values are claimed first
    pub priority: i32,
    /// Delay before the job becomes claimable
    pub delay: Duration,
    /// Claims allowed before a failure becomes terminal
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            max_attempts: 3,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// A queued unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Handler discriminator
    pub job_type: String,
    /// Opaque payload handed verbatim to the handler
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: JobStatus,
    /// Incremented on every claim
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest instant at which the job can be claimed
    pub scheduled_for: DateTime<Utc>,
    /// Start of the current processing lease
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last failure message
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build a fresh pending record.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority: options.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            scheduled_for: now + to_chrono(options.delay),
            claimed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and due.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// Whether another automatic attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Processing under `claim`, i.e. not reclaimed since.
    pub fn is_held_by(&self, claim: ClaimToken) -> bool {
        self.status == JobStatus::Processing && self.attempts == claim.attempt
    }

    /// Token of the claim that produced this record.
    pub fn claim_token(&self) -> ClaimToken {
        ClaimToken {
            id: self.id,
            attempt: self.attempts,
        }
    }
}

/// Identifies one claim of a record.
///
/// Every claim increments `attempts`, so `(id, attempt)` names exactly one
/// claim. Outcome reports carry the token; a report whose claim was reclaimed
/// and handed to another worker changes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken {
    pub id: JobId,
    pub attempt: u32,
}

impl From<&JobRecord> for ClaimToken {
    fn from(record: &JobRecord) -> Self {
        record.claim_token()
    }
}

/// Filter for operator listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self
                .job_type
                .as_deref()
                .is_none_or(|t| record.job_type == t)
    }
}

/// Queue depth snapshot for dashboards and health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub oldest_pending_scheduled_for: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Convert a std duration, saturating at a century instead of overflowing.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
