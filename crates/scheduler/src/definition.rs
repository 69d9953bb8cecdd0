//! Recurring job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgejobs_core::ScheduleId;

use crate::cron::ScheduleExpression;

/// A job template that the scheduler enqueues on every occurrence of its
/// expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobDefinition {
    pub id: ScheduleId,
    /// Unique human-readable name
    pub name: String,
    pub job_type: String,
    pub expression: ScheduleExpression,
    /// Payload copied into every enqueued job
    pub config: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJobDefinition {
    /// Active definition whose first run is the next occurrence after `now`.
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        expression: ScheduleExpression,
        config: serde_json::Value,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Self {
        let next_run = expression.next_after(now);
        Self {
            id: ScheduleId::new(),
            name: name.into(),
            job_type: job_type.into(),
            expression,
            config,
            priority,
            max_attempts: 3,
            is_active: next_run.is_some(),
            last_run: None,
            next_run,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run.is_some_and(|next| next <= now)
    }

    /// Record a firing at `now` and move `next_run` to the following
    /// occurrence. Missed occurrences in between are skipped. A definition
    /// with no further occurrence is deactivated.
    pub fn record_run(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.next_run = self.expression.next_after(now);
        if self.next_run.is_none() {
            self.is_active = false;
        }
        self.updated_at = now;
    }
}
