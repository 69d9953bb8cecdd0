//! Built-in recurring jobs seeded at startup.

use serde::{Deserialize, Serialize};
use serde_json::json;

use forgejobs_core::job_types;

/// Static description of a recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub name: String,
    pub job_type: String,
    pub expression: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl ScheduleSpec {
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        expression: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            expression: expression.into(),
            config,
            priority: 0,
            max_attempts: default_max_attempts(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Maintenance jobs every deployment runs.
pub fn default_schedules() -> Vec<ScheduleSpec> {
    vec![
        ScheduleSpec::new(
            "nightly-backup",
            job_types::PROCESS_BACKUP,
            "0 2 * * *",
            json!({ "kind": "full" }),
        )
        .with_priority(5)
        .with_max_attempts(5),
        ScheduleSpec::new(
            "weekly-file-cleanup",
            job_types::CLEANUP_FILES,
            "0 3 * * 0",
            json!({ "older_than_days": 30 }),
        ),
        ScheduleSpec::new(
            "daily-usage-report",
            job_types::GENERATE_REPORT,
            "0 6 * * *",
            json!({ "report": "daily_usage" }),
        ),
        ScheduleSpec::new(
            "daily-scraping",
            job_types::SCHEDULED_SCRAPING,
            "0 4 * * *",
            json!({}),
        )
        .with_priority(-1),
    ]
}
