//! Job type catalogue used by the surrounding system.
//!
//! Each name is a contract between the producer of a job and the handler
//! registered for it; the payload shape is owned by the handler, not the queue.

pub const SEND_EMAIL: &str = "send_email";
pub const PROCESS_BACKUP: &str = "process_backup";
pub const CLEANUP_FILES: &str = "cleanup_files";
pub const GENERATE_REPORT: &str = "generate_report";
pub const SCHEDULED_SCRAPING: &str = "scheduled_scraping";
pub const IMMEDIATE_SCRAPING: &str = "immediate_scraping";

/// Every catalogued job type.
pub const ALL: &[&str] = &[
    SEND_EMAIL,
    PROCESS_BACKUP,
    CLEANUP_FILES,
    GENERATE_REPORT,
    SCHEDULED_SCRAPING,
    IMMEDIATE_SCRAPING,
];
