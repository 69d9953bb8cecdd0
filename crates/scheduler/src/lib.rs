//! Time-based recurrence on top of the job queue.
//!
//! A [`RecurringScheduler`] periodically scans a [`ScheduleRepository`] and
//! enqueues one job per due [`ScheduledJobDefinition`]. Expressions use a
//! restricted cron dialect ([`ScheduleExpression`]).

pub mod cron;
pub mod defaults;
pub mod definition;
pub mod postgres;
pub mod repository;
pub mod scheduler;
pub mod schema;

pub use cron::{CronError, ScheduleExpression};
pub use defaults::{ScheduleSpec, default_schedules};
pub use definition::ScheduledJobDefinition;
pub use postgres::PostgresScheduleRepository;
pub use repository::{InMemoryScheduleRepository, RepositoryError, ScheduleRepository};
pub use scheduler::{
    RecurringScheduler, SchedulerConfig, SchedulerError, SchedulerHandle, SchedulerTickReport,
};
