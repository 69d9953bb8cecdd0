//! Durable job queue: job records, storage backends and the queue manager.
//!
//! ## Design
//!
//! - The store is the single source of truth for job status and scheduling
//! - Claiming is one conditional update (pending → processing), never read-then-write
//! - Retries are bounded by `max_attempts` and delayed by a [`BackoffPolicy`]
//! - Terminal failures stay in the store for operator inspection and retry
//! - Processing records carry a lease (`claimed_at`) so orphans can be reclaimed
//!
//! ## Components
//!
//! - [`JobRecord`]: the unit of deferred work
//! - [`JobStore`]: persistence boundary ([`InMemoryJobStore`], [`PostgresJobStore`])
//! - [`QueueManager`]: the only component that mutates job records

pub mod error;
pub mod in_memory;
pub mod manager;
pub mod postgres;
pub mod schema;
pub mod store;
pub mod types;

pub use error::QueueError;
pub use forgejobs_core::JobId;
pub use in_memory::InMemoryJobStore;
pub use manager::{MAX_CLAIM_BATCH, QueueManager};
pub use postgres::PostgresJobStore;
pub use store::{FailOutcome, JobStore};
pub use types::{
    BackoffPolicy, BackoffStrategy, ClaimToken, EnqueueOptions, JobFilter, JobRecord, JobStatus,
    QueueStats,
};
