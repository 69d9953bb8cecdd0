//! Background execution of queued jobs.
//!
//! - [`WorkerLoop`]: polls the queue, runs handlers, reports outcomes
//! - [`HandlerRegistry`]: job type → [`JobHandler`]
//! - [`MaintenanceTask`]: lease sweep and retention cleanup
//!
//! Several worker loops, in one process or many, can share a queue: the store's
//! atomic claim guarantees each pending job goes to one of them.

pub mod handler;
pub mod maintenance;
pub mod worker;

pub use handler::{FnHandler, HandlerError, HandlerRegistry, JobHandler, handler_fn};
pub use maintenance::{MaintenanceConfig, MaintenanceHandle, MaintenanceReport, MaintenanceTask};
pub use worker::{JobOutcome, TickReport, WorkerConfig, WorkerHandle, WorkerLoop, WorkerStats};
