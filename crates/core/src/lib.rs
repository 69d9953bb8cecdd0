//! `forgejobs-core`: shared building blocks for the job queue and scheduler.
//!
//! This crate contains **pure** primitives (no storage or runtime concerns):
//! identifiers, the clock abstraction and the job type catalogue.

pub mod clock;
pub mod error;
pub mod id;
pub mod job_types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use id::{JobId, ScheduleId};
