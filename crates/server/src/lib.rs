//! Process host for the job queue: configuration, handler wiring and the
//! background task runtime.

pub mod app;
pub mod config;
pub mod handlers;

pub use app::{Runtime, Services, build_services, start};
pub use config::{ConfigError, ServerConfig};
pub use handlers::{AcknowledgeHandler, register_catalogue};
