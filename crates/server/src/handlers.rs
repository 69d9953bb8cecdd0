//! Handlers for the catalogued job types.
//!
//! The real side effects (mail delivery, backups, scraping) live in the
//! surrounding system. This process acknowledges each job after validating
//! the fields its payload must carry.

use async_trait::async_trait;
use tracing::info;

use forgejobs_core::job_types;
use forgejobs_worker::{HandlerError, HandlerRegistry, JobHandler};

/// Logs the job and checks that the payload names every required field.
#[derive(Debug, Clone)]
pub struct AcknowledgeHandler {
    job_type: &'static str,
    required_fields: &'static [&'static str],
}

impl AcknowledgeHandler {
    pub fn new(job_type: &'static str) -> Self {
        Self {
            job_type,
            required_fields: required_fields(job_type),
        }
    }
}

fn required_fields(job_type: &str) -> &'static [&'static str] {
    match job_type {
        job_types::SEND_EMAIL => &["to"],
        job_types::GENERATE_REPORT => &["report"],
        job_types::IMMEDIATE_SCRAPING => &["url"],
        _ => &[],
    }
}

#[async_trait]
impl JobHandler for AcknowledgeHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError> {
        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .copied()
            .filter(|field| payload.get(field).is_none_or(|v| v.is_null()))
            .collect();
        if !missing.is_empty() {
            // Resubmitting the same payload cannot succeed.
            return Err(HandlerError::permanent(format!(
                "{} payload is missing {}",
                self.job_type,
                missing.join(", ")
            )));
        }

        info!(job_type = self.job_type, payload = %payload, "job acknowledged");
        Ok(())
    }
}

/// Register an [`AcknowledgeHandler`] for every catalogued job type not yet
/// claimed by another handler.
pub fn register_catalogue(registry: &mut HandlerRegistry) {
    for &job_type in job_types::ALL {
        if !registry.contains(job_type) {
            registry.register(job_type, AcknowledgeHandler::new(job_type));
        }
    }
}
