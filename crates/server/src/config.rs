//! Process configuration from environment variables.

use std::time::Duration;

use thiserror::Error;

use forgejobs_queue::{BackoffPolicy, MAX_CLAIM_BATCH};
use forgejobs_scheduler::SchedulerConfig;
use forgejobs_worker::{MaintenanceConfig, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}' ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the server binary needs to wire the queue together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Postgres connection string; `None` runs on in-memory stores
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub worker_count: usize,
    pub worker_poll_interval: Duration,
    pub worker_batch_size: usize,
    pub scheduler_enabled: bool,
    pub scheduler_tick: Duration,
    pub lease_duration: Duration,
    pub maintenance_interval: Duration,
    /// `None` keeps completed jobs forever
    pub retention: Option<Duration>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 5,
            worker_count: 1,
            worker_poll_interval: Duration::from_secs(30),
            worker_batch_size: 1,
            scheduler_enabled: true,
            scheduler_tick: Duration::from_secs(60),
            lease_duration: Duration::from_secs(900),
            maintenance_interval: Duration::from_secs(300),
            retention: Some(days(30)),
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables take
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let database_url = get("DATABASE_URL");
        if database_url.is_none() {
            tracing::warn!("DATABASE_URL not set; using in-memory stores (jobs are lost on restart)");
        }

        let worker_batch_size =
            parse_number(&get, "WORKER_BATCH_SIZE", defaults.worker_batch_size as u64)? as usize;
        if !(1..=MAX_CLAIM_BATCH).contains(&worker_batch_size) {
            return Err(ConfigError::Invalid {
                name: "WORKER_BATCH_SIZE",
                value: worker_batch_size.to_string(),
                reason: format!("must be between 1 and {MAX_CLAIM_BATCH}"),
            });
        }

        let retention_days = parse_number(&get, "RETENTION_DAYS", 30)?;

        let config = Self {
            database_url,
            db_max_connections: parse_number(
                &get,
                "DB_MAX_CONNECTIONS",
                u64::from(defaults.db_max_connections),
            )?
            .clamp(1, u64::from(u32::MAX)) as u32,
            worker_count: parse_number(&get, "WORKER_COUNT", defaults.worker_count as u64)? as usize,
            worker_poll_interval: parse_secs(&get, "WORKER_POLL_INTERVAL_SECS", defaults.worker_poll_interval)?,
            worker_batch_size,
            scheduler_enabled: parse_bool(&get, "SCHEDULER_ENABLED", defaults.scheduler_enabled)?,
            scheduler_tick: parse_secs(&get, "SCHEDULER_TICK_SECS", defaults.scheduler_tick)?,
            lease_duration: parse_secs(&get, "LEASE_DURATION_SECS", defaults.lease_duration)?,
            maintenance_interval: parse_secs(
                &get,
                "MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval,
            )?,
            retention: (retention_days > 0).then(|| days(retention_days)),
            backoff_base: parse_secs(&get, "BACKOFF_BASE_SECS", defaults.backoff_base)?,
            backoff_max: parse_secs(&get, "BACKOFF_MAX_SECS", defaults.backoff_max)?,
        };

        if config.worker_count == 0 {
            tracing::info!("WORKER_COUNT=0; this process will not execute jobs");
        }
        Ok(config)
    }

    /// Configuration of the `index`-th worker loop in this process.
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(format!("worker-{index}"))
            .with_poll_interval(self.worker_poll_interval)
            .with_batch_size(self.worker_batch_size)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: self.scheduler_tick,
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: self.maintenance_interval,
            lease: self.lease_duration,
            retention: self.retention,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::linear(self.backoff_base, self.backoff_max.max(self.backoff_base))
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(24 * 60 * 60))
}

fn parse_number(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(value) => value.parse::<u64>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

/// Whole seconds; zero is rejected because every interval must elapse.
fn parse_secs(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs = parse_number(get, name, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(value) => Err(ConfigError::Invalid {
            name,
            value,
            reason: "expected true or false".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.worker_poll_interval, Duration::from_secs(30));
        assert_eq!(config.scheduler_tick, Duration::from_secs(60));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/jobs"),
            ("WORKER_COUNT", "3"),
            ("WORKER_BATCH_SIZE", "10"),
            ("WORKER_POLL_INTERVAL_SECS", "5"),
            ("SCHEDULER_ENABLED", "false"),
            ("RETENTION_DAYS", "0"),
            ("BACKOFF_BASE_SECS", "10"),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.worker_batch_size, 10);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.retention, None);

        let worker = config.worker_config(2);
        assert_eq!(worker.name, "worker-2");
        assert_eq!(worker.poll_interval, Duration::from_secs(5));
        assert_eq!(
            config.backoff().delay_for_attempt(2),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config_from(&[("DATABASE_URL", "  "), ("WORKER_COUNT", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.worker_count, 1);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            config_from(&[("WORKER_BATCH_SIZE", "11")]),
            Err(ConfigError::Invalid { name: "WORKER_BATCH_SIZE", .. })
        ));
        assert!(matches!(
            config_from(&[("WORKER_POLL_INTERVAL_SECS", "0")]),
            Err(ConfigError::Invalid { name: "WORKER_POLL_INTERVAL_SECS", .. })
        ));
        assert!(matches!(
            config_from(&[("SCHEDULER_ENABLED", "maybe")]),
            Err(ConfigError::Invalid { name: "SCHEDULER_ENABLED", .. })
        ));
        assert!(matches!(
            config_from(&[("LEASE_DURATION_SECS", "-5")]),
            Err(ConfigError::Invalid { name: "LEASE_DURATION_SECS", .. })
        ));
    }
}
