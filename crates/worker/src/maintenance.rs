//! Periodic queue housekeeping: lease sweep and completed-job retention.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use forgejobs_queue::{QueueError, QueueManager};

/// Housekeeping configuration.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often the sweep runs
    pub interval: Duration,
    /// Processing records older than this are considered orphaned
    pub lease: Duration,
    /// Completed records older than this are deleted; `None` keeps them forever
    pub retention: Option<Duration>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lease: Duration::from_secs(15 * 60),
            retention: Some(Duration::from_secs(30 * 24 * 60 * 60)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reclaimed: u64,
    pub deleted: u64,
}

/// Releases orphaned leases and prunes old completed jobs.
#[derive(Debug, Clone)]
pub struct MaintenanceTask {
    queue: QueueManager,
    config: MaintenanceConfig,
}

impl MaintenanceTask {
    pub fn new(queue: QueueManager, config: MaintenanceConfig) -> Self {
        Self { queue, config }
    }

    /// One sweep. The lease sweep runs first so a storage error there skips
    /// retention until the next run.
    pub async fn run_once(&self) -> Result<MaintenanceReport, QueueError> {
        let reclaimed = self.queue.reclaim_expired(self.config.lease).await?;
        let deleted = match self.config.retention {
            Some(retention) => self.queue.cleanup(retention).await?,
            None => 0,
        };

        let report = MaintenanceReport { reclaimed, deleted };
        debug!(reclaimed, deleted, "maintenance sweep finished");
        Ok(report)
    }

    pub fn spawn(self) -> MaintenanceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        MaintenanceHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            lease_secs = self.config.lease.as_secs(),
            retention_secs = self.config.retention.map(|r| r.as_secs()),
            "maintenance started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "maintenance sweep failed");
                    }
                }
            }
        }

        info!("maintenance stopped");
    }
}

/// Handle to stop a running maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "maintenance task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use forgejobs_core::ManualClock;
    use forgejobs_queue::{InMemoryJobStore, JobStatus};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn sweep_reclaims_and_prunes() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        ));
        let queue = QueueManager::with_clock(InMemoryJobStore::arc(), clock.clone());

        let done = queue.enqueue("a", json!({}), Default::default()).await.unwrap();
        let job = queue.claim_next().await.unwrap().unwrap();
        queue.complete(&job).await.unwrap();

        let orphan = queue.enqueue("b", json!({}), Default::default()).await.unwrap();
        clock.advance(chrono::Duration::days(31));
        queue.claim_next().await.unwrap().unwrap();
        clock.advance(chrono::Duration::hours(1));

        let task = MaintenanceTask::new(queue.clone(), MaintenanceConfig::default());
        let report = task.run_once().await.unwrap();
        assert_eq!(report, MaintenanceReport { reclaimed: 1, deleted: 1 });

        assert!(queue.get(done).await.unwrap().is_none());
        let orphan = queue.get(orphan).await.unwrap().unwrap();
        assert_eq!(orphan.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn retention_can_be_disabled() {
        let queue = QueueManager::new(InMemoryJobStore::arc());
        let task = MaintenanceTask::new(
            queue,
            MaintenanceConfig {
                retention: None,
                ..MaintenanceConfig::default()
            },
        );
        assert_eq!(task.run_once().await.unwrap(), MaintenanceReport::default());
    }
}
