//! Recurring job scheduler.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use forgejobs_core::ScheduleId;
use forgejobs_queue::{EnqueueOptions, QueueError, QueueManager};

use crate::cron::{CronError, ScheduleExpression};
use crate::defaults::ScheduleSpec;
use crate::definition::ScheduledJobDefinition;
use crate::repository::{RepositoryError, ScheduleRepository};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule expression: {0}")]
    Cron(#[from] CronError),

    #[error("schedule expression '{0}' never fires")]
    NeverFires(String),

    #[error("schedule not found: {0}")]
    NotFound(ScheduleId),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due definitions are checked
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerTickReport {
    /// Definitions that enqueued a job
    pub fired: usize,
    /// Definitions deactivated because they have no further occurrence
    pub deactivated: usize,
}

/// Turns active schedule definitions into queued jobs.
///
/// The scheduler is the only writer of `last_run` and `next_run`.
#[derive(Clone)]
pub struct RecurringScheduler {
    repository: Arc<dyn ScheduleRepository>,
    queue: QueueManager,
    config: SchedulerConfig,
}

impl std::fmt::Debug for RecurringScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringScheduler")
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RecurringScheduler {
    pub fn new(
        repository: Arc<dyn ScheduleRepository>,
        queue: QueueManager,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            queue,
            config,
        }
    }

    /// Register a recurring job; the first run is the next occurrence after now.
    pub async fn schedule_job(
        &self,
        name: &str,
        job_type: &str,
        expression: &str,
        config: serde_json::Value,
        priority: i32,
    ) -> Result<ScheduleId, SchedulerError> {
        let spec = ScheduleSpec::new(name, job_type, expression, config).with_priority(priority);
        self.schedule(&spec).await
    }

    /// Register a recurring job from a spec.
    pub async fn schedule(&self, spec: &ScheduleSpec) -> Result<ScheduleId, SchedulerError> {
        let expression = ScheduleExpression::parse(&spec.expression)?;
        let now = self.queue.clock().now();
        let definition = ScheduledJobDefinition::new(
            &spec.name,
            &spec.job_type,
            expression,
            spec.config.clone(),
            spec.priority,
            now,
        )
        .with_max_attempts(spec.max_attempts);

        let Some(next_run) = definition.next_run else {
            return Err(SchedulerError::NeverFires(spec.expression.clone()));
        };

        self.repository.put(&definition).await?;
        info!(
            schedule_id = %definition.id,
            name = %definition.name,
            job_type = %definition.job_type,
            expression = %definition.expression,
            next_run = %next_run,
            "recurring job scheduled"
        );
        Ok(definition.id)
    }

    /// Insert every schedule whose name is not registered yet.
    ///
    /// Existing definitions keep their state, so repeated seeding against a
    /// durable repository does not duplicate or reset anything.
    pub async fn seed(&self, specs: &[ScheduleSpec]) -> Result<usize, SchedulerError> {
        let mut inserted = 0;
        for spec in specs {
            if self.repository.find_by_name(&spec.name).await?.is_some() {
                debug!(name = %spec.name, "schedule already registered");
                continue;
            }
            match self.schedule(spec).await {
                Ok(_) => inserted += 1,
                // Another process registered it between the lookup and the insert.
                Err(SchedulerError::Repository(RepositoryError::DuplicateName(_))) => {
                    debug!(name = %spec.name, "schedule registered concurrently");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(inserted)
    }

    /// Remove a definition. Returns `false` if it was already gone.
    pub async fn unschedule_job(&self, id: ScheduleId) -> Result<bool, SchedulerError> {
        let removed = self.repository.delete(id).await?;
        if removed {
            info!(schedule_id = %id, "recurring job unscheduled");
        }
        Ok(removed)
    }

    /// Pause or resume a definition. Resuming recomputes `next_run` from now.
    pub async fn set_active(&self, id: ScheduleId, active: bool) -> Result<(), SchedulerError> {
        let mut definition = self
            .repository
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;
        let now = self.queue.clock().now();

        if active {
            definition.next_run = definition.expression.next_after(now);
            if definition.next_run.is_none() {
                return Err(SchedulerError::NeverFires(definition.expression.to_string()));
            }
        }
        definition.is_active = active;
        definition.updated_at = now;
        self.repository.put(&definition).await?;

        info!(schedule_id = %id, name = %definition.name, active, "schedule activation changed");
        Ok(())
    }

    /// All definitions, sorted by name.
    pub async fn get_scheduled_jobs(&self) -> Result<Vec<ScheduledJobDefinition>, SchedulerError> {
        let mut definitions = self.repository.list().await?;
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }

    /// Enqueue one job for every due definition and advance its schedule.
    ///
    /// An overdue definition fires once, however many occurrences it missed.
    /// Each occurrence is claimed in the repository before its job is
    /// enqueued, so schedulers sharing a repository fire it at most once and
    /// a definition removed or paused mid-tick is left as it is. A storage
    /// error abandons the rest of the tick; unclaimed definitions are still
    /// due on the next one.
    pub async fn tick(&self) -> Result<SchedulerTickReport, SchedulerError> {
        let now = self.queue.clock().now();
        let mut due: Vec<ScheduledJobDefinition> = self
            .repository
            .list()
            .await?
            .into_iter()
            .filter(|d| d.is_due(now))
            .collect();
        due.sort_by_key(|d| d.next_run);

        let mut report = SchedulerTickReport::default();
        for mut definition in due {
            let Some(expected_next_run) = definition.next_run else {
                continue;
            };
            definition.record_run(now);
            let claimed = self
                .repository
                .advance(definition.id, expected_next_run, now, definition.next_run)
                .await?;
            if !claimed {
                debug!(
                    schedule_id = %definition.id,
                    name = %definition.name,
                    "occurrence already fired or schedule changed"
                );
                continue;
            }

            let options = EnqueueOptions::default()
                .with_priority(definition.priority)
                .with_max_attempts(definition.max_attempts);
            let job_id = self
                .queue
                .enqueue(&definition.job_type, definition.config.clone(), options)
                .await?;
            report.fired += 1;

            match definition.next_run {
                Some(next_run) => info!(
                    schedule_id = %definition.id,
                    name = %definition.name,
                    job_id = %job_id,
                    next_run = %next_run,
                    "recurring job fired"
                ),
                None => {
                    report.deactivated += 1;
                    warn!(
                        schedule_id = %definition.id,
                        name = %definition.name,
                        job_id = %job_id,
                        "recurring job fired for the last time and was deactivated"
                    );
                }
            }
        }

        Ok(report)
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    /// Tick until shutdown. The first tick fires immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(self.config.tick_interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            "scheduler started"
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
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "scheduler tick failed");
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}

/// Handle to stop a running scheduler.
///
/// Dropping the handle also stops the scheduler after its current tick.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "scheduler task ended abnormally");
            }
        }
    }
}
