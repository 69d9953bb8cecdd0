//! Background worker loop: claim, dispatch, report.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use forgejobs_queue::{FailOutcome, JobRecord, MAX_CLAIM_BATCH, QueueError, QueueManager};

use crate::handler::{HandlerError, HandlerRegistry, JobHandler};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Time between claim attempts
    pub poll_interval: Duration,
    /// Jobs claimed per tick (1..=10)
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            poll_interval: Duration::from_secs(30),
            batch_size: 1,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_CLAIM_BATCH);
        self
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Back to pending until `retry_at`
    Retrying { retry_at: DateTime<Utc> },
    /// Terminally failed (attempts exhausted, permanent error or unknown type)
    Failed,
    /// The job's lease was reclaimed before the outcome was reported; nothing
    /// was recorded
    Stale,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Jobs whose outcome could not be written back
    pub report_errors: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    fn record(&mut self, outcome: &Result<JobOutcome, QueueError>) {
        match outcome {
            Ok(JobOutcome::Completed) => self.completed += 1,
            Ok(JobOutcome::Retrying { .. }) => self.retried += 1,
            Ok(JobOutcome::Failed) => self.failed += 1,
            Ok(JobOutcome::Stale) => {}
            Err(_) => self.report_errors += 1,
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub storage_errors: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// Polls the queue and runs claimed jobs through registered handlers.
///
/// Cheap to clone; clones share the queue, the registry and the statistics.
#[derive(Debug, Clone)]
pub struct WorkerLoop {
    queue: QueueManager,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerLoop {
    pub fn new(queue: QueueManager, handlers: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            handlers: Arc::new(handlers),
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Claim up to `batch_size` due jobs and process them.
    ///
    /// Handlers of one batch run concurrently. Each job gets exactly one
    /// report call. A claim error abandons the tick.
    pub async fn tick(&self) -> Result<TickReport, QueueError> {
        let name = &self.config.name;
        let jobs = match self.queue.claim_batch(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(err) => {
                self.update_stats(|s| s.storage_errors += 1);
                return Err(err);
            }
        };

        let mut report = TickReport {
            claimed: jobs.len(),
            ..TickReport::default()
        };

        if jobs.is_empty() {
            debug!(worker = %name, "no jobs due");
        } else if jobs.len() == 1 {
            for job in jobs {
                let outcome = self.process(job).await;
                self.note_outcome(&mut report, &outcome);
            }
        } else {
            let mut set = JoinSet::new();
            for job in jobs {
                let worker = self.clone();
                set.spawn(async move { worker.process(job).await });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => self.note_outcome(&mut report, &outcome),
                    Err(err) => {
                        error!(worker = %name, error = %err, "job task did not finish");
                        report.report_errors += 1;
                    }
                }
            }
        }

        let now = self.queue.clock().now();
        self.update_stats(|s| {
            s.ticks += 1;
            s.jobs_processed += report.claimed as u64;
            s.jobs_completed += report.completed as u64;
            s.jobs_retried += report.retried as u64;
            s.jobs_failed += report.failed as u64;
            s.storage_errors += report.report_errors as u64;
            s.last_tick_at = Some(now);
        });

        if !report.is_idle() {
            info!(
                worker = %name,
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                "worker tick finished"
            );
        }
        Ok(report)
    }

    /// Run one claimed job and record its outcome.
    pub async fn process(&self, job: JobRecord) -> Result<JobOutcome, QueueError> {
        let name = &self.config.name;

        let claim = job.claim_token();

        let Some(handler) = self.handlers.get(&job.job_type) else {
            warn!(worker = %name, job_id = %job.id, job_type = %job.job_type, "no handler registered");
            let failed = self
                .queue
                .fail_permanently(
                    claim,
                    format!("no handler registered for job type '{}'", job.job_type),
                )
                .await?;
            return Ok(if failed {
                JobOutcome::Failed
            } else {
                JobOutcome::Stale
            });
        };

        debug!(
            worker = %name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "running job"
        );
        let started = Instant::now();
        let result = run_handler(handler, job.payload.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                if !self.queue.complete(claim).await? {
                    return Ok(JobOutcome::Stale);
                }
                info!(worker = %name, job_id = %job.id, job_type = %job.job_type, elapsed_ms, "job completed");
                Ok(JobOutcome::Completed)
            }
            Err(HandlerError::Permanent(msg)) => {
                if !self.queue.fail_permanently(claim, &msg).await? {
                    return Ok(JobOutcome::Stale);
                }
                Ok(JobOutcome::Failed)
            }
            Err(HandlerError::Retryable(msg)) => {
                warn!(
                    worker = %name,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    error = %msg,
                    elapsed_ms,
                    "job attempt failed"
                );
                let outcome = match self.queue.fail_retryable(claim, &msg).await? {
                    FailOutcome::Retrying { retry_at, .. } => JobOutcome::Retrying { retry_at },
                    FailOutcome::Exhausted { .. } => JobOutcome::Failed,
                    FailOutcome::Stale => JobOutcome::Stale,
                };
                Ok(outcome)
            }
        }
    }

    /// Spawn the loop on the current tokio runtime.
    ///
    /// The first tick fires immediately, draining whatever is already due.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = self.config.name.clone();
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown_rx));

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Tick until shutdown is signalled or the sender is dropped.
    ///
    /// A tick in progress always runs to completion.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.config.name.clone();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            worker = %name,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            handlers = ?self.handlers.job_types(),
            "worker started"
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
                        error!(worker = %name, error = %err, "worker tick failed");
                    }
                }
            }
        }

        info!(worker = %name, "worker stopped");
    }

    /// The job stays processing until its lease expires when its outcome
    /// cannot be written back.
    fn note_outcome(&self, report: &mut TickReport, outcome: &Result<JobOutcome, QueueError>) {
        if let Err(err) = outcome {
            error!(worker = %self.config.name, error = %err, "failed to record job outcome");
        }
        report.record(outcome);
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut lock_stats(&self.stats));
    }
}

/// Handle to control a running worker loop.
///
/// Dropping the handle also stops the loop after its current tick.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Request graceful shutdown and wait for the in-flight tick to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(worker = %self.name, error = %err, "worker task ended abnormally");
            }
        }
    }
}

/// Run the handler in its own task so a panic fails the job instead of the worker.
async fn run_handler(
    handler: Arc<dyn JobHandler>,
    payload: serde_json::Value,
) -> Result<(), HandlerError> {
    let task = tokio::spawn(async move { handler.handle(&payload).await });
    match task.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            let panic = err.into_panic();
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(HandlerError::Retryable(format!("handler panicked: {msg}")))
        }
        Err(err) => Err(HandlerError::Retryable(format!("handler task cancelled: {err}"))),
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    // Counters stay meaningful after a poisoning panic.
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
