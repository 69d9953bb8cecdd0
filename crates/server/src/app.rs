//! Process wiring: stores, queue manager, worker loops, scheduler, maintenance.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use forgejobs_queue::{InMemoryJobStore, JobStore, PostgresJobStore, QueueManager};
use forgejobs_scheduler::{
    InMemoryScheduleRepository, PostgresScheduleRepository, RecurringScheduler,
    ScheduleRepository, SchedulerHandle, default_schedules,
};
use forgejobs_worker::{HandlerRegistry, MaintenanceHandle, MaintenanceTask, WorkerHandle, WorkerLoop};

use crate::config::ServerConfig;

/// The shared services every background task is built from.
#[derive(Debug, Clone)]
pub struct Services {
    pub queue: QueueManager,
    pub scheduler: RecurringScheduler,
}

/// Connect the stores named by `config` and build the queue and scheduler.
///
/// Without a `DATABASE_URL` both run on in-memory stores.
pub async fn build_services(config: &ServerConfig) -> anyhow::Result<Services> {
    let (store, repository): (Arc<dyn JobStore>, Arc<dyn ScheduleRepository>) =
        match &config.database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.db_max_connections)
                    .connect(url)
                    .await
                    .context("failed to connect to Postgres")?;

                forgejobs_queue::schema::ensure_schema(&pool)
                    .await
                    .context("failed to create job_records schema")?;
                forgejobs_scheduler::schema::ensure_schema(&pool)
                    .await
                    .context("failed to create scheduled_jobs schema")?;

                info!(max_connections = config.db_max_connections, "using Postgres stores");
                let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));
                let repository: Arc<dyn ScheduleRepository> =
                    Arc::new(PostgresScheduleRepository::new(pool));
                (store, repository)
            }
            None => {
                warn!("using in-memory stores");
                let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
                let repository: Arc<dyn ScheduleRepository> = InMemoryScheduleRepository::arc();
                (store, repository)
            }
        };

    let queue = QueueManager::new(store).with_backoff(config.backoff());
    let scheduler = RecurringScheduler::new(repository, queue.clone(), config.scheduler_config());
    Ok(Services { queue, scheduler })
}

/// Handles of everything [`start`] spawned.
#[derive(Debug)]
pub struct Runtime {
    workers: Vec<WorkerHandle>,
    scheduler: Option<SchedulerHandle>,
    maintenance: MaintenanceHandle,
}

impl Runtime {
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Stop every task and wait for in-flight work.
    ///
    /// The scheduler stops first so it cannot enqueue into a draining queue.
    pub async fn shutdown(self) {
        info!("shutting down");
        if let Some(scheduler) = self.scheduler {
            scheduler.shutdown().await;
        }
        for worker in self.workers {
            worker.shutdown().await;
        }
        self.maintenance.shutdown().await;
        info!("shutdown complete");
    }
}

/// Seed the default schedules and spawn workers, scheduler and maintenance.
pub async fn start(
    config: &ServerConfig,
    services: Services,
    handlers: HandlerRegistry,
) -> anyhow::Result<Runtime> {
    let scheduler = if config.scheduler_enabled {
        let created = services
            .scheduler
            .seed(&default_schedules())
            .await
            .context("failed to seed default schedules")?;
        info!(created, "default schedules seeded");
        Some(services.scheduler.clone().spawn())
    } else {
        info!("scheduler disabled");
        None
    };

    let workers = (0..config.worker_count)
        .map(|i| {
            WorkerLoop::new(services.queue.clone(), handlers.clone(), config.worker_config(i)).spawn()
        })
        .collect();

    let maintenance = MaintenanceTask::new(services.queue.clone(), config.maintenance_config()).spawn();

    info!(
        workers = config.worker_count,
        scheduler = config.scheduler_enabled,
        "job runtime started"
    );

    Ok(Runtime {
        workers,
        scheduler,
        maintenance,
    })
}
