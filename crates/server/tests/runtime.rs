use std::time::Duration;

use serde_json::json;

use forgejobs_core::job_types;
use forgejobs_queue::{EnqueueOptions, JobStatus, QueueManager};
use forgejobs_server::{ServerConfig, build_services, register_catalogue, start};
use forgejobs_worker::HandlerRegistry;

fn in_memory_config() -> ServerConfig {
    ServerConfig {
        database_url: None,
        worker_count: 2,
        worker_poll_interval: Duration::from_millis(10),
        scheduler_tick: Duration::from_millis(50),
        maintenance_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    }
}

async fn wait_for_status(queue: &QueueManager, id: forgejobs_queue::JobId, status: JobStatus) {
    for _ in 0..200 {
        let job = queue.get(id).await.unwrap().unwrap();
        if job.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {status:?}");
}

#[tokio::test]
async fn runtime_processes_jobs_and_seeds_schedules() {
    let config = in_memory_config();
    let services = build_services(&config).await.unwrap();
    let queue = services.queue.clone();
    let scheduler = services.scheduler.clone();

    let mut handlers = HandlerRegistry::new();
    register_catalogue(&mut handlers);
    let runtime = start(&config, services, handlers).await.unwrap();
    assert_eq!(runtime.workers().len(), 2);

    let ok = queue
        .enqueue(
            job_types::SEND_EMAIL,
            json!({"to": "ops@example.com"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    let bad = queue
        .enqueue(
            job_types::IMMEDIATE_SCRAPING,
            json!({}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    let unknown = queue
        .enqueue("resize_image", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    wait_for_status(&queue, ok, JobStatus::Completed).await;
    wait_for_status(&queue, bad, JobStatus::Failed).await;
    wait_for_status(&queue, unknown, JobStatus::Failed).await;

    let failed = queue.get(bad).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 1);
    assert!(failed.error.unwrap().contains("url"));

    let schedules = scheduler.get_scheduled_jobs().await.unwrap();
    assert_eq!(schedules.len(), 4);
    assert!(schedules.iter().all(|s| s.is_active && s.next_run.is_some()));

    runtime.shutdown().await;
}

#[tokio::test]
async fn scheduler_can_be_disabled() {
    let config = ServerConfig {
        scheduler_enabled: false,
        worker_count: 0,
        ..in_memory_config()
    };
    let services = build_services(&config).await.unwrap();
    let scheduler = services.scheduler.clone();

    let runtime = start(&config, services, HandlerRegistry::new())
        .await
        .unwrap();
    assert!(runtime.workers().is_empty());
    assert!(scheduler.get_scheduled_jobs().await.unwrap().is_empty());

    runtime.shutdown().await;
}
