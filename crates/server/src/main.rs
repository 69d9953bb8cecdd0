use forgejobs_server::{ServerConfig, build_services, register_catalogue, start};
use forgejobs_worker::HandlerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgejobs_observability::init();

    let config = ServerConfig::from_env()?;
    let services = build_services(&config).await?;

    let mut handlers = HandlerRegistry::new();
    register_catalogue(&mut handlers);

    let runtime = start(&config, services, handlers).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c");

    runtime.shutdown().await;
    Ok(())
}
