use anyhow::Context;

use clinsync_infra::config::SyncConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clinsync_observability::init();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    let services = clinsync_api::app::services::build_services(&config).await?;
    let app = clinsync_api::app::build_app(services.operations());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let stats = services.pool_stats();
    tracing::info!(
        processed = stats.processed,
        delivered = stats.delivered,
        retry_scheduled = stats.retry_scheduled,
        exhausted = stats.exhausted,
        "shutting down sync runtime"
    );
    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
