use anyhow::Context;

use batchflow_api::app::{self, services};
use batchflow_infra::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    batchflow_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    let scheduler = services::scheduler(&config.orchestrator)?;
    let wired = services::build_services(&config).await?;

    // Finish what a previous process left in flight before taking new work.
    let report = wired
        .services
        .orchestrator
        .recover()
        .await
        .context("startup recovery failed")?;
    tracing::info!(
        resumed = report.resumed.len(),
        redriven = report.redriven.len(),
        "startup recovery complete"
    );

    let (services, background) = services::Background::spawn(wired, Some(scheduler));
    let app = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    background.shutdown().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
