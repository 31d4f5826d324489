use std::sync::Arc;

use anyhow::Context;

use billflow_api::app::{build_app, build_services};
use billflow_infra::{AppConfig, OverdueSweepScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    billflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(build_services(&config).await?);

    let sweep = match config.overdue_sweep_interval {
        Some(interval) => Some(OverdueSweepScheduler::new(services.billing.clone(), interval).spawn()),
        None => {
            tracing::info!("overdue sweep disabled");
            None
        }
    };

    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    if let Some(handle) = sweep {
        handle.shutdown().await;
    }

    Ok(())
}
