mod api;
mod config;
mod error;
mod main_lib;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use main_lib::{build_state, start_background};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dairysync=info")),
        )
        .init();

    let config = Config::from_env()?;
    let state = build_state(&config)?;
    let tasks = start_background(&state, &config).await;

    let app = api::app_router(state.clone());
    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(
        "dairysync listening on {} (center '{}')",
        listener.local_addr()?,
        config.center_id
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.scheduler.stop().await;
    for task in tasks {
        task.abort();
    }
    info!("dairysync stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
}
