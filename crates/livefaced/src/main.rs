use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod http;
mod store;

use config::Config;
use store::FaceStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        listen = %config.listen_addr,
        db = %config.db_path.display(),
        match_threshold = config.match_threshold,
        descriptor_dim = config.descriptor_dim,
        "livefaced starting"
    );

    let store = FaceStore::open(&config.db_path, config.descriptor_dim)
        .await
        .with_context(|| format!("opening face store at {}", config.db_path.display()))?;
    let enrolled = store.count_all().await.context("counting enrolled faces")?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}; is another instance running?", config.listen_addr))?;

    let app = http::router(http::AppState::new(config, store));
    tracing::info!(enrolled, "livefaced ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("livefaced shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("livefaced shutting down");
}
