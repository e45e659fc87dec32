use heatmap_app::{config::{Backend, Config}, router, run_compaction, AggregateStore, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env()?;

    match &config.backend {
        Backend::File(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            info!("heatmap aggregates stored in {}", path.display());
        }
        Backend::Memory => info!("heatmap aggregates kept in memory only"),
    }
    let store = Arc::new(AggregateStore::open(config.backend.clone(), config.viewer_window).await?);
    info!("loaded {} heatmap slugs", store.slugs().await.len());

    let compactor = tokio::spawn(run_compaction(Arc::clone(&store), config.compact_interval));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(config, Arc::clone(&store)));

    info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    compactor.abort();
    if let Err(err) = store.compact().await {
        error!("final heatmap compaction failed: {err}");
    }

    Ok(())
}
