use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tracker_common::TrackerConfig;
use tracker_core::Tracker;

mod handlers;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub tracker: Arc<Tracker>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = TrackerConfig::from_env().context("loading tracker config")?;
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;

    let tracker = Arc::new(Tracker::in_memory(config));
    let loaded = tracker.refresh_providers().context("initial provider refresh")?;
    info!("{} eligible providers at startup", loaded);

    let shutdown = Arc::new(Notify::new());
    let jobs = tracker.spawn_jobs(shutdown.clone());

    let app = handlers::router(Arc::new(AppState {
        tracker: tracker.clone(),
    }));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("tracker listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await
        .context("http server")?;

    shutdown.notify_waiters();
    for job in jobs {
        // a job mid-tick misses notify_waiters
        job.abort();
        let _ = job.await;
    }
    Ok(())
}
