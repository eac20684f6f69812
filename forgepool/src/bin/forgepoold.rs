use std::path::Path;
use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use forgepool::api;
use forgepool::config::Config;
use forgepool::job::manager::JobManager;
use forgepool::rpc::NodeRpcClient;
use forgepool::stats::PoolStats;
use forgepool::stratum::{compat, Registry, StratumServer};
use forgepool::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FORGEPOOL_CONFIG").ok())
        .unwrap_or_else(|| "forgepool.toml".to_string());
    let config = Arc::new(Config::load(Path::new(&config_path))?);
    info!(path = %config_path, "Loaded configuration");

    let stats = Arc::new(PoolStats::new());
    let node = Arc::new(NodeRpcClient::new(&config)?);
    let manager = JobManager::new(config.clone(), node, stats.clone()).await?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    manager.start(&tracker, &running).await?;

    let registry = Arc::new(Registry::new(&config));
    let rescue: Arc<dyn compat::RescueStrategy> = Arc::from(compat::from_config(&config));
    let server = StratumServer::new(
        config.clone(),
        manager.clone(),
        stats.clone(),
        registry.clone(),
        rescue,
    );
    {
        let tracker_for_sessions = tracker.clone();
        let shutdown = running.clone();
        tracker.spawn(async move {
            if let Err(e) = server.run(tracker_for_sessions, shutdown).await {
                error!(error = %e, "Stratum server failed");
            }
        });
    }

    if config.api.enabled {
        let state = api::AppState {
            stats: stats.clone(),
            manager: manager.clone(),
            registry: registry.clone(),
        };
        let api_config = config.clone();
        let shutdown = running.clone();
        tracker.spawn(async move {
            if let Err(e) = api::serve(&api_config, state, shutdown).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
