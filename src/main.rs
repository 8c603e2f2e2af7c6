use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use theia_warden::config::Settings;
use theia_warden::docker::docker_gateway::DockerCli;
use theia_warden::services::cleanup_service::CleanupService;
use theia_warden::store::InMemoryStore;
use theia_warden::utils::clock::SystemClock;

/// Standalone idle-sweeper daemon. The session services themselves are a
/// library surface consumed by the transport layer; this binary only keeps
/// abandoned IDE containers from piling up on the host.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = match Settings::from_file("Settings.toml") {
        Ok(settings) => settings,
        Err(err) => {
            warn!("falling back to default settings: {err}");
            Settings::default()
        }
    };

    let runtime = Arc::new(DockerCli::new());
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(SystemClock);
    let sweeper = Arc::new(CleanupService::new(runtime, store, clock, &settings));

    let shutdown = CancellationToken::new();
    let handle = sweeper.spawn(shutdown.clone());
    info!(
        interval_secs = settings.sweeper.interval_secs,
        "idle sweeper running"
    );

    tokio::signal::ctrl_c().await?;
    shutdown.cancel();
    handle.await?;
    Ok(())
}
