mod commit;
mod config;
mod membership;
mod ports;
mod reconciler;
mod rules;
mod sync_loop;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::types::{EndpointRecord, ServiceRecord};
use crate::commit::HaproxyCommitter;
use crate::config::Config;
use crate::membership::file::{run_watcher, FileSource};
use crate::ports::PortAllocator;
use crate::reconciler::Reconciler;
use crate::rules::iptables::IptablesRuntime;
use crate::rules::portal::{resolve_host_ip, PortalChains, PortalInstaller};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("portald=info"))
        )
        .init();

    tracing::info!("Starting portald");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/portald/portald.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Check the iptables version and set up the portal chains
    let runtime = IptablesRuntime::new(&config.rules.iptables_path, &config.rules.iptables_save_path)
        .context("Failed to initialise iptables runtime")?;

    let host_ip = resolve_host_ip(&config.rules)?;
    tracing::info!("Host portals redirect to {}", host_ip);

    let installer = PortalInstaller::new(
        runtime,
        PortalChains::from(&config.rules),
        config.rules.listen_ip,
        host_ip,
    );

    installer
        .start(config.rules.flush_on_start)
        .context("Failed to prepare portal chains")?;

    // Template parse errors surface here rather than on the first commit
    let committer = HaproxyCommitter::load(&config.haproxy)?;

    let ports = Arc::new(PortAllocator::new(config.ports.base, config.ports.count));
    tracing::info!(
        "Proxy ports {}..{} available",
        config.ports.base,
        u32::from(config.ports.base) + u32::from(config.ports.count)
    );
    let reconciler = Reconciler::new(ports, installer);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let poll_interval = Duration::from_secs(config.membership.poll_interval_secs);
    let (services_tx, services_rx) = mpsc::channel::<Vec<ServiceRecord>>(config.sync.channel_capacity);
    let (endpoints_tx, endpoints_rx) = mpsc::channel::<Vec<EndpointRecord>>(config.sync.channel_capacity);

    // Spawn membership watchers
    let services_source = FileSource::new("services", &config.membership.services_path);
    let services_cancel = cancel.clone();
    let services_handle = tokio::spawn(async move {
        if let Err(e) = run_watcher(services_source, poll_interval, services_tx, services_cancel).await {
            tracing::error!("Service watcher error: {}", e);
        }
    });

    let endpoints_source = FileSource::new("endpoints", &config.membership.endpoints_path);
    let endpoints_cancel = cancel.clone();
    let endpoints_handle = tokio::spawn(async move {
        if let Err(e) = run_watcher(endpoints_source, poll_interval, endpoints_tx, endpoints_cancel).await {
            tracing::error!("Endpoint watcher error: {}", e);
        }
    });

    // Spawn sync loop
    let sync_cancel = cancel.clone();
    let sync_config = config.sync.clone();
    let sync_handle = tokio::spawn(async move {
        match sync_loop::run(reconciler, committer, services_rx, endpoints_rx, sync_config, sync_cancel).await {
            Ok(reconciler) => {
                tracing::info!("Sync loop stopped holding {} proxy ports", reconciler.ports().len());
            }
            Err(e) => tracing::error!("Sync loop error: {}", e),
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation; installed rules stay in place for the next start
    cancel.cancel();

    let _ = tokio::join!(services_handle, endpoints_handle, sync_handle);

    tracing::info!("Shutdown complete");
    Ok(())
}
