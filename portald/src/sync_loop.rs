use std::time::Duration;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::types::{EndpointRecord, ServiceRecord};
use crate::commit::ConfigSink;
use crate::config::SyncConfig;
use crate::reconciler::Reconciler;
use crate::rules::RuleTable;

/// Converge rules and push config after a reconciler input changed.
fn converge<T: RuleTable, C: ConfigSink>(reconciler: &mut Reconciler<T>, sink: &mut C) {
    if let Err(e) = reconciler.ensure_rules() {
        tracing::warn!("Rules not fully converged: {:#}", e);
    }
    let state = reconciler.reconcile();
    if let Err(e) = sink.commit(&state) {
        tracing::error!("Error committing haproxy config: {:#}", e);
    }
}

/// Sync loop - the only writer of reconciler state.
///
/// Applies one snapshot at a time and commits after each, so commits never
/// overlap. Returns when cancelled or once both inputs have closed.
pub async fn run<T: RuleTable, C: ConfigSink>(
    mut reconciler: Reconciler<T>,
    mut sink: C,
    mut services_rx: mpsc::Receiver<Vec<ServiceRecord>>,
    mut endpoints_rx: mpsc::Receiver<Vec<EndpointRecord>>,
    config: SyncConfig,
    cancel: CancellationToken,
) -> Result<Reconciler<T>> {
    let resync_enabled = config.resync_interval_secs > 0;
    let mut resync = tokio::time::interval(Duration::from_secs(config.resync_interval_secs.max(1)));
    // The first tick completes immediately; there is nothing to resync yet
    resync.tick().await;

    let mut services_open = true;
    let mut endpoints_open = true;

    while services_open || endpoints_open {
        tokio::select! {
            update = services_rx.recv(), if services_open => {
                match update {
                    Some(services) => {
                        reconciler.apply_service_snapshot(services);
                        converge(&mut reconciler, &mut sink);
                    }
                    None => {
                        tracing::warn!("Service snapshot channel closed");
                        services_open = false;
                    }
                }
            }
            update = endpoints_rx.recv(), if endpoints_open => {
                match update {
                    Some(endpoints) => {
                        reconciler.apply_endpoint_snapshot(endpoints);
                        converge(&mut reconciler, &mut sink);
                    }
                    None => {
                        tracing::warn!("Endpoint snapshot channel closed");
                        endpoints_open = false;
                    }
                }
            }
            _ = resync.tick(), if resync_enabled => {
                tracing::debug!("Periodic resync");
                converge(&mut reconciler, &mut sink);
            }
            _ = cancel.cancelled() => {
                tracing::info!("Sync loop shutting down");
                break;
            }
        }
    }

    Ok(reconciler)
}
