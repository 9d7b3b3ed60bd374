use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::app::{App, Source};
use crate::catalogue::CatalogueClient;
use crate::registry::AppRegistry;

/// Handle the admin API uses to probe reconciler liveness
pub type PingHandle = mpsc::Sender<oneshot::Sender<()>>;

/// Periodically reconciles the registry against the service catalogue:
/// every discovered app is upserted, and discovery-sourced apps that
/// fell out of the snapshot are removed. Config/admin apps are never
/// touched.
pub struct DiscoveryReconciler {
    client: Arc<CatalogueClient>,
    registry: Arc<AppRegistry>,
    interval: Duration,
    ping: mpsc::Receiver<oneshot::Sender<()>>,
}

impl DiscoveryReconciler {
    pub fn new(
        client: Arc<CatalogueClient>,
        registry: Arc<AppRegistry>,
        interval: Duration,
    ) -> (Self, PingHandle) {
        let (ping_tx, ping_rx) = mpsc::channel(1);
        (
            DiscoveryReconciler {
                client,
                registry,
                interval,
                ping: ping_rx,
            },
            ping_tx,
        )
    }

    /// Run forever. The first catalogue query happens immediately, not
    /// after the first interval.
    pub async fn run(mut self) {
        info!(
            "Starting discovery reconciler (every {:?})",
            self.interval
        );
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.client.query_services().await {
                        Ok(apps) => reconcile_snapshot(&self.registry, apps).await,
                        Err(err) => error!("Failed to query catalogue: {}", err),
                    }
                }
                probe = self.ping.recv() => {
                    match probe {
                        Some(reply) => {
                            let _ = reply.send(());
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Apply one discovery snapshot to the registry
pub(crate) async fn reconcile_snapshot(registry: &Arc<AppRegistry>, apps: Vec<App>) {
    let seen: HashSet<String> = apps.iter().map(|a| a.name.clone()).collect();
    for app in apps {
        let name = app.name.clone();
        if let Err(err) = registry.add(app).await {
            error!("Failed to add discovered app {}: {}", name, err);
        }
    }
    let stale: Vec<String> = registry
        .list()
        .await
        .into_iter()
        .filter(|snapshot| snapshot.source == Source::Discovery && !seen.contains(&snapshot.name))
        .map(|snapshot| snapshot.name)
        .collect();
    for name in stale {
        info!("Removing app {}: not found in catalogue", name);
        registry.remove(&name).await;
    }
}
