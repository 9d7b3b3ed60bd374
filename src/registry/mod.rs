//! The app registry: single source of truth for which VIPs this host
//! announces. Each registered app gets its own control task evaluating
//! its monitors; the registry coordinates loopback/NAT/BGP side effects
//! and the deferred cleanup of apps that stay down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::app::{App, Source};
use crate::bgp::{BgpController, PeerStatus, Route};
use crate::catalogue::CatalogueClient;
use crate::config::AgentConfig;
use crate::error::Error;
use crate::monitor;
use crate::system::{NatOp, SystemOps};

/// Flags mutated by an app's control task, read by the registry when
/// tearing the app down
#[derive(Debug, Default)]
struct AppFlags {
    announced: AtomicBool,
    loopback_installed: AtomicBool,
    nats_installed: AtomicBool,
    loop_running: AtomicBool,
}

struct AppState {
    app: Arc<App>,
    flags: Arc<AppFlags>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Point-in-time view of a registered app, for the admin surface
#[derive(Clone, Debug, Serialize)]
pub struct AppSnapshot {
    pub name: String,
    pub vip: String,
    pub source: Source,
    pub announced: bool,
}

pub struct AppRegistry {
    weak: Weak<AppRegistry>,
    apps: Mutex<HashMap<String, AppState>>,
    cleanups: Mutex<HashMap<String, watch::Sender<bool>>>,
    bgp: Arc<BgpController>,
    system: Arc<dyn SystemOps>,
    catalogue: Option<Arc<CatalogueClient>>,
    monitor_interval: Duration,
    cleanup_timer: Duration,
    fail_threshold: u32,
}

impl AppRegistry {
    pub fn new(
        bgp: Arc<BgpController>,
        system: Arc<dyn SystemOps>,
        catalogue: Option<Arc<CatalogueClient>>,
        config: &AgentConfig,
    ) -> Arc<AppRegistry> {
        Arc::new_cyclic(|weak| AppRegistry {
            weak: weak.clone(),
            apps: Mutex::new(HashMap::new()),
            cleanups: Mutex::new(HashMap::new()),
            bgp,
            system,
            catalogue,
            monitor_interval: config.monitor_interval,
            cleanup_timer: config.cleanup_timer,
            fail_threshold: config.fail_threshold.max(1),
        })
    }

    /// Idempotent upsert. Re-adding an unchanged app is a no-op (or
    /// restarts its loop if that has stopped); a same-name app with a
    /// different definition replaces the old one; a VIP owned by a
    /// different app is rejected.
    pub async fn add(&self, app: App) -> Result<(), Error> {
        let mut apps = self.apps.lock().await;
        if let Some(existing) = apps.get_mut(&app.name) {
            if *existing.app == app {
                if existing.flags.loop_running.load(Ordering::SeqCst) {
                    debug!("App {} already exists", app.name);
                    return Ok(());
                }
                let (stop, task) = self.start_loop(existing.app.clone(), existing.flags.clone());
                existing.stop = stop;
                existing.task = Some(task);
                info!("Restarted run-loop for app {}", app.name);
                return Ok(());
            }
        }
        if let Some(owner) = apps
            .values()
            .find(|s| s.app.name != app.name && s.app.vip == app.vip)
        {
            error!(
                "Vip {} is already being announced by app {}",
                app.vip, owner.app.name
            );
            return Err(Error::VipInUse {
                vip: app.vip.to_string(),
                owner: owner.app.name.clone(),
            });
        }
        if let Some(old) = apps.remove(&app.name) {
            info!("Replacing app {}", app.name);
            self.teardown(old).await;
        }
        info!("Registered a new app: {}", app);
        let app = Arc::new(app);
        let flags = Arc::new(AppFlags::default());
        let (stop, task) = self.start_loop(app.clone(), flags.clone());
        apps.insert(
            app.name.clone(),
            AppState {
                app,
                flags,
                stop,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Stop an app's loop and tear down everything it installed. Removing
    /// an unknown app is a no-op.
    pub async fn remove(&self, name: &str) {
        let mut apps = self.apps.lock().await;
        if let Some(state) = apps.remove(name) {
            self.teardown(state).await;
        }
    }

    pub async fn list(&self) -> Vec<AppSnapshot> {
        self.apps
            .lock()
            .await
            .values()
            .map(|state| AppSnapshot {
                name: state.app.name.clone(),
                vip: state.app.vip.to_string(),
                source: state.app.source,
                announced: state.flags.announced.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub async fn peer_info(&self) -> Vec<PeerStatus> {
        self.bgp.peer_info().await
    }

    /// Withdraw and tear down every app, then stop BGP. Best-effort:
    /// individual failures are logged and the remaining steps still run.
    pub async fn shutdown(&self) {
        info!("Shutting down all apps and bgp sessions");
        let states: Vec<AppState> = {
            let mut apps = self.apps.lock().await;
            apps.drain().map(|(_, state)| state).collect()
        };
        for state in states {
            self.teardown(state).await;
        }
        if let Err(err) = self.bgp.shutdown().await {
            error!("Failed to shut down BGP: {}", err);
        }
    }

    fn start_loop(
        &self,
        app: Arc<App>,
        flags: Arc<AppFlags>,
    ) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            self.weak.clone(),
            app,
            flags,
            stop_rx,
            self.monitor_interval,
        ));
        (stop_tx, task)
    }

    /// One monitor pass plus the side effects of any up/down transition
    async fn check_condition(
        &self,
        app: &Arc<App>,
        flags: &AppFlags,
        fail_counts: &mut [u32],
    ) -> Result<(), Error> {
        if self.monitors_pass(app, fail_counts).await {
            if !flags.loopback_installed.load(Ordering::SeqCst) {
                self.system.add_loopback(&app.name, app.vip).await?;
                flags.loopback_installed.store(true, Ordering::SeqCst);
            }
            if !flags.nats_installed.load(Ordering::SeqCst) {
                self.install_nats(app).await?;
                flags.nats_installed.store(true, Ordering::SeqCst);
            }
            if !flags.announced.load(Ordering::SeqCst) {
                self.bgp.announce(&Route::from(app.as_ref())).await?;
                flags.announced.store(true, Ordering::SeqCst);
                if let (Some(catalogue), Some(vip_service)) = (&self.catalogue, &app.vip_service) {
                    if let Err(err) = catalogue.register_vip_service(vip_service).await {
                        error!("Failed to register vip service for {}: {}", app.name, err);
                    }
                }
                self.cancel_cleanup(&app.name).await;
            }
        } else if flags.announced.load(Ordering::SeqCst) {
            if let (Some(catalogue), Some(vip_service)) = (&self.catalogue, &app.vip_service) {
                if let Err(err) = catalogue.deregister_vip_service(vip_service).await {
                    error!("Failed to deregister vip service for {}: {}", app.name, err);
                }
            }
            self.bgp.withdraw(&Route::from(app.as_ref())).await?;
            flags.announced.store(false, Ordering::SeqCst);
            if flags.loopback_installed.load(Ordering::SeqCst) {
                if let Err(err) = self.system.delete_loopback(app.vip).await {
                    error!("Failed to remove loopback for {}: {}", app.name, err);
                }
                flags.loopback_installed.store(false, Ordering::SeqCst);
            }
            self.schedule_cleanup(&app.name).await;
        }
        Ok(())
    }

    /// All-must-pass policy: the app is up only when every monitor
    /// reports healthy. An empty monitor set is implicitly down. A
    /// monitor only reports down after `fail_threshold` consecutive
    /// failures (1 by default).
    async fn monitors_pass(&self, app: &App, fail_counts: &mut [u32]) -> bool {
        if app.monitors.is_empty() {
            return false;
        }
        let mut all_pass = true;
        for (mon, fails) in app.monitors.iter().zip(fail_counts.iter_mut()) {
            if monitor::evaluate(app, mon, self.catalogue.as_ref()).await {
                *fails = 0;
            } else {
                *fails += 1;
                debug!(
                    "{} monitor for app {} failed ({}/{})",
                    mon, app.name, fails, self.fail_threshold
                );
                if *fails >= self.fail_threshold {
                    all_pass = false;
                }
            }
        }
        if all_pass {
            debug!("All monitors for app {} succeeded", app.name);
        }
        all_pass
    }

    async fn install_nats(&self, app: &App) -> Result<(), Error> {
        if app.nats.is_empty() {
            return Ok(());
        }
        let local = self.bgp.local_ip(app.family()).ok_or_else(|| {
            Error::System(format!("no local address for family {}", app.family()))
        })?;
        for nat in &app.nats {
            self.system
                .nat_rule(NatOp::Add, app.vip.ip(), local, nat)
                .await?;
        }
        Ok(())
    }

    async fn remove_nats(&self, app: &App) {
        let local = match self.bgp.local_ip(app.family()) {
            Some(local) => local,
            None => {
                error!("No local address for family {}", app.family());
                return;
            }
        };
        for nat in &app.nats {
            if let Err(err) = self
                .system
                .nat_rule(NatOp::Delete, app.vip.ip(), local, nat)
                .await
            {
                error!("Failed to remove nat rule for {}: {}", app.name, err);
            }
        }
    }

    // Detached timer that evicts the app unless cancelled first
    async fn schedule_cleanup(&self, name: &str) {
        let (tx, mut rx) = watch::channel(false);
        if let Some(old) = self.cleanups.lock().await.insert(name.to_string(), tx) {
            let _ = old.send(true);
        }
        let registry = self.weak.clone();
        let name = name.to_string();
        let timer = self.cleanup_timer;
        debug!("Started cleanup timer for app {}", name);
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(timer) => {
                    if let Some(registry) = registry.upgrade() {
                        info!("Cleaning up app {}", name);
                        registry.remove(&name).await;
                    }
                }
                _ = rx.changed() => (),
            }
        });
    }

    async fn cancel_cleanup(&self, name: &str) {
        if let Some(tx) = self.cleanups.lock().await.remove(name) {
            let _ = tx.send(true);
            debug!("Cancelled cleanup timer for app {}", name);
        }
    }

    /// Full teardown of one app: stop its loop, withdraw, remove
    /// loopback and NAT rules. Errors are logged and the remaining
    /// steps still run.
    async fn teardown(&self, mut state: AppState) {
        let _ = state.stop.send(true);
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
        let app = &state.app;
        if state.flags.announced.load(Ordering::SeqCst) {
            if let (Some(catalogue), Some(vip_service)) = (&self.catalogue, &app.vip_service) {
                if let Err(err) = catalogue.deregister_vip_service(vip_service).await {
                    error!("Failed to deregister vip service for {}: {}", app.name, err);
                }
            }
            if let Err(err) = self.bgp.withdraw(&Route::from(app.as_ref())).await {
                error!("Failed to withdraw route for {}: {}", app.name, err);
            }
        }
        if state.flags.loopback_installed.load(Ordering::SeqCst) {
            if let Err(err) = self.system.delete_loopback(app.vip).await {
                error!("Failed to remove loopback for {}: {}", app.name, err);
            }
        }
        if state.flags.nats_installed.load(Ordering::SeqCst) {
            self.remove_nats(app).await;
        }
        if let Some(tx) = self.cleanups.lock().await.remove(&app.name) {
            let _ = tx.send(true);
        }
    }
}

/// Per-app control task: evaluate monitors immediately, then every
/// interval, until the stop signal fires. Stopping does not tear
/// anything down; the remove path owns teardown.
async fn run_loop(
    registry: Weak<AppRegistry>,
    app: Arc<App>,
    flags: Arc<AppFlags>,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
) {
    flags.loop_running.store(true, Ordering::SeqCst);
    let mut fail_counts = vec![0u32; app.monitors.len()];
    let mut ticker = time::interval(interval);
    // A tick never overlaps its successor; slow checks delay the next
    // tick instead of bursting
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let registry = match registry.upgrade() {
                    Some(registry) => registry,
                    None => break,
                };
                if let Err(err) = registry
                    .check_condition(&app, &flags, &mut fail_counts)
                    .await
                {
                    error!("{}: {}", app.name, err);
                }
            }
            _ = stop.changed() => {
                debug!("Exit run-loop for app: {}", app.name);
                break;
            }
        }
    }
    flags.loop_running.store(false, Ordering::SeqCst);
}
