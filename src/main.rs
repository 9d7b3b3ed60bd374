use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use clap::Parser;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};
use tokio::signal::unix::{signal, SignalKind};

use vipcast::api;
use vipcast::app::{App, Source};
use vipcast::bgp::{BgpController, Speaker};
use vipcast::catalogue::CatalogueClient;
use vipcast::config::{self, Config};
use vipcast::discovery::DiscoveryReconciler;
use vipcast::error::Error;
use vipcast::registry::AppRegistry;
use vipcast::system::{ShellOps, SystemOps};

#[derive(Debug, Parser)]
#[clap(name = "vipcast", version, about = "Anycast VIP control agent")]
struct Args {
    /// Path to the YAML config file
    #[clap(short, long)]
    config: String,

    /// Sets the level of logging verbosity
    #[clap(short, parse(from_occurrences))]
    verbose: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let (vipcast_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("vipcast"), vipcast_level)
        .filter(None, other_level)
        .init();

    let config = match config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("FATAL: Unable to read config: {}", err);
            process::exit(1);
        }
    };
    debug!(
        "Found {} peers and {} apps in {}",
        config.bgp.len(),
        config.apps.len(),
        args.config
    );

    if let Err(err) = run(config).await {
        error!("FATAL: {}", err);
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let listen_addr: SocketAddr = config.agent.listen_addr.parse().map_err(|_| {
        Error::config(format!(
            "invalid listen_addr '{}'",
            config.agent.listen_addr
        ))
    })?;

    let system: Arc<dyn SystemOps> = Arc::new(ShellOps);
    let engine = Arc::new(Speaker::new());
    let bgp = Arc::new(BgpController::new(&config.bgp, system.as_ref(), engine).await?);
    let catalogue = if config.agent.consul_addr.is_empty() {
        None
    } else {
        Some(Arc::new(CatalogueClient::new(
            &config.agent.consul_addr,
            &config.agent.consul_token,
        )?))
    };
    let registry = AppRegistry::new(bgp, system, catalogue.clone(), &config.agent);

    for app_config in &config.apps {
        let app = App::new(
            &app_config.name,
            &app_config.vip,
            &app_config.vip_config.bgp_communities,
            &app_config.monitors,
            &app_config.nats,
            None,
            Source::Config,
        );
        match app {
            Ok(app) => {
                if let Err(err) = registry.add(app).await {
                    error!("Failed to add configured app {}: {}", app_config.name, err);
                }
            }
            Err(err) => error!("Failed to add configured app {}: {}", app_config.name, err),
        }
    }

    let ping = match catalogue {
        Some(client) => {
            let (reconciler, ping) = DiscoveryReconciler::new(
                client,
                registry.clone(),
                config.agent.consul_query_interval,
            );
            tokio::spawn(reconciler.run());
            Some(ping)
        }
        None => None,
    };

    let routes = api::routes(registry.clone(), ping);
    tokio::spawn(async move {
        info!("Starting http server on {}", listen_addr);
        warp::serve(routes).run(listen_addr).await;
    });

    wait_for_shutdown().await?;
    registry.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<(), Error> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => (),
    }
    info!("Shutdown signal received");
    Ok(())
}
