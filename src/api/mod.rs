//! Admin HTTP surface: register/unregister apps, inspect BGP peer
//! state, and probe reconciler liveness.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::timeout;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::app::{App, Source};
use crate::discovery::PingHandle;
use crate::error::Error;
use crate::registry::AppRegistry;

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const ALIVE: &str = "I-AM-ALIVE";

type Params = Vec<(String, String)>;

fn reply(status: StatusCode, body: String) -> warp::reply::WithStatus<String> {
    warp::reply::with_status(body, status)
}

/// Upsert an app from query parameters; `monitor` and `nat` repeat
async fn register(
    params: Params,
    registry: Arc<AppRegistry>,
) -> Result<impl Reply, warp::Rejection> {
    let mut name = None;
    let mut vip = None;
    let mut monitors: Vec<String> = Vec::new();
    let mut nats: Vec<String> = Vec::new();
    let mut communities: Vec<String> = Vec::new();
    for (key, value) in params {
        match key.as_str() {
            "name" => name = Some(value),
            "vip" => vip = Some(value),
            "monitor" => monitors.push(value),
            "nat" => nats.push(value),
            "vip_communities" => {
                communities = value.split(',').map(str::to_string).collect();
            }
            _ => (),
        }
    }
    let (name, vip) = match (name, vip) {
        (Some(name), Some(vip)) => (name, vip),
        _ => {
            return Ok(reply(
                StatusCode::BAD_REQUEST,
                "Invalid request, need app name and vip\n".to_string(),
            ))
        }
    };
    debug!("REGISTER: {} vip={}", name, vip);
    let app = match App::new(
        &name,
        &vip,
        &communities,
        &monitors,
        &nats,
        None,
        Source::Admin,
    ) {
        Ok(app) => app,
        Err(err) => {
            return Ok(reply(
                StatusCode::BAD_REQUEST,
                format!("Invalid request: {}\n", err),
            ))
        }
    };
    match registry.add(app).await {
        Ok(()) => Ok(reply(StatusCode::OK, "ok\n".to_string())),
        Err(err @ Error::VipInUse { .. }) => {
            Ok(reply(StatusCode::CONFLICT, format!("{}\n", err)))
        }
        Err(err) => Ok(reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n", err),
        )),
    }
}

async fn unregister(
    params: Params,
    registry: Arc<AppRegistry>,
) -> Result<impl Reply, warp::Rejection> {
    let name = params.into_iter().find(|(key, _)| key == "name");
    match name {
        Some((_, name)) => {
            debug!("UNREGISTER: {}", name);
            registry.remove(&name).await;
            Ok(reply(StatusCode::OK, "ok\n".to_string()))
        }
        None => Ok(reply(
            StatusCode::BAD_REQUEST,
            "Invalid request, need app name specified\n".to_string(),
        )),
    }
}

/// BGP peer state plus the registered app snapshot
async fn info(registry: Arc<AppRegistry>) -> Result<impl Reply, warp::Rejection> {
    let peers = registry.peer_info().await;
    let apps = registry.list().await;
    Ok(warp::reply::json(&json!({ "peers": peers, "apps": apps })))
}

/// Liveness: probes the reconciler and fails after 2s. Agents without
/// discovery have no reconciler to probe and answer directly.
async fn ping(ping: Option<PingHandle>) -> Result<impl Reply, warp::Rejection> {
    let handle = match ping {
        Some(handle) => handle,
        None => return Ok(reply(StatusCode::OK, ALIVE.to_string())),
    };
    let (tx, rx) = oneshot::channel();
    let alive = handle.send(tx).await.is_ok()
        && matches!(timeout(PING_TIMEOUT, rx).await, Ok(Ok(())));
    if alive {
        Ok(reply(StatusCode::OK, ALIVE.to_string()))
    } else {
        Ok(reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "reconciler not responding\n".to_string(),
        ))
    }
}

/// Defined admin routes. Register/unregister accept GET and POST with
/// the same query contract.
pub fn routes(
    registry: Arc<AppRegistry>,
    ping_handle: Option<PingHandle>,
) -> warp::filters::BoxedFilter<(impl Reply,)> {
    let state = warp::any().map(move || registry.clone());
    let probe = warp::any().map(move || ping_handle.clone());

    let register = warp::path!("register")
        .and(warp::get().or(warp::post()).unify())
        .and(warp::query::<Params>())
        .and(state.clone())
        .and_then(register);

    let unregister = warp::path!("unregister")
        .and(warp::get().or(warp::post()).unify())
        .and(warp::query::<Params>())
        .and(state.clone())
        .and_then(unregister);

    let info = warp::path!("info")
        .and(warp::get())
        .and(state)
        .and_then(info);

    let ping = warp::path!("ping")
        .and(warp::get())
        .and(probe)
        .and_then(ping);

    register.or(unregister).or(info).or(ping).boxed()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bgp::engine::testing::RecordingEngine;
    use crate::bgp::BgpController;
    use crate::config::{AgentConfig, BgpPeerConfig};
    use crate::system::testing::MemOps;

    async fn test_registry() -> Arc<AppRegistry> {
        let engine = Arc::new(RecordingEngine::default());
        let system = Arc::new(MemOps::default());
        let configs = [BgpPeerConfig {
            local_as: 65000,
            peer_as: 65001,
            peer_ip: Some("10.1.1.1".parse().unwrap()),
            local_ip: None,
            communities: vec![],
            origin: "igp".to_string(),
            addr_family: None,
        }];
        let bgp = Arc::new(
            BgpController::new(&configs, system.as_ref(), engine)
                .await
                .unwrap(),
        );
        let agent = AgentConfig {
            monitor_interval: Duration::from_millis(50),
            ..Default::default()
        };
        AppRegistry::new(bgp, system, None, &agent)
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = test_registry().await;
        let api = routes(registry.clone(), None);

        let resp = warp::test::request()
            .path("/register?name=web&vip=10.0.0.1/32&monitor=exec:true&nat=tcp:80")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(registry.list().await.len(), 1);

        let resp = warp::test::request()
            .method("POST")
            .path("/unregister?name=web")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(registry.list().await.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_bad_spec() {
        let registry = test_registry().await;
        let api = routes(registry.clone(), None);

        // Missing vip
        let resp = warp::test::request()
            .path("/register?name=web")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Malformed monitor
        let resp = warp::test::request()
            .path("/register?name=web&vip=10.0.0.1/32&monitor=port:tcp:99999")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(registry.list().await.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_vip_collision() {
        let registry = test_registry().await;
        let api = routes(registry.clone(), None);

        let resp = warp::test::request()
            .path("/register?name=a&vip=10.0.0.1/32&monitor=exec:true")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = warp::test::request()
            .path("/register?name=b&vip=10.0.0.1/32&monitor=exec:true")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_info() {
        let registry = test_registry().await;
        let api = routes(registry.clone(), None);
        let resp = warp::test::request().path("/info").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert!(body.get("peers").is_some());
        assert!(body.get("apps").is_some());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_without_discovery() {
        let registry = test_registry().await;
        let api = routes(registry.clone(), None);
        let resp = warp::test::request().path("/ping").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), ALIVE);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_with_live_reconciler() {
        let registry = test_registry().await;
        let (ping_tx, mut ping_rx) = tokio::sync::mpsc::channel::<oneshot::Sender<()>>(1);
        // Stand-in reconciler that answers probes
        tokio::spawn(async move {
            while let Some(reply) = ping_rx.recv().await {
                let _ = reply.send(());
            }
        });
        let api = routes(registry.clone(), Some(ping_tx));
        let resp = warp::test::request().path("/ping").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), ALIVE);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_with_dead_reconciler() {
        let registry = test_registry().await;
        let (ping_tx, ping_rx) = tokio::sync::mpsc::channel::<oneshot::Sender<()>>(1);
        // Receiver dropped: probes can never be answered
        drop(ping_rx);
        let api = routes(registry.clone(), Some(ping_tx));
        let resp = warp::test::request().path("/ping").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        registry.shutdown().await;
    }
}
