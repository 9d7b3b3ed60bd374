mod community;
pub mod engine;
pub mod speaker;

pub use community::{format_community, parse_community};
pub use engine::{BgpEngine, PathSpec, PeerSpec, PeerStatus, RouteOrigin};
pub use speaker::Speaker;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ipnetwork::IpNetwork;
use log::{error, info};

use crate::app::{AddressFamily, App};
use crate::config::BgpPeerConfig;
use crate::error::Error;
use crate::system::SystemOps;

const DEFAULT_HOLD_TIMER: u16 = 90;
const BGP_PORT: u16 = 179;

/// A prefix to inject plus its route-specific communities
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub prefix: IpNetwork,
    pub communities: Vec<u32>,
}

impl Route {
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.prefix)
    }
}

impl From<&App> for Route {
    fn from(app: &App) -> Route {
        Route {
            prefix: app.vip,
            communities: app.communities.clone(),
        }
    }
}

/// A resolved peer: connection details plus the attribute template and
/// the set of prefixes currently announced to it.
struct Peer {
    spec: PeerSpec,
    family: AddressFamily,
    local_ip: IpAddr,
    origin: RouteOrigin,
    communities: Vec<u32>,
    added: AtomicBool,
    announced: Mutex<HashSet<IpNetwork>>,
}

impl Peer {
    fn path_for(&self, route: &Route) -> PathSpec {
        let mut communities = self.communities.clone();
        communities.extend(route.communities.iter().copied());
        PathSpec {
            prefix: route.prefix,
            next_hop: self.local_ip,
            origin: self.origin,
            communities,
        }
    }

    fn has_announced(&self, prefix: &IpNetwork) -> bool {
        self.announced.lock().unwrap().contains(prefix)
    }
}

/// Orchestrates the BGP engine: offers every route to each peer whose
/// address family matches, tracking what was announced where.
pub struct BgpController {
    peers: Vec<Peer>,
    engine: Arc<dyn BgpEngine>,
}

impl BgpController {
    pub async fn new(
        configs: &[BgpPeerConfig],
        system: &dyn SystemOps,
        engine: Arc<dyn BgpEngine>,
    ) -> Result<Self, Error> {
        if configs.is_empty() {
            return Err(Error::config("at least one bgp peer is required"));
        }
        let mut peers = Vec::with_capacity(configs.len());
        for cfg in configs {
            peers.push(Self::resolve_peer(cfg, system).await?);
        }
        Ok(BgpController { peers, engine })
    }

    async fn resolve_peer(cfg: &BgpPeerConfig, system: &dyn SystemOps) -> Result<Peer, Error> {
        let family = match (cfg.addr_family.as_deref(), cfg.peer_ip) {
            (Some("4"), _) => AddressFamily::V4,
            (Some("6"), _) => AddressFamily::V6,
            (Some(other), _) => {
                return Err(Error::config(format!(
                    "unsupported addr_family '{}', must be 4 or 6",
                    other
                )))
            }
            (None, Some(IpAddr::V4(_))) => AddressFamily::V4,
            (None, Some(IpAddr::V6(_))) => AddressFamily::V6,
            (None, None) => AddressFamily::V4,
        };
        let peer_ip = match cfg.peer_ip {
            Some(ip) => ip,
            None => system.gateway(family).await?,
        };
        let local_ip = match cfg.local_ip {
            Some(ip) => ip,
            None => {
                let gw = system.via(peer_ip).await?;
                system.local_address(gw).await?
            }
        };
        let origin: RouteOrigin = cfg.origin.parse()?;
        let communities = cfg
            .communities
            .iter()
            .map(|c| parse_community(c))
            .collect::<Result<Vec<u32>, Error>>()?;
        // The BGP identifier is a 32-bit value; fall back when the local
        // address is v6
        let router_id = match local_ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        };
        info!(
            "Configured BGP peer {} (AS {}) with local source {}",
            peer_ip, cfg.peer_as, local_ip
        );
        Ok(Peer {
            spec: PeerSpec {
                addr: peer_ip,
                remote_as: cfg.peer_as,
                local_as: cfg.local_as,
                router_id,
                hold_timer: DEFAULT_HOLD_TIMER,
                dest_port: BGP_PORT,
                // eBGP peers are multihop by default
                multihop: cfg.peer_as != cfg.local_as,
            },
            family,
            local_ip,
            origin,
            communities,
            added: AtomicBool::new(false),
            announced: Mutex::new(HashSet::new()),
        })
    }

    /// Offer a route to every matching-family peer. Peers are added to
    /// the engine lazily on first announce; session establishment is not
    /// awaited. Already-announced prefixes are skipped.
    pub async fn announce(&self, route: &Route) -> Result<(), Error> {
        let mut matched = false;
        for peer in self.peers.iter().filter(|p| p.family == route.family()) {
            matched = true;
            if !peer.added.load(Ordering::SeqCst) {
                self.engine.add_peer(peer.spec.clone()).await?;
                peer.added.store(true, Ordering::SeqCst);
            }
            if peer.has_announced(&route.prefix) {
                continue;
            }
            self.engine
                .announce(peer.spec.addr, peer.path_for(route))
                .await?;
            peer.announced.lock().unwrap().insert(route.prefix);
            info!("Announced {} to {}", route.prefix, peer.spec.addr);
        }
        if !matched {
            return Err(Error::Bgp(format!(
                "no configured peer matches the family of {}",
                route.prefix
            )));
        }
        Ok(())
    }

    /// Retract a route from every peer it was announced to. A withdraw
    /// for a route a peer never saw is a no-op.
    pub async fn withdraw(&self, route: &Route) -> Result<(), Error> {
        for peer in &self.peers {
            if !peer.announced.lock().unwrap().remove(&route.prefix) {
                continue;
            }
            match self
                .engine
                .withdraw(peer.spec.addr, peer.path_for(route))
                .await
            {
                Ok(()) => info!("Withdrew {} from {}", route.prefix, peer.spec.addr),
                Err(err) => {
                    // Keep it marked announced so the next tick retries
                    peer.announced.lock().unwrap().insert(route.prefix);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Local source address used for peers of the given family; NAT
    /// rules redirect VIP traffic to it
    pub fn local_ip(&self, family: AddressFamily) -> Option<IpAddr> {
        self.peers
            .iter()
            .find(|p| p.family == family)
            .map(|p| p.local_ip)
    }

    pub async fn peer_info(&self) -> Vec<PeerStatus> {
        self.engine.peer_status().await
    }

    /// Shut down every peer session, then the engine. Idempotent.
    pub async fn shutdown(&self) -> Result<(), Error> {
        for peer in &self.peers {
            if let Err(err) = self.engine.shutdown_peer(peer.spec.addr).await {
                error!("Failed to shut down peer {}: {}", peer.spec.addr, err);
            }
        }
        self.engine.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::engine::testing::RecordingEngine;
    use super::*;
    use crate::system::testing::MemOps;

    fn peer_config(peer_ip: Option<&str>, local_as: u32, peer_as: u32) -> BgpPeerConfig {
        BgpPeerConfig {
            local_as,
            peer_as,
            peer_ip: peer_ip.map(|ip| ip.parse().unwrap()),
            local_ip: None,
            communities: vec!["100:100".to_string()],
            origin: "igp".to_string(),
            addr_family: None,
        }
    }

    async fn controller(
        configs: &[BgpPeerConfig],
    ) -> (BgpController, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::default());
        let ctrl = BgpController::new(configs, &MemOps::default(), engine.clone())
            .await
            .unwrap();
        (ctrl, engine)
    }

    #[tokio::test]
    async fn test_peer_defaults_to_gateway() {
        let (ctrl, _) = controller(&[peer_config(None, 65000, 65001)]).await;
        assert_eq!(ctrl.peers[0].spec.addr.to_string(), "10.1.1.1");
        assert_eq!(ctrl.peers[0].local_ip.to_string(), "10.1.1.100");
        assert!(ctrl.peers[0].spec.multihop);
    }

    #[tokio::test]
    async fn test_ibgp_peer_is_not_multihop() {
        let (ctrl, _) = controller(&[peer_config(Some("10.1.1.1"), 65000, 65000)]).await;
        assert!(!ctrl.peers[0].spec.multihop);
    }

    #[tokio::test]
    async fn test_announce_and_withdraw() {
        let (ctrl, engine) = controller(&[peer_config(Some("10.1.1.1"), 65000, 65001)]).await;
        let route = Route {
            prefix: "10.0.0.1/32".parse().unwrap(),
            communities: vec![parse_community("200:200").unwrap()],
        };
        ctrl.announce(&route).await.unwrap();
        // Announce is idempotent per peer
        ctrl.announce(&route).await.unwrap();
        assert_eq!(engine.path_count(), 1);
        let path = engine
            .path_for("10.1.1.1".parse().unwrap(), route.prefix)
            .unwrap();
        assert_eq!(path.next_hop.to_string(), "10.1.1.100");
        assert_eq!(
            path.communities,
            vec![
                parse_community("100:100").unwrap(),
                parse_community("200:200").unwrap()
            ]
        );

        ctrl.withdraw(&route).await.unwrap();
        assert_eq!(engine.path_count(), 0);
        // Withdrawing a route that was never announced is a no-op
        ctrl.withdraw(&route).await.unwrap();
    }

    #[tokio::test]
    async fn test_family_matching() {
        let (ctrl, engine) = controller(&[
            peer_config(Some("10.1.1.1"), 65000, 65001),
            peer_config(Some("2001:db8::1"), 65000, 65001),
        ])
        .await;
        let v6_route = Route {
            prefix: "2001:db8::53/128".parse().unwrap(),
            communities: vec![],
        };
        ctrl.announce(&v6_route).await.unwrap();
        assert_eq!(engine.path_count(), 1);
        assert!(engine
            .path_for("2001:db8::1".parse().unwrap(), v6_route.prefix)
            .is_some());
        let path = engine
            .path_for("2001:db8::1".parse().unwrap(), v6_route.prefix)
            .unwrap();
        assert_eq!(path.next_hop.to_string(), "2001:db8::100");
    }

    #[tokio::test]
    async fn test_no_matching_family_is_an_error() {
        let (ctrl, _) = controller(&[peer_config(Some("10.1.1.1"), 65000, 65001)]).await;
        let v6_route = Route {
            prefix: "2001:db8::53/128".parse().unwrap(),
            communities: vec![],
        };
        assert!(ctrl.announce(&v6_route).await.is_err());
    }

    #[tokio::test]
    async fn test_no_peers_rejected() {
        let engine = Arc::new(RecordingEngine::default());
        assert!(
            BgpController::new(&[], &MemOps::default(), engine)
                .await
                .is_err()
        );
    }
}
