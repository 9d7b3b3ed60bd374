use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::error::Error;

/// BGP ORIGIN attribute values
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteOrigin {
    Igp,
    Egp,
    Unknown,
}

impl FromStr for RouteOrigin {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "igp" => Ok(RouteOrigin::Igp),
            "egp" => Ok(RouteOrigin::Egp),
            "unknown" => Ok(RouteOrigin::Unknown),
            other => Err(Error::config(format!(
                "unsupported origin '{}', must be igp, egp or unknown",
                other
            ))),
        }
    }
}

impl fmt::Display for RouteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            RouteOrigin::Igp => "igp",
            RouteOrigin::Egp => "egp",
            RouteOrigin::Unknown => "unknown",
        };
        write!(f, "{}", word)
    }
}

/// Everything the engine needs to run one outbound session
#[derive(Clone, Debug)]
pub struct PeerSpec {
    pub addr: IpAddr,
    pub remote_as: u32,
    pub local_as: u32,
    pub router_id: Ipv4Addr,
    pub hold_timer: u16,
    pub dest_port: u16,
    /// eBGP multihop; sessions set TTL 255 when enabled
    pub multihop: bool,
}

/// One path to offer or retract on a peer session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSpec {
    pub prefix: IpNetwork,
    pub next_hop: IpAddr,
    pub origin: RouteOrigin,
    pub communities: Vec<u32>,
}

/// Session state snapshot for the admin surface
#[derive(Clone, Debug, Serialize)]
pub struct PeerStatus {
    pub peer: IpAddr,
    pub remote_as: u32,
    pub state: String,
    pub established_at: Option<DateTime<Utc>>,
    pub prefixes_announced: usize,
}

/// Narrow capability over an embedded BGP speaker. The agent core only
/// depends on this interface; the wire protocol lives behind it.
///
/// Path submission is accepted synchronously; session establishment is
/// asynchronous and never awaited here.
#[async_trait]
pub trait BgpEngine: Send + Sync {
    /// Start a session with a peer. Adding an already-known peer is a no-op.
    async fn add_peer(&self, spec: PeerSpec) -> Result<(), Error>;

    /// Offer a path on a peer's session
    async fn announce(&self, peer: IpAddr, path: PathSpec) -> Result<(), Error>;

    /// Retract a path from a peer's session
    async fn withdraw(&self, peer: IpAddr, path: PathSpec) -> Result<(), Error>;

    async fn peer_status(&self) -> Vec<PeerStatus>;

    /// Stop the session with a peer and forget it
    async fn shutdown_peer(&self, peer: IpAddr) -> Result<(), Error>;

    /// Stop all sessions. Idempotent.
    async fn shutdown(&self) -> Result<(), Error>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records engine calls for assertions; no sessions involved.
    #[derive(Default)]
    pub(crate) struct RecordingEngine {
        pub peers: Mutex<Vec<PeerSpec>>,
        pub paths: Mutex<HashMap<(IpAddr, IpNetwork), PathSpec>>,
        pub stopped: AtomicBool,
    }

    impl RecordingEngine {
        pub(crate) fn path_count(&self) -> usize {
            self.paths.lock().unwrap().len()
        }

        pub(crate) fn path_for(&self, peer: IpAddr, prefix: IpNetwork) -> Option<PathSpec> {
            self.paths.lock().unwrap().get(&(peer, prefix)).cloned()
        }
    }

    #[async_trait]
    impl BgpEngine for RecordingEngine {
        async fn add_peer(&self, spec: PeerSpec) -> Result<(), Error> {
            let mut peers = self.peers.lock().unwrap();
            if !peers.iter().any(|p| p.addr == spec.addr) {
                peers.push(spec);
            }
            Ok(())
        }

        async fn announce(&self, peer: IpAddr, path: PathSpec) -> Result<(), Error> {
            self.paths
                .lock()
                .unwrap()
                .insert((peer, path.prefix), path);
            Ok(())
        }

        async fn withdraw(&self, peer: IpAddr, path: PathSpec) -> Result<(), Error> {
            self.paths.lock().unwrap().remove(&(peer, path.prefix));
            Ok(())
        }

        async fn peer_status(&self) -> Vec<PeerStatus> {
            let paths = self.paths.lock().unwrap();
            self.peers
                .lock()
                .unwrap()
                .iter()
                .map(|p| PeerStatus {
                    peer: p.addr,
                    remote_as: p.remote_as,
                    state: "Established".to_string(),
                    established_at: None,
                    prefixes_announced: paths.keys().filter(|(peer, _)| *peer == p.addr).count(),
                })
                .collect()
        }

        async fn shutdown_peer(&self, peer: IpAddr) -> Result<(), Error> {
            self.peers.lock().unwrap().retain(|p| p.addr != peer);
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), Error> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
