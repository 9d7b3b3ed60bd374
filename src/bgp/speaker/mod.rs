//! Embedded BGP speaker backing the [`BgpEngine`] capability.
//!
//! One task per peer drives an outbound session; paths submitted while a
//! session is down are kept and flushed when it establishes. The speaker
//! never listens on TCP/179, so it can coexist with a host BGP daemon.

mod codec;
mod hold_timer;
mod session;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use self::session::Session;
use super::engine::{BgpEngine, PathSpec, PeerSpec, PeerStatus};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Connect,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    #[error("connection with {0} closed")]
    Closed(IpAddr),
    #[error("open asn mismatch (received={received}, expected={expected})")]
    OpenAsnMismatch { received: u32, expected: u32 },
    #[error("unexpected {message} in state {state}")]
    FiniteStateMachine {
        message: String,
        state: SessionState,
    },
    #[error("hold time expired after {0} seconds")]
    HoldTimeExpired(u16),
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("administratively shut down")]
    Shutdown,
}

#[derive(Clone, Debug)]
pub(crate) enum SessionCommand {
    Announce(PathSpec),
    Withdraw(PathSpec),
    Shutdown,
}

#[derive(Clone, Debug)]
pub(crate) struct SessionStatus {
    pub state: SessionState,
    pub established_at: Option<DateTime<Utc>>,
    pub announced: usize,
}

struct PeerHandle {
    spec: PeerSpec,
    tx: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

/// The in-process BGP speaker
#[derive(Default)]
pub struct Speaker {
    peers: Mutex<HashMap<IpAddr, PeerHandle>>,
}

impl Speaker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn stop_peer(&self, peer: IpAddr) {
        let handle = match self.peers.lock().await.remove(&peer) {
            Some(handle) => handle,
            None => return,
        };
        let _ = handle.tx.send(SessionCommand::Shutdown);
        let _ = handle.task.await;
        info!("BGP session with {} shut down", peer);
    }
}

#[async_trait]
impl BgpEngine for Speaker {
    async fn add_peer(&self, spec: PeerSpec) -> Result<(), Error> {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&spec.addr) {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus {
            state: SessionState::Idle,
            established_at: None,
            announced: 0,
        });
        let session = Session::new(spec.clone(), rx, status_tx);
        let task = tokio::spawn(session.run());
        info!(
            "Added BGP peer {} (remote AS {}, local AS {})",
            spec.addr, spec.remote_as, spec.local_as
        );
        peers.insert(
            spec.addr,
            PeerHandle {
                spec,
                tx,
                status,
                task,
            },
        );
        Ok(())
    }

    async fn announce(&self, peer: IpAddr, path: PathSpec) -> Result<(), Error> {
        let peers = self.peers.lock().await;
        let handle = peers
            .get(&peer)
            .ok_or_else(|| Error::Bgp(format!("no session configured for peer {}", peer)))?;
        handle
            .tx
            .send(SessionCommand::Announce(path))
            .map_err(|_| Error::Bgp(format!("session with {} is gone", peer)))
    }

    async fn withdraw(&self, peer: IpAddr, path: PathSpec) -> Result<(), Error> {
        let peers = self.peers.lock().await;
        let handle = peers
            .get(&peer)
            .ok_or_else(|| Error::Bgp(format!("no session configured for peer {}", peer)))?;
        handle
            .tx
            .send(SessionCommand::Withdraw(path))
            .map_err(|_| Error::Bgp(format!("session with {} is gone", peer)))
    }

    async fn peer_status(&self) -> Vec<PeerStatus> {
        self.peers
            .lock()
            .await
            .values()
            .map(|handle| {
                let status = handle.status.borrow();
                PeerStatus {
                    peer: handle.spec.addr,
                    remote_as: handle.spec.remote_as,
                    state: status.state.to_string(),
                    established_at: status.established_at,
                    prefixes_announced: status.announced,
                }
            })
            .collect()
    }

    async fn shutdown_peer(&self, peer: IpAddr) -> Result<(), Error> {
        self.stop_peer(peer).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Error> {
        let addrs: Vec<IpAddr> = self.peers.lock().await.keys().copied().collect();
        for addr in addrs {
            self.stop_peer(addr).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::engine::RouteOrigin;

    fn spec(addr: &str) -> PeerSpec {
        PeerSpec {
            addr: addr.parse().unwrap(),
            remote_as: 65001,
            local_as: 65000,
            router_id: "1.1.1.1".parse().unwrap(),
            hold_timer: 90,
            dest_port: 1179,
            multihop: true,
        }
    }

    fn path() -> PathSpec {
        PathSpec {
            prefix: "10.0.0.1/32".parse().unwrap(),
            next_hop: "10.1.1.100".parse().unwrap(),
            origin: RouteOrigin::Igp,
            communities: vec![],
        }
    }

    #[tokio::test]
    async fn test_add_peer_idempotent() {
        let speaker = Speaker::new();
        speaker.add_peer(spec("127.0.0.1")).await.unwrap();
        speaker.add_peer(spec("127.0.0.1")).await.unwrap();
        assert_eq!(speaker.peer_status().await.len(), 1);
        speaker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_paths_queue_while_idle() {
        let speaker = Speaker::new();
        // 127.0.0.1:1179 has no listener; the session stays down
        speaker.add_peer(spec("127.0.0.1")).await.unwrap();
        speaker
            .announce("127.0.0.1".parse().unwrap(), path())
            .await
            .unwrap();
        // The queued path is reflected in status once the session task
        // has picked the command up
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let status = speaker.peer_status().await;
            if status[0].prefixes_announced == 1 {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("path never recorded: {:?}", status);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        speaker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_announce_unknown_peer() {
        let speaker = Speaker::new();
        assert!(speaker
            .announce("192.0.2.1".parse().unwrap(), path())
            .await
            .is_err());
        // Shutdown twice: second is a no-op
        speaker.shutdown().await.unwrap();
        speaker.shutdown().await.unwrap();
    }
}
