use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bgp_rs::{
    ASPath, MPReachNLRI, MPUnreachNLRI, Message, NLRIEncoding, Notification, Open, OpenCapability,
    OpenParameter, Origin, PathAttribute, Prefix, Segment, Update, AFI, SAFI,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use ipnetwork::IpNetwork;
use log::{debug, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;

use super::codec::{MessageCodec, MessageProtocol};
use super::hold_timer::HoldTimer;
use super::{SessionCommand, SessionError, SessionState, SessionStatus};
use crate::bgp::engine::{PathSpec, PeerSpec, RouteOrigin};

const CONNECT_RETRY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const MESSAGE_POLL: Duration = Duration::from_millis(250);

// AS-TRANS, RFC 6793 4.2.3.9
const AS_TRANS: u16 = 23456;

/// One outbound BGP session. Owns the desired path set for its peer and
/// keeps announcing it across reconnects.
pub(crate) struct Session {
    spec: PeerSpec,
    state: SessionState,
    paths: HashMap<IpNetwork, PathSpec>,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
    status_tx: watch::Sender<SessionStatus>,
    hold_timer: HoldTimer,
    established_at: Option<DateTime<Utc>>,
}

impl Session {
    pub(crate) fn new(
        spec: PeerSpec,
        rx: mpsc::UnboundedReceiver<SessionCommand>,
        status_tx: watch::Sender<SessionStatus>,
    ) -> Session {
        let hold_timer = HoldTimer::new(spec.hold_timer);
        Session {
            spec,
            state: SessionState::Idle,
            paths: HashMap::new(),
            rx,
            status_tx,
            hold_timer,
            established_at: None,
        }
    }

    /// Drive the session until it is administratively shut down.
    /// Transport errors drop back to Idle and reconnect.
    pub(crate) async fn run(mut self) {
        let mut retry = interval(CONNECT_RETRY);
        // A long-lived session must not burst missed connect ticks when
        // it ends
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let connect = tokio::select! {
                _ = retry.tick() => true,
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.apply_idle(cmd) {
                                return;
                            }
                            false
                        }
                        None => return,
                    }
                }
            };
            if !connect {
                continue;
            }
            match self.try_connect().await {
                Ok(protocol) => match self.drive(protocol).await {
                    SessionError::Shutdown => return,
                    err => {
                        warn!("Session with {} ended: {}", self.spec.addr, err);
                        self.set_state(SessionState::Idle);
                    }
                },
                Err(err) => trace!("Connect to {} failed: {}", self.spec.addr, err),
            }
        }
    }

    // Idle-state command handling; returns false on shutdown
    fn apply_idle(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Announce(path) => {
                self.paths.insert(path.prefix, path);
            }
            SessionCommand::Withdraw(path) => {
                self.paths.remove(&path.prefix);
            }
            SessionCommand::Shutdown => return false,
        }
        self.publish_status();
        true
    }

    async fn try_connect(&self) -> io::Result<MessageProtocol> {
        let addr = SocketAddr::new(self.spec.addr, self.spec.dest_port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await??;
        if self.spec.multihop {
            // eBGP multihop wants TTL 255; only plumbed for v4 sockets
            if let Err(err) = stream.set_ttl(255) {
                debug!("Could not set TTL on session with {}: {}", addr, err);
            }
        }
        Ok(Framed::new(stream, MessageCodec::new()))
    }

    async fn drive(&mut self, mut protocol: MessageProtocol) -> SessionError {
        self.set_state(SessionState::Connect);
        if let Err(err) = protocol.send(Message::Open(self.create_open())).await {
            return err.into();
        }
        self.hold_timer = HoldTimer::new(self.spec.hold_timer);
        self.hold_timer.sent();
        self.set_state(SessionState::OpenSent);

        loop {
            // Path changes from the controller
            loop {
                match self.rx.try_recv() {
                    Ok(cmd) => match self.apply_command(cmd, &mut protocol).await {
                        Ok(()) => (),
                        Err(err) => return err,
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        let _ = self.send_cease(&mut protocol).await;
                        return SessionError::Shutdown;
                    }
                }
            }

            // Incoming messages
            match timeout(MESSAGE_POLL, protocol.next()).await {
                Ok(None) => return SessionError::Closed(self.spec.addr),
                Ok(Some(Err(err))) => return err.into(),
                Ok(Some(Ok(message))) => {
                    trace!("[{}] Incoming: {}", self.spec.addr, message_type(&message));
                    self.hold_timer.received();
                    match self.process(message) {
                        Err(err) => return err,
                        Ok(Reaction::Reply(reply)) => {
                            if let Err(err) = protocol.send(reply).await {
                                return err.into();
                            }
                            self.hold_timer.sent();
                        }
                        Ok(Reaction::Establish) => {
                            if let Err(err) = protocol.send(Message::KeepAlive).await {
                                return err.into();
                            }
                            self.hold_timer.sent();
                            if let Err(err) = self.flush_paths(&mut protocol).await {
                                return err;
                            }
                        }
                        Ok(Reaction::Refresh) => {
                            if let Err(err) = self.flush_paths(&mut protocol).await {
                                return err;
                            }
                        }
                        Ok(Reaction::Ignore) => (),
                    }
                }
                // Poll window elapsed with nothing to read
                Err(_) => (),
            }

            // Keepalive & hold-time accounting
            match self.hold_timer.should_send_keepalive().await {
                Err(err) => return err,
                Ok(true) if self.state == SessionState::Established => {
                    if let Err(err) = protocol.send(Message::KeepAlive).await {
                        return err.into();
                    }
                    self.hold_timer.sent();
                }
                Ok(_) => (),
            }
        }
    }

    async fn apply_command(
        &mut self,
        cmd: SessionCommand,
        protocol: &mut MessageProtocol,
    ) -> Result<(), SessionError> {
        match cmd {
            SessionCommand::Announce(path) => {
                let update = self.announce_update(&path);
                self.paths.insert(path.prefix, path);
                if self.state == SessionState::Established {
                    protocol.send(Message::Update(update)).await?;
                    self.hold_timer.sent();
                }
            }
            SessionCommand::Withdraw(path) => {
                if self.paths.remove(&path.prefix).is_some()
                    && self.state == SessionState::Established
                {
                    let update = self.withdraw_update(&path);
                    protocol.send(Message::Update(update)).await?;
                    self.hold_timer.sent();
                }
            }
            SessionCommand::Shutdown => {
                let _ = self.send_cease(protocol).await;
                return Err(SessionError::Shutdown);
            }
        }
        self.publish_status();
        Ok(())
    }

    fn process(&mut self, message: Message) -> Result<Reaction, SessionError> {
        match message {
            Message::Open(open) => {
                let hold_time = self.open_received(&open)?;
                match self.state {
                    SessionState::OpenSent => {
                        self.hold_timer = HoldTimer::new(hold_time);
                        self.set_state(SessionState::OpenConfirm);
                        Ok(Reaction::Reply(Message::KeepAlive))
                    }
                    state => Err(SessionError::FiniteStateMachine {
                        message: "OPEN".to_string(),
                        state,
                    }),
                }
            }
            Message::KeepAlive => match self.state {
                SessionState::OpenConfirm => {
                    self.established_at = Some(Utc::now());
                    self.set_state(SessionState::Established);
                    Ok(Reaction::Establish)
                }
                _ => Ok(Reaction::Ignore),
            },
            // The agent only originates paths; learned routes are not kept
            Message::Update(_) => Ok(Reaction::Ignore),
            Message::Notification(notification) => {
                warn!("{} NOTIFICATION: {}", self.spec.addr, notification);
                Ok(Reaction::Ignore)
            }
            Message::RouteRefresh(_) => Ok(Reaction::Refresh),
        }
    }

    async fn flush_paths(&mut self, protocol: &mut MessageProtocol) -> Result<(), SessionError> {
        let updates: Vec<Update> = self.paths.values().map(|p| self.announce_update(p)).collect();
        for update in updates {
            protocol.send(Message::Update(update)).await?;
            self.hold_timer.sent();
        }
        Ok(())
    }

    async fn send_cease(&mut self, protocol: &mut MessageProtocol) -> Result<(), io::Error> {
        if self.state != SessionState::Established {
            return Ok(());
        }
        let cease = Notification {
            major_err_code: 6, // Cease
            minor_err_code: 2, // Administrative shutdown
            data: vec![],
        };
        protocol.send(Message::Notification(cease)).await
    }

    fn open_received(&mut self, open: &Open) -> Result<u16, SessionError> {
        let remote_asn = asn_from_open(open);
        if remote_asn != self.spec.remote_as {
            return Err(SessionError::OpenAsnMismatch {
                received: remote_asn,
                expected: self.spec.remote_as,
            });
        }
        debug!(
            "[{}] Received OPEN [w/ {} params]",
            self.spec.addr,
            open.parameters.len()
        );
        Ok(open.hold_timer.min(self.spec.hold_timer))
    }

    fn create_open(&self) -> Open {
        let family = match self.spec.addr {
            IpAddr::V4(_) => (AFI::IPV4, SAFI::Unicast),
            IpAddr::V6(_) => (AFI::IPV6, SAFI::Unicast),
        };
        let capabilities = vec![
            OpenCapability::MultiProtocol(family),
            OpenCapability::FourByteASN(self.spec.local_as),
        ];
        let two_byte_asn = if self.spec.local_as < u32::from(u16::MAX) {
            self.spec.local_as as u16
        } else {
            AS_TRANS
        };
        Open {
            version: 4,
            peer_asn: two_byte_asn,
            hold_timer: self.spec.hold_timer,
            identifier: u32::from(self.spec.router_id),
            parameters: vec![OpenParameter::Capabilities(capabilities)],
        }
    }

    fn is_ebgp(&self) -> bool {
        self.spec.remote_as != self.spec.local_as
    }

    /// Build the UPDATE announcing a path. IPv4 paths carry NEXT_HOP and
    /// plain NLRI; IPv6 paths ride MP_REACH_NLRI.
    fn announce_update(&self, path: &PathSpec) -> Update {
        let mut attributes = vec![PathAttribute::ORIGIN(origin_attr(path.origin))];
        let as_path = if self.is_ebgp() {
            ASPath {
                segments: vec![Segment::AS_SEQUENCE(vec![self.spec.local_as])],
            }
        } else {
            ASPath { segments: vec![] }
        };
        attributes.push(PathAttribute::AS_PATH(as_path));
        if !self.is_ebgp() {
            attributes.push(PathAttribute::LOCAL_PREF(100));
        }
        if !path.communities.is_empty() {
            attributes.push(PathAttribute::COMMUNITY(path.communities.clone()));
        }

        let prefix = prefix_from_network(&path.prefix);
        let mut update = Update {
            withdrawn_routes: vec![],
            attributes,
            announced_routes: vec![],
        };
        match path.prefix {
            IpNetwork::V4(_) => {
                update.attributes.push(PathAttribute::NEXT_HOP(path.next_hop));
                update.announced_routes.push(NLRIEncoding::IP(prefix));
            }
            IpNetwork::V6(_) => {
                let next_hop = match path.next_hop {
                    IpAddr::V6(nh) => nh.octets().to_vec(),
                    IpAddr::V4(nh) => nh.octets().to_vec(),
                };
                update.attributes.push(PathAttribute::MP_REACH_NLRI(MPReachNLRI {
                    afi: AFI::IPV6,
                    safi: SAFI::Unicast,
                    next_hop,
                    announced_routes: vec![NLRIEncoding::IP(prefix)],
                }));
            }
        }
        update
    }

    /// Build the UPDATE retracting a path; MP_UNREACH_NLRI for IPv6
    fn withdraw_update(&self, path: &PathSpec) -> Update {
        let prefix = prefix_from_network(&path.prefix);
        match path.prefix {
            IpNetwork::V4(_) => Update {
                withdrawn_routes: vec![NLRIEncoding::IP(prefix)],
                attributes: vec![],
                announced_routes: vec![],
            },
            IpNetwork::V6(_) => Update {
                withdrawn_routes: vec![],
                attributes: vec![PathAttribute::MP_UNREACH_NLRI(MPUnreachNLRI {
                    afi: AFI::IPV6,
                    safi: SAFI::Unicast,
                    withdrawn_routes: vec![NLRIEncoding::IP(prefix)],
                })],
                announced_routes: vec![],
            },
        }
    }

    fn set_state(&mut self, new_state: SessionState) {
        debug!(
            "{} went from {} to {}",
            self.spec.addr, self.state, new_state
        );
        self.state = new_state;
        if self.state != SessionState::Established {
            self.established_at = None;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(SessionStatus {
            state: self.state,
            established_at: self.established_at,
            announced: self.paths.len(),
        });
    }
}

enum Reaction {
    Reply(Message),
    Establish,
    Refresh,
    Ignore,
}

fn message_type(message: &Message) -> &'static str {
    match message {
        Message::Open(_) => "OPEN",
        Message::KeepAlive => "KEEPALIVE",
        Message::Update(_) => "UPDATE",
        Message::Notification(_) => "NOTIFICATION",
        Message::RouteRefresh(_) => "ROUTEREFRESH",
    }
}

fn origin_attr(origin: RouteOrigin) -> Origin {
    match origin {
        RouteOrigin::Igp => Origin::IGP,
        RouteOrigin::Egp => Origin::EGP,
        RouteOrigin::Unknown => Origin::INCOMPLETE,
    }
}

fn prefix_from_network(network: &IpNetwork) -> Prefix {
    let (protocol, octets) = match network {
        IpNetwork::V4(v4) => (AFI::IPV4, v4.ip().octets().to_vec()),
        IpNetwork::V6(v6) => (AFI::IPV6, v6.ip().octets().to_vec()),
    };
    Prefix {
        protocol,
        length: network.prefix(),
        prefix: octets,
    }
}

/// Check the 4-byte ASN capability first, fall back to the header ASN
fn asn_from_open(open: &Open) -> u32 {
    open.parameters
        .iter()
        .filter_map(|p| match p {
            OpenParameter::Capabilities(caps) => Some(caps),
            _ => None,
        })
        .flatten()
        .find_map(|c| match c {
            OpenCapability::FourByteASN(asn) => Some(*asn),
            _ => None,
        })
        .unwrap_or_else(|| u32::from(open.peer_asn))
}
