use std::fmt;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::error::Error;

/// Address family of a VIP or peer
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => AddressFamily::V4,
            IpNetwork::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "4"),
            AddressFamily::V6 => write!(f, "6"),
        }
    }
}

/// Where an app definition came from
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Config,
    Discovery,
    Admin,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            Source::Config => "config",
            Source::Discovery => "discovery",
            Source::Admin => "admin",
        };
        write!(f, "{}", word)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::config(format!("unsupported protocol '{}'", other))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

fn parse_port(value: &str) -> Result<u16, Error> {
    let port: u16 = value
        .parse()
        .map_err(|_| Error::config(format!("invalid port '{}'", value)))?;
    if port == 0 {
        return Err(Error::config("port must be within 1-65535"));
    }
    Ok(port)
}

/// A single health probe; all of an app's monitors must pass for the
/// VIP to be announced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Monitor {
    Port { protocol: Protocol, port: u16 },
    Exec { command: String },
    Catalogue,
}

impl FromStr for Monitor {
    type Err = Error;

    /// Valid forms: "port:tcp:123", "exec:/local/check.sh", "consul"
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match value.find(':') {
            Some(i) => (&value[..i], &value[i + 1..]),
            None => (value, ""),
        };
        match kind {
            "port" => {
                let parts: Vec<&str> = rest.split(':').collect();
                if parts.len() != 2 {
                    return Err(Error::config(format!(
                        "invalid port monitor '{}', must specify proto:port",
                        value
                    )));
                }
                Ok(Monitor::Port {
                    protocol: parts[0].parse()?,
                    port: parse_port(parts[1])?,
                })
            }
            "exec" => {
                if rest.is_empty() {
                    return Err(Error::config(format!(
                        "invalid exec monitor '{}', must specify command",
                        value
                    )));
                }
                Ok(Monitor::Exec {
                    command: rest.to_string(),
                })
            }
            "consul" => Ok(Monitor::Catalogue),
            other => Err(Error::config(format!("invalid monitor type '{}'", other))),
        }
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Monitor::Port { protocol, port } => write!(f, "port:{}:{}", protocol, port),
            Monitor::Exec { command } => write!(f, "exec:{}", command),
            Monitor::Catalogue => write!(f, "consul"),
        }
    }
}

/// DNAT from VIP:listen_port to the local source address:dest_port
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NatMapping {
    pub protocol: Protocol,
    pub listen_port: u16,
    pub dest_port: u16,
}

impl FromStr for NatMapping {
    type Err = Error;

    /// Valid forms: "tcp:80" (dest defaults to listen), "tcp:80:8080"
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(':').collect();
        let (protocol, listen, dest) = match parts.as_slice() {
            [proto, listen] => (proto, listen, None),
            [proto, listen, dest] => (proto, listen, Some(dest)),
            _ => {
                return Err(Error::config(format!(
                    "invalid nat spec '{}', must be proto:lport[:dport]",
                    value
                )))
            }
        };
        let listen_port = parse_port(listen)?;
        let dest_port = match dest {
            Some(d) => parse_port(d)?,
            None => listen_port,
        };
        Ok(NatMapping {
            protocol: protocol.parse()?,
            listen_port,
            dest_port,
        })
    }
}

impl fmt::Display for NatMapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.protocol, self.listen_port, self.dest_port
        )
    }
}

/// Catalogue service registered while the VIP is announced, giving the
/// catalogue its own TCP check against this host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VipService {
    pub name: String,
    pub check_port: u16,
}

impl VipService {
    /// Check spec form: "tcp:<port>"
    pub fn from_check_spec(name: String, spec: &str) -> Result<Self, Error> {
        match spec.split_once(':') {
            Some(("tcp", port)) => Ok(VipService {
                name,
                check_port: parse_port(port)?,
            }),
            _ => Err(Error::config(format!(
                "invalid vip check spec '{}', must be tcp:<port>",
                spec
            ))),
        }
    }
}

/// An application whose health gates a VIP announcement
#[derive(Clone, Debug)]
pub struct App {
    pub name: String,
    pub vip: IpNetwork,
    pub communities: Vec<u32>,
    pub monitors: Vec<Monitor>,
    pub nats: Vec<NatMapping>,
    pub vip_service: Option<VipService>,
    pub source: Source,
}

impl App {
    pub fn new(
        name: &str,
        vip: &str,
        communities: &[String],
        monitors: &[String],
        nats: &[String],
        vip_service: Option<VipService>,
        source: Source,
    ) -> Result<App, Error> {
        if name.is_empty() {
            return Err(Error::config("invalid app name"));
        }
        if !vip.contains('/') {
            return Err(Error::config(format!(
                "invalid vip '{}', need ip/mask",
                vip
            )));
        }
        let vip: IpNetwork = vip
            .parse()
            .map_err(|_| Error::config(format!("invalid vip '{}', need ip/mask", vip)))?;
        let communities = communities
            .iter()
            .map(|c| crate::bgp::parse_community(c))
            .collect::<Result<Vec<u32>, Error>>()?;
        let monitors = monitors
            .iter()
            .map(|m| m.parse())
            .collect::<Result<Vec<Monitor>, Error>>()?;
        let nats = nats
            .iter()
            .map(|n| n.parse())
            .collect::<Result<Vec<NatMapping>, Error>>()?;
        Ok(App {
            name: name.to_string(),
            vip,
            communities,
            monitors,
            nats,
            vip_service,
            source,
        })
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.vip)
    }
}

/// Two apps are the same if they share a name, VIP and monitor set;
/// monitor order is irrelevant.
impl PartialEq for App {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.vip == other.vip
            && self.monitors.len() == other.monitors.len()
            && other.monitors.iter().all(|m| self.monitors.contains(m))
    }
}

impl Eq for App {}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let monitors: Vec<String> = self.monitors.iter().map(|m| m.to_string()).collect();
        write!(
            f,
            "<App {} vip={} source={} monitors=[{}]>",
            self.name,
            self.vip,
            self.source,
            monitors.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(specs: &[&str]) -> Vec<String> {
        specs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_app_parsing() {
        let app1 = App::new(
            "app1",
            "1.1.1.1/32",
            &[],
            &strings(&["port:tcp:123"]),
            &[],
            None,
            Source::Config,
        )
        .unwrap();
        let app2 = App::new(
            "app1",
            "1.1.1.1/32",
            &[],
            &strings(&["port:tcp:123"]),
            &[],
            None,
            Source::Config,
        )
        .unwrap();
        let app3 = App::new(
            "app3",
            "2.2.2.2/32",
            &[],
            &strings(&["exec:/bin/testme"]),
            &[],
            None,
            Source::Config,
        )
        .unwrap();

        assert_eq!(app1.vip.to_string(), "1.1.1.1/32");
        assert_eq!(
            app1.monitors[0],
            Monitor::Port {
                protocol: Protocol::Tcp,
                port: 123
            }
        );
        assert_eq!(app1, app2);
        assert_eq!(app2, app1);
        assert_eq!(app1, app1);
        assert_ne!(app1, app3);
        assert_eq!(
            app3.monitors[0],
            Monitor::Exec {
                command: "/bin/testme".to_string()
            }
        );
    }

    #[test]
    fn test_app_parsing_errors() {
        // Bare IP without a mask
        assert!(App::new("app4", "4.4.4.4", &[], &[], &[], None, Source::Config).is_err());
        // Bad monitor proto
        assert!(App::new(
            "app4",
            "4.4.4.4/32",
            &[],
            &strings(&["port:abcd:1023"]),
            &[],
            None,
            Source::Config
        )
        .is_err());
        // Empty name
        assert!(App::new("", "4.4.4.4/32", &[], &[], &[], None, Source::Config).is_err());
        // Bad community
        assert!(App::new(
            "app4",
            "4.4.4.4/32",
            &strings(&["not-a-community"]),
            &[],
            &[],
            None,
            Source::Config
        )
        .is_err());
    }

    #[test]
    fn test_monitor_port_bounds() {
        assert!("port:tcp:0".parse::<Monitor>().is_err());
        assert!("port:tcp:65536".parse::<Monitor>().is_err());
        assert!("port:tcp:1".parse::<Monitor>().is_ok());
        assert!("port:tcp:65535".parse::<Monitor>().is_ok());
    }

    #[test]
    fn test_monitor_round_trip() {
        for spec in ["port:tcp:8080", "port:udp:53", "exec:/bin/true", "consul"] {
            let monitor: Monitor = spec.parse().unwrap();
            assert_eq!(monitor.to_string(), spec);
            assert_eq!(monitor.to_string().parse::<Monitor>().unwrap(), monitor);
        }
        // Commands keep their colons
        let monitor: Monitor = "exec:redis-cli -h ::1 ping".parse().unwrap();
        assert_eq!(
            monitor,
            Monitor::Exec {
                command: "redis-cli -h ::1 ping".to_string()
            }
        );
    }

    #[test]
    fn test_nat_parsing() {
        let nat: NatMapping = "tcp:80".parse().unwrap();
        assert_eq!(nat.listen_port, 80);
        assert_eq!(nat.dest_port, 80);

        let nat: NatMapping = "udp:53:5353".parse().unwrap();
        assert_eq!(nat.protocol, Protocol::Udp);
        assert_eq!(nat.listen_port, 53);
        assert_eq!(nat.dest_port, 5353);

        assert!("tcp".parse::<NatMapping>().is_err());
        assert!("tcp:0".parse::<NatMapping>().is_err());
        assert!("sctp:80".parse::<NatMapping>().is_err());
    }

    #[test]
    fn test_vip_service_spec() {
        let vs = VipService::from_check_spec("web-vip".to_string(), "tcp:443").unwrap();
        assert_eq!(vs.check_port, 443);
        assert!(VipService::from_check_spec("web-vip".to_string(), "443").is_err());
        assert!(VipService::from_check_spec("web-vip".to_string(), "udp:443").is_err());
    }

    #[test]
    fn test_v6_vip() {
        let app = App::new(
            "v6app",
            "2001:db8::1/128",
            &[],
            &strings(&["exec:/bin/true"]),
            &[],
            None,
            Source::Config,
        )
        .unwrap();
        assert_eq!(app.family(), AddressFamily::V6);
    }
}
