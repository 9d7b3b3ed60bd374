use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

struct Defaults {}

impl Defaults {
    fn listen_addr() -> String {
        "127.0.0.1:8080".to_string()
    }

    fn monitor_interval() -> Duration {
        Duration::from_secs(10)
    }

    fn cleanup_timer() -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn consul_query_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn fail_threshold() -> u32 {
        1
    }

    fn origin() -> String {
        "igp".to_string()
    }
}

/// YAML agent configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    // One entry per BGP peer
    #[serde(default)]
    pub bgp: Vec<BgpPeerConfig>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "Defaults::listen_addr")]
    pub listen_addr: String,

    #[serde(default = "Defaults::monitor_interval", with = "humantime_serde")]
    pub monitor_interval: Duration,

    // How long a down app lingers before it is evicted
    #[serde(default = "Defaults::cleanup_timer", with = "humantime_serde")]
    pub cleanup_timer: Duration,

    // Catalogue base URL; empty disables discovery
    #[serde(default)]
    pub consul_addr: String,

    #[serde(default = "Defaults::consul_query_interval", with = "humantime_serde")]
    pub consul_query_interval: Duration,

    #[serde(default)]
    pub consul_token: String,

    // Consecutive failing evaluations before a monitor reports down;
    // 1 withdraws on the first failing tick
    #[serde(default = "Defaults::fail_threshold")]
    pub fail_threshold: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            listen_addr: Defaults::listen_addr(),
            monitor_interval: Defaults::monitor_interval(),
            cleanup_timer: Defaults::cleanup_timer(),
            consul_addr: String::new(),
            consul_query_interval: Defaults::consul_query_interval(),
            consul_token: String::new(),
            fail_threshold: Defaults::fail_threshold(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BgpPeerConfig {
    pub local_as: u32,
    pub peer_as: u32,

    // Defaults to the default gateway for the peer's family
    pub peer_ip: Option<IpAddr>,
    // Defaults to the interface address facing the peer
    pub local_ip: Option<IpAddr>,

    #[serde(default)]
    pub communities: Vec<String>,

    #[serde(default = "Defaults::origin")]
    pub origin: String,

    // "4" or "6"; inferred from peer_ip when missing
    pub addr_family: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VipConfig {
    #[serde(default)]
    pub bgp_communities: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub vip: String,
    #[serde(default)]
    pub vip_config: VipConfig,
    #[serde(default)]
    pub monitors: Vec<String>,
    #[serde(default)]
    pub nats: Vec<String>,
}

/// Parse a YAML config file
pub fn from_file(path: &str) -> Result<Config, Error> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let config: Config = serde_yaml::from_str(&contents)
        .map_err(|err| Error::config(format!("unable to decode {}: {}", path, err)))?;
    for (name, interval) in [
        ("monitor_interval", config.agent.monitor_interval),
        ("cleanup_timer", config.agent.cleanup_timer),
        ("consul_query_interval", config.agent.consul_query_interval),
    ] {
        if interval.is_zero() {
            return Err(Error::config(format!("{} must be non-zero", name)));
        }
    }
    Ok(config)
}
