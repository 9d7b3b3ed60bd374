use std::io;

use thiserror::Error;

/// Agent-wide error taxonomy
///
/// Control loops log these and keep ticking; only startup errors
/// (unreadable config, engine failing to come up) abort the process.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid VIP CIDR, monitor/NAT spec, community syntax, or config file
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A different app already announces this VIP
    #[error("vip {vip} is already announced by app {owner}")]
    VipInUse { vip: String, owner: String },

    /// The BGP engine rejected an operation
    #[error("bgp: {0}")]
    Bgp(String),

    /// A system command (loopback, NAT, route lookup) failed
    #[error("system: {0}")]
    System(String),

    /// Catalogue request transport failure
    #[error("catalogue request: {0}")]
    Http(#[from] reqwest::Error),

    /// Catalogue replied with something unusable
    #[error("catalogue: {0}")]
    Catalogue(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(reason: S) -> Self {
        Error::Config(reason.into())
    }
}
