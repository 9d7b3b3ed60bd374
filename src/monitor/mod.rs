use std::process::Stdio;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::process::Command;

use crate::app::{App, Monitor, Protocol};
use crate::catalogue::CatalogueClient;

/// Probe for a local listener by trying to bind the port ourselves.
/// The semantics are inverted: a failed bind means something is already
/// listening, so the check passes.
pub async fn port_check(protocol: Protocol, port: u16) -> bool {
    match protocol {
        Protocol::Tcp => match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                drop(listener);
                false
            }
            Err(_) => {
                trace!("Monitor tcp port {} up", port);
                true
            }
        },
        Protocol::Udp => match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => {
                drop(socket);
                false
            }
            Err(_) => {
                trace!("Monitor udp port {} up", port);
                true
            }
        },
    }
}

/// Run a command through the shell; exit 0 passes. Output is discarded
/// and the child is always awaited.
pub async fn exec_check(command: &str) -> bool {
    let status = Command::new("bash")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) => {
            if !status.success() {
                trace!("Monitor cmd '{}' failed: {}", command, status);
            }
            status.success()
        }
        Err(err) => {
            debug!("Cannot exec cmd '{}': {}", command, err);
            false
        }
    }
}

/// Evaluate one monitor for an app
pub async fn evaluate(
    app: &App,
    monitor: &Monitor,
    catalogue: Option<&Arc<CatalogueClient>>,
) -> bool {
    match monitor {
        Monitor::Port { protocol, port } => port_check(*protocol, *port).await,
        Monitor::Exec { command } => exec_check(command).await,
        Monitor::Catalogue => match catalogue {
            Some(client) => match client.health_check(&app.name).await {
                Ok(healthy) => healthy,
                Err(err) => {
                    error!(
                        "Failed to perform catalogue healthcheck for {}: {}",
                        app.name, err
                    );
                    false
                }
            },
            None => {
                warn!(
                    "App {} has a catalogue monitor but discovery is disabled",
                    app.name
                );
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_port_monitor() {
        // The app's own listener, bound outside the agent
        let listener = std::net::TcpListener::bind("127.0.0.1:33333").unwrap();
        assert!(port_check(Protocol::Tcp, 33333).await);
        assert!(!port_check(Protocol::Tcp, 44444).await);
        drop(listener);
        assert!(!port_check(Protocol::Tcp, 33333).await);
    }

    #[tokio::test]
    async fn test_udp_port_monitor() {
        let socket = std::net::UdpSocket::bind("0.0.0.0:33334").unwrap();
        assert!(port_check(Protocol::Udp, 33334).await);
        assert!(!port_check(Protocol::Udp, 44445).await);
        drop(socket);
    }

    #[tokio::test]
    async fn test_exec_monitor() {
        assert!(exec_check("echo foo").await);
        assert!(!exec_check("echo foo && false").await);
        assert!(!exec_check("/nonexistent-binary-for-test").await);
    }
}
