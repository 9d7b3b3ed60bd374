use std::net::IpAddr;
use std::process::Stdio;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use log::debug;
use tokio::process::Command;

use crate::app::{AddressFamily, NatMapping};
use crate::error::Error;

// Linux kernel limit for interface address labels
const LABEL_MAX: usize = 15;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NatOp {
    Add,
    Delete,
}

impl NatOp {
    fn flag(self) -> &'static str {
        match self {
            NatOp::Add => "A",
            NatOp::Delete => "D",
        }
    }
}

/// OS side effects the agent depends on: loopback addresses, DNAT rules
/// and route lookups. Production shells out to iproute2/iptables; tests
/// substitute an in-memory fake.
#[async_trait]
pub trait SystemOps: Send + Sync {
    /// Default next-hop for the given family
    async fn gateway(&self, family: AddressFamily) -> Result<IpAddr, Error>;

    /// Next-hop used to reach `dest` (equals `dest` when directly connected)
    async fn via(&self, dest: IpAddr) -> Result<IpAddr, Error>;

    /// Host interface address sharing a subnet with `gateway`
    async fn local_address(&self, gateway: IpAddr) -> Result<IpAddr, Error>;

    /// Idempotent (delete-then-add) secondary address on the loopback
    async fn add_loopback(&self, name: &str, addr: IpNetwork) -> Result<(), Error>;

    async fn delete_loopback(&self, addr: IpNetwork) -> Result<(), Error>;

    /// Add or delete a PREROUTING DNAT rule from vip:listen to local:dest
    async fn nat_rule(
        &self,
        op: NatOp,
        vip: IpAddr,
        local: IpAddr,
        nat: &NatMapping,
    ) -> Result<(), Error>;
}

pub fn loopback_label(name: &str) -> String {
    let mut label = format!("lo:{}", name);
    if label.len() > LABEL_MAX {
        let mut cut = LABEL_MAX;
        while !label.is_char_boundary(cut) {
            cut -= 1;
        }
        label.truncate(cut);
    }
    label
}

fn ip_cmd(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::V4 => "ip",
        AddressFamily::V6 => "ip -6",
    }
}

fn family_of(addr: IpAddr) -> AddressFamily {
    if addr.is_ipv4() {
        AddressFamily::V4
    } else {
        AddressFamily::V6
    }
}

/// Find an interface address (from `ip -o addr show` output) whose
/// network contains `gateway`.
fn parse_local_address(output: &str, gateway: IpAddr) -> Option<IpAddr> {
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let cidr = match (fields.nth(2), fields.next()) {
            (Some("inet"), Some(cidr)) | (Some("inet6"), Some(cidr)) => cidr,
            _ => continue,
        };
        if let Ok(network) = cidr.parse::<IpNetwork>() {
            if network.contains(gateway) {
                return Some(network.ip());
            }
        }
    }
    None
}

/// SystemOps implemented by shelling out to `ip`, `ip -6`, `iptables`
/// and `ip6tables` via `bash -c`.
pub struct ShellOps;

impl ShellOps {
    async fn run(&self, cmd: &str) -> Result<String, Error> {
        debug!("exec: {}", cmd);
        let output = Command::new("bash")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| Error::System(format!("failed to spawn '{}': {}", cmd, err)))?;
        if !output.status.success() {
            return Err(Error::System(format!(
                "'{}' exited {}: {}",
                cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SystemOps for ShellOps {
    async fn gateway(&self, family: AddressFamily) -> Result<IpAddr, Error> {
        let cmd = format!(r#"{} route | grep "^default" | cut -d" " -f3"#, ip_cmd(family));
        let out = self.run(&cmd).await?;
        out.trim()
            .parse()
            .map_err(|_| Error::System(format!("no default gateway for family {}", family)))
    }

    async fn via(&self, dest: IpAddr) -> Result<IpAddr, Error> {
        let cmd = format!(
            r#"{} route get {} | grep via | cut -d" " -f3"#,
            ip_cmd(family_of(dest)),
            dest
        );
        let out = self.run(&cmd).await?;
        if out.trim().is_empty() {
            // No via hop: the destination is directly connected
            return Ok(dest);
        }
        out.trim()
            .parse()
            .map_err(|_| Error::System(format!("unparseable next-hop for {}", dest)))
    }

    async fn local_address(&self, gateway: IpAddr) -> Result<IpAddr, Error> {
        let out = self.run("ip -o addr show").await?;
        parse_local_address(&out, gateway)
            .ok_or_else(|| Error::System(format!("no local address shares a subnet with {}", gateway)))
    }

    async fn add_loopback(&self, name: &str, addr: IpNetwork) -> Result<(), Error> {
        // Delete first so repeated adds do not stack duplicate entries
        let _ = self.delete_loopback(addr).await;
        let cmd = format!(
            "{} address add {}/{} dev lo label {}",
            ip_cmd(AddressFamily::of(&addr)),
            addr.ip(),
            addr.prefix(),
            loopback_label(name)
        );
        self.run(&cmd).await.map(|_| ())
    }

    async fn delete_loopback(&self, addr: IpNetwork) -> Result<(), Error> {
        let cmd = format!(
            "{} address delete {}/{} dev lo",
            ip_cmd(AddressFamily::of(&addr)),
            addr.ip(),
            addr.prefix()
        );
        self.run(&cmd).await.map(|_| ())
    }

    async fn nat_rule(
        &self,
        op: NatOp,
        vip: IpAddr,
        local: IpAddr,
        nat: &NatMapping,
    ) -> Result<(), Error> {
        let iptables = match family_of(vip) {
            AddressFamily::V4 => "iptables",
            AddressFamily::V6 => "ip6tables",
        };
        let dest = match local {
            IpAddr::V4(v4) => format!("{}:{}", v4, nat.dest_port),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, nat.dest_port),
        };
        let cmd = format!(
            "{} -t nat -{} PREROUTING -p {} -d {} --dport {} -j DNAT --to-destination {}",
            iptables,
            op.flag(),
            nat.protocol,
            vip,
            nat.listen_port,
            dest
        );
        self.run(&cmd).await.map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_label_truncation() {
        assert_eq!(loopback_label("web"), "lo:web");
        // 12 chars of name -> exactly 15 with the prefix
        assert_eq!(loopback_label("abcdefghijkl"), "lo:abcdefghijkl");
        // 13 and 14 chars truncate to the same 15 bytes
        assert_eq!(loopback_label("abcdefghijklm"), "lo:abcdefghijkl");
        assert_eq!(loopback_label("abcdefghijklmn"), "lo:abcdefghijkl");
        assert_eq!(loopback_label("abcdefghijklmn").len(), 15);
    }

    #[test]
    fn test_parse_local_address() {
        let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 10.1.2.5/24 brd 10.1.2.255 scope global eth0\\       valid_lft forever preferred_lft forever
2: eth0    inet6 2001:db8:2::5/64 scope global \\       valid_lft forever preferred_lft forever
";
        assert_eq!(
            parse_local_address(output, "10.1.2.1".parse().unwrap()),
            Some("10.1.2.5".parse().unwrap())
        );
        assert_eq!(
            parse_local_address(output, "2001:db8:2::1".parse().unwrap()),
            Some("2001:db8:2::5".parse().unwrap())
        );
        assert_eq!(parse_local_address(output, "192.168.0.1".parse().unwrap()), None);
    }
}
