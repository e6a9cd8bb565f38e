//! Per-instance source-IP allow list, parsed from a comma-separated string
//! of literal IPs and/or CIDR networks.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::data::InstanceId;
use crate::error::{ConnectError, Result};

/// A parsed IPv4/IPv6 CIDR network: base address plus prefix length.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    fn parse(s: &str) -> std::result::Result<Self, String> {
        let (addr_part, prefix_part) = s
            .split_once('/')
            .ok_or_else(|| format!("missing '/' in CIDR '{s}'"))?;
        let network: IpAddr = addr_part
            .parse()
            .map_err(|_| format!("invalid address in CIDR '{s}'"))?;
        let prefix_len: u8 = prefix_part
            .parse()
            .map_err(|_| format!("invalid prefix length in CIDR '{s}'"))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(format!("prefix length {prefix_len} exceeds {max} in '{s}'"));
        }
        Ok(Cidr { network, prefix_len })
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_v4(self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_v6(self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

fn mask_v6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len)
    }
}

/// Either "unrestricted" (no entries parsed) or a concrete allow list.
#[derive(Debug, Clone, Default)]
pub struct IpRestriction {
    literals: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
}

impl IpRestriction {
    /// Parse a comma-separated list of IPs and/or CIDRs. An empty or
    /// whitespace-only string parses to an unrestricted (empty) list.
    pub fn parse(csv: &str) -> std::result::Result<Self, String> {
        let mut restriction = IpRestriction::default();
        for raw in csv.split(',') {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }
            if entry.contains('/') {
                restriction.cidrs.push(Cidr::parse(entry)?);
            } else {
                let ip: IpAddr = entry.parse().map_err(|_| format!("invalid ip '{entry}'"))?;
                restriction.literals.push(ip);
            }
        }
        Ok(restriction)
    }

    /// True if there are no restrictions at all (unrestricted).
    pub fn is_unrestricted(&self) -> bool {
        self.literals.is_empty() && self.cidrs.is_empty()
    }

    /// True if unrestricted, or `ip` matches a literal or CIDR entry.
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        self.literals.contains(ip) || self.cidrs.iter().any(|c| c.contains(ip))
    }
}

/// Determine which local source IP the OS would use to reach `host:port`,
/// by opening a connectionless UDP "association" and reading the socket's
/// local address back. No packets are sent.
pub fn get_outbound_ip(host: &str, port: u16) -> Result<IpAddr> {
    let target: SocketAddr = format!("{host}:{port}")
        .parse()
        .or_else(|_| -> std::result::Result<SocketAddr, std::io::Error> {
            use std::net::ToSocketAddrs;
            (host, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))
        })?;

    let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

/// Parse `csv`; if unrestricted, allow. Otherwise probe the outbound IP for
/// `host:port` and check it against the restriction.
pub fn check_source_ip_allowed(
    instance_id: InstanceId,
    csv: &str,
    host: &str,
    port: u16,
) -> Result<()> {
    let restriction = IpRestriction::parse(csv)
        .map_err(|e| ConnectError::KeyStore(format!("invalid ip restriction '{csv}': {e}")))?;
    if restriction.is_unrestricted() {
        return Ok(());
    }

    let source_ip = get_outbound_ip(host, port)?;
    if restriction.is_allowed(&source_ip) {
        Ok(())
    } else {
        Err(ConnectError::IpRestricted {
            instance_id,
            source_ip,
            reason: format!("source ip not in allow list for {host}:{port}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_unrestricted() {
        let r = IpRestriction::parse("").unwrap();
        assert!(r.is_unrestricted());
        assert!(r.is_allowed(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn literal_and_cidr_entries() {
        let r = IpRestriction::parse(" 10.0.0.5 , 192.168.1.0/24").unwrap();
        assert!(r.is_allowed(&"10.0.0.5".parse().unwrap()));
        assert!(r.is_allowed(&"192.168.1.200".parse().unwrap()));
        assert!(!r.is_allowed(&"192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn cidr_boundary() {
        let r = IpRestriction::parse("10.0.0.0/8").unwrap();
        assert!(r.is_allowed(&"10.255.255.255".parse().unwrap()));
        assert!(!r.is_allowed(&"11.0.0.0".parse().unwrap()));
    }

    #[test]
    fn scenario_six_ip_restricted() {
        let r = IpRestriction::parse("10.0.0.0/8").unwrap();
        let outbound: IpAddr = "192.168.1.50".parse().unwrap();
        assert!(!r.is_allowed(&outbound));
    }
}
