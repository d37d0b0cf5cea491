use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// How this machine can be addressed from the LAN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub lan_ip: Option<IpAddr>,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            hostname: detect_hostname(),
            lan_ip: detect_lan_ip(),
        }
    }
}

fn detect_hostname() -> Option<String> {
    match hostname::get() {
        Ok(name) => name.into_string().ok().filter(|name| !name.is_empty()),
        Err(e) => {
            log::warn!("Failed to read hostname: {}", e);
            None
        }
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local()
}

/// Prefer a private IPv4 on an interface that is up, then any non-loopback IPv4.
fn detect_lan_ip() -> Option<IpAddr> {
    let candidates = interface_ipv4_addresses();
    candidates
        .iter()
        .find(|ip| is_private_ipv4(ip))
        .or_else(|| candidates.first())
        .map(|ip| IpAddr::V4(*ip))
        .or_else(routed_ipv4)
}

#[cfg(unix)]
fn interface_ipv4_addresses() -> Vec<Ipv4Addr> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            log::warn!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    addrs
        .filter(|ifaddr| {
            ifaddr.flags.contains(InterfaceFlags::IFF_UP)
                && !ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .filter_map(|ifaddr| {
            ifaddr
                .address
                .as_ref()
                .and_then(|address| address.as_sockaddr_in())
                .map(|sockaddr| Ipv4Addr::from(sockaddr.ip()))
        })
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .collect()
}

#[cfg(not(unix))]
fn interface_ipv4_addresses() -> Vec<Ipv4Addr> {
    Vec::new()
}

/// The source address the OS would route outbound traffic from. No packet is sent.
fn routed_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges() {
        assert!(is_private_ipv4(&Ipv4Addr::new(192, 168, 1, 20)));
        assert!(is_private_ipv4(&Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!is_private_ipv4(&Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn detected_lan_ip_is_never_loopback() {
        if let Some(ip) = HostInfo::detect().lan_ip {
            assert!(!ip.is_loopback());
        }
    }
}
