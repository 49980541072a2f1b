//! Local address discovery for CM address resolution.

use crate::config::RdmaConfig;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

/// IPv4 addresses assigned to this host's interfaces, resolved once per
/// process. Interface churn after startup is not tracked.
fn host_ipv4_addrs() -> &'static [Ipv4Addr] {
    static ADDRS: OnceLock<Vec<Ipv4Addr>> = OnceLock::new();
    ADDRS.get_or_init(|| match nix::ifaddrs::getifaddrs() {
        Ok(ifaddrs) => ifaddrs
            .filter_map(|ifa| ifa.address)
            .filter_map(|addr| addr.as_sockaddr_in().map(|sin| sin.ip()))
            .collect(),
        Err(e) => {
            tracing::warn!("getifaddrs failed: {e}");
            Vec::new()
        }
    })
}

/// True if `ip` refers to this host: loopback, wildcard, or an address
/// assigned to a local interface.
pub(crate) fn is_local_ip(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_unspecified() || host_ipv4_addrs().contains(&ip)
}

/// The source address RDMA traffic must bind to on this host. Device
/// resources live on one NIC, so loopback and wildcard sources are
/// unusable; connections to local destinations go through this address
/// instead.
pub(crate) fn rdma_local_ip(cfg: &RdmaConfig) -> Option<Ipv4Addr> {
    if cfg.local_ip.is_some() {
        return cfg.local_ip;
    }
    host_ipv4_addrs()
        .iter()
        .copied()
        .find(|ip| !ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_wildcard_are_local() {
        assert!(is_local_ip(Ipv4Addr::LOCALHOST));
        assert!(is_local_ip(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn config_override_wins() {
        let mut cfg = RdmaConfig::default();
        cfg.local_ip = Some(Ipv4Addr::new(192, 168, 42, 1));
        assert_eq!(rdma_local_ip(&cfg), Some(Ipv4Addr::new(192, 168, 42, 1)));
    }
}
