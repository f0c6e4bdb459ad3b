use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::IpAddr;

/// Private, loopback and link-local ranges reported as `isLocal` in listings.
static LOCAL_RANGES: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "fe80::/10",
    ]
    .iter()
    .filter_map(|range| range.parse().ok())
    .collect()
});

/// A peer seen on the local network.
///
/// `id` is `"<instance name>-<host>"` so that several peers behind the same
/// address stay distinct.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub display_name: String,
    /// Resolved address, or the advertised host when nothing resolved.
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub last_seen_at: DateTime<Utc>,
}

impl PeerRecord {
    pub fn peer_id(display_name: &str, host: &str) -> String {
        format!("{}-{}", display_name, host)
    }

    pub fn is_local(&self) -> bool {
        is_local_address(&self.address)
    }
}

/// Membership change produced by browsing the announcement protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Up(PeerRecord),
    Down(PeerRecord),
}

impl PeerEvent {
    pub fn record(&self) -> &PeerRecord {
        match self {
            PeerEvent::Up(record) | PeerEvent::Down(record) => record,
        }
    }
}

pub fn is_local_ip(ip: &IpAddr) -> bool {
    LOCAL_RANGES.iter().any(|range| range.contains(*ip))
}

/// Like [`is_local_ip`] but for addresses that may carry an IPv6 zone suffix
/// (`fe80::1%en0`) or may not be an address at all.
pub fn is_local_address(address: &str) -> bool {
    let bare = address.split('%').next().unwrap_or(address);
    bare.parse::<IpAddr>()
        .map(|ip| is_local_ip(&ip))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_local() {
        for addr in ["10.1.2.3", "172.16.0.1", "172.31.255.254", "192.168.1.20", "127.0.0.1", "fe80::1"] {
            assert!(is_local_address(addr), "{addr} should be local");
        }
    }

    #[test]
    fn public_and_edge_ranges_are_not_local() {
        for addr in ["8.8.8.8", "172.15.0.1", "172.32.0.1", "2001:db8::1", "not-an-ip"] {
            assert!(!is_local_address(addr), "{addr} should not be local");
        }
    }

    #[test]
    fn zoned_link_local_is_local() {
        assert!(is_local_address("fe80::1%en0"));
    }

    #[test]
    fn peer_id_combines_name_and_host() {
        assert_eq!(PeerRecord::peer_id("alice", "alice.local."), "alice-alice.local.");
    }
}
