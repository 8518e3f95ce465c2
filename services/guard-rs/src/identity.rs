use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use axum::http::HeaderMap;

pub const UNKNOWN: &str = "unknown";

/// Header precedence for the client address: CDN, generic proxy, forwarded chain.
const CDN_IP_HEADER: &str = "cf-connecting-ip";
const REAL_IP_HEADER: &str = "x-real-ip";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Best-effort client identity for a request.
///
/// Proxy headers are honored only when `proxies` trusts the transport peer.
/// Header values that are not a bare IP address are skipped.
pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>, proxies: &TrustedProxies) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_ip)
    };

    let from_headers = if proxies.trusts(peer) {
        header(CDN_IP_HEADER)
            .or_else(|| header(REAL_IP_HEADER))
            .or_else(|| {
                headers
                    .get(FORWARDED_FOR_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|chain| chain.split(',').next())
                    .and_then(parse_ip)
            })
    } else {
        None
    };

    match from_headers.or_else(|| peer.map(|addr| addr.ip())) {
        Some(ip) => canonical(ip).to_string(),
        None => UNKNOWN.to_string(),
    }
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

/// Unwraps IPv4-mapped IPv6 so one client has one key.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        ip => ip,
    }
}

/// Peers allowed to set the client address through proxy headers: internal
/// addresses plus the configured list. With no transport peer (in-process
/// callers) headers are taken as given.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    addrs: HashSet<IpAddr>,
}

impl TrustedProxies {
    pub fn new(addrs: HashSet<IpAddr>) -> Self {
        Self { addrs }
    }

    pub fn trusts(&self, peer: Option<SocketAddr>) -> bool {
        match peer {
            None => true,
            Some(addr) => {
                let ip = canonical(addr.ip());
                is_internal(ip) || self.addrs.contains(&ip)
            }
        }
    }
}

/// Loopback, private, link-local and unspecified addresses.
pub fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_internal_v4(v4),
            None => is_internal_v6(v6),
        },
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

/// Exempt identities skip every defense stage.
#[derive(Debug, Clone, Default)]
pub struct Exemptions {
    admins: HashSet<IpAddr>,
}

impl Exemptions {
    pub fn new(admins: HashSet<IpAddr>) -> Self {
        Self { admins }
    }

    pub fn is_exempt(&self, identity: &str) -> bool {
        if identity == UNKNOWN {
            return true;
        }
        match identity.parse::<IpAddr>() {
            Ok(ip) => is_internal(ip) || self.admins.contains(&ip),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn cdn_header_wins_over_everything() {
        let map = headers(&[
            ("cf-connecting-ip", "203.0.113.9"),
            ("x-real-ip", "203.0.113.10"),
            ("x-forwarded-for", "203.0.113.11, 10.0.0.1"),
        ]);
        let peer = "10.0.0.2:4000".parse().ok();
        assert_eq!(resolve(&map, peer, &TrustedProxies::default()), "203.0.113.9");
    }

    #[test]
    fn forwarded_chain_uses_first_hop() {
        let map = headers(&[("x-forwarded-for", " 203.0.113.11 , 10.0.0.1")]);
        assert_eq!(resolve(&map, None, &TrustedProxies::default()), "203.0.113.11");
    }

    #[test]
    fn falls_back_to_peer_then_unknown() {
        let peer = "198.51.100.1:4000".parse().ok();
        let proxies = TrustedProxies::default();
        assert_eq!(resolve(&HeaderMap::new(), peer, &proxies), "198.51.100.1");
        assert_eq!(resolve(&HeaderMap::new(), None, &proxies), UNKNOWN);
    }

    #[test]
    fn mapped_ipv6_is_unwrapped() {
        let peer = "[::ffff:203.0.113.5]:443".parse().ok();
        assert_eq!(resolve(&HeaderMap::new(), peer, &TrustedProxies::default()), "203.0.113.5");
    }

    #[test]
    fn non_address_header_values_fall_through() {
        let proxies = TrustedProxies::default();
        let map = headers(&[
            ("cf-connecting-ip", "0.0.0.0/0"),
            ("x-real-ip", "junk-17"),
            ("x-forwarded-for", "203.0.113.12, 10.0.0.1"),
        ]);
        assert_eq!(resolve(&map, None, &proxies), "203.0.113.12");

        let map = headers(&[("x-forwarded-for", "0.0.0.0/0")]);
        let peer = "192.168.1.20:5000".parse().ok();
        assert_eq!(resolve(&map, peer, &proxies), "192.168.1.20");
        assert_eq!(resolve(&map, None, &proxies), UNKNOWN);
    }

    #[test]
    fn headers_from_untrusted_peers_are_ignored() {
        let map = headers(&[("x-real-ip", "10.0.0.1")]);
        let public_peer = "198.51.100.7:4000".parse().ok();
        assert_eq!(resolve(&map, public_peer, &TrustedProxies::default()), "198.51.100.7");

        let proxy: IpAddr = "198.51.100.7".parse().unwrap();
        let proxies = TrustedProxies::new(HashSet::from([proxy]));
        assert_eq!(resolve(&map, public_peer, &proxies), "10.0.0.1");
    }

    #[test]
    fn internal_and_admin_identities_are_exempt() {
        let admin: IpAddr = "198.51.100.4".parse().unwrap();
        let exemptions = Exemptions::new(HashSet::from([admin]));
        for identity in ["unknown", "127.0.0.1", "10.1.2.3", "192.168.0.8", "172.20.0.1", "::1", "fd00::1", "198.51.100.4"] {
            assert!(exemptions.is_exempt(identity), "{identity} should be exempt");
        }
        assert!(!exemptions.is_exempt("203.0.113.7"));
        assert!(!exemptions.is_exempt("2001:db8::7"));
    }
}
