//! Browser origin policy and client IP derivation for incoming upgrades.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::http::HeaderMap;

/// Allow list plus implicit accept for local and private-network origins.
/// A client that sends no `Origin` header is accepted.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Build from a comma-separated allow list (the `IRC_ALLOWED_ORIGINS`
    /// env var). Empty entries are skipped.
    pub fn from_list(csv: &str) -> Self {
        let allowed = csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { allowed }
    }

    pub fn allows(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        if self.allowed.iter().any(|a| a == origin) {
            return true;
        }
        origin_host(origin).map(is_local_host).unwrap_or(false)
    }
}

/// Extract the host part of `scheme://host[:port]`.
fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin.split_once("://").map(|(_, r)| r).unwrap_or(origin);
    let rest = rest.split('/').next()?;
    if let Some(stripped) = rest.strip_prefix('[') {
        // Bracketed IPv6 literal.
        return stripped.split(']').next();
    }
    Some(rest.rsplit_once(':').map(|(host, _)| host).unwrap_or(rest))
}

fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_loopback() || is_rfc1918(v4),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

fn is_rfc1918(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

/// Derive the client IP: `X-Forwarded-For` first hop when it parses as an
/// IP, then `X-Real-IP`, then `CF-Connecting-IP`, then the peer address.
/// IPv4-mapped `::ffff:` prefixes are stripped.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let candidate = strip_mapped(first.trim());
            if candidate.parse::<IpAddr>().is_ok() {
                return candidate.to_string();
            }
        }
    }
    for name in ["x-real-ip", "cf-connecting-ip"] {
        if let Some(value) = header_str(headers, name) {
            let candidate = strip_mapped(value.trim());
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }
    strip_mapped(&peer.ip().to_string()).to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn strip_mapped(ip: &str) -> &str {
    ip.strip_prefix("::ffff:").unwrap_or(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn peer(ip: &str) -> SocketAddr {
        format!("{ip}:12345").parse().unwrap()
    }

    #[test]
    fn missing_origin_is_accepted() {
        assert!(OriginPolicy::default().allows(None));
    }

    #[test]
    fn allow_list_and_local_origins() {
        let policy = OriginPolicy::from_list("https://chat.example.com");
        assert!(policy.allows(Some("https://chat.example.com")));
        assert!(policy.allows(Some("http://localhost:3000")));
        assert!(policy.allows(Some("http://127.0.0.1")));
        assert!(policy.allows(Some("http://192.168.1.20:8080")));
        assert!(policy.allows(Some("http://10.1.2.3")));
        assert!(policy.allows(Some("http://172.20.0.1")));
        assert!(!policy.allows(Some("https://evil.example.net")));
        assert!(!policy.allows(Some("http://172.32.0.1")));
    }

    #[test]
    fn forwarded_for_first_hop_wins_when_valid() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(client_ip(&h, peer("10.0.0.9")), "203.0.113.7");
    }

    #[test]
    fn invalid_forwarded_falls_through_to_real_ip() {
        let h = headers(&[
            ("x-forwarded-for", "not-an-ip"),
            ("x-real-ip", "198.51.100.4"),
        ]);
        assert_eq!(client_ip(&h, peer("10.0.0.9")), "198.51.100.4");
    }

    #[test]
    fn peer_address_is_the_fallback_and_mapped_prefix_strips() {
        let h = HeaderMap::new();
        assert_eq!(client_ip(&h, peer("10.0.0.9")), "10.0.0.9");
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:443".parse().unwrap();
        assert_eq!(client_ip(&h, mapped), "192.0.2.1");
    }
}
