use std::net::{IpAddr, SocketAddr};

/// Collapse IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to plain IPv4.
///
/// Dual-stack sockets show up in the `tcp6`/`udp6` tables with mapped
/// addresses while the captured packet carries the IPv4 form.
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// True for `0.0.0.0:0` / `[::]:0`, the remote side of an unconnected socket
pub fn is_unconnected(addr: &SocketAddr) -> bool {
    addr.ip().is_unspecified() && addr.port() == 0
}

/// True when a socket bound to `bound` would accept traffic for `observed`
pub fn local_matches(bound: &SocketAddr, observed: &SocketAddr) -> bool {
    if bound.port() != observed.port() {
        return false;
    }
    bound.ip() == observed.ip() || bound.ip().is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mapped() {
        let mapped: SocketAddr = "[::ffff:10.0.0.2]:41000".parse().unwrap();
        assert_eq!(normalize_addr(mapped), "10.0.0.2:41000".parse().unwrap());

        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(normalize_addr(v6), v6);
    }

    #[test]
    fn test_local_matches_wildcard() {
        let observed: SocketAddr = "10.0.0.2:5353".parse().unwrap();
        assert!(local_matches(&"0.0.0.0:5353".parse().unwrap(), &observed));
        assert!(local_matches(&"10.0.0.2:5353".parse().unwrap(), &observed));
        assert!(!local_matches(&"10.0.0.3:5353".parse().unwrap(), &observed));
        assert!(!local_matches(&"0.0.0.0:5354".parse().unwrap(), &observed));
    }

    #[test]
    fn test_is_unconnected() {
        assert!(is_unconnected(&"0.0.0.0:0".parse().unwrap()));
        assert!(is_unconnected(&"[::]:0".parse().unwrap()));
        assert!(!is_unconnected(&"8.8.8.8:53".parse().unwrap()));
    }
}
