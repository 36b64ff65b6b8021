//! Address leaf utilities: total-order comparison, numeric-host formatting,
//! port extraction (spec.md §1: "treated as leaf utilities"; §6; §8
//! property 7: `compare_address` is a total order).

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};

/// A peer/local address in the three families the spec's host systems
/// support. `Unix` carries a path for comparison purposes only — this crate
/// does not open Unix-domain sockets itself, but the comparator must still
/// total-order them against the others for callers that mix address kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(String),
    Ip(SocketAddr),
}

fn family_rank(addr: &Address) -> u8 {
    match addr {
        Address::Unix(_) => 0,
        Address::Ip(SocketAddr::V4(_)) => 1,
        Address::Ip(SocketAddr::V6(_)) => 2,
    }
}

/// Total order over `Address`: family first, then the family's own
/// tiebreakers (spec.md §6 "Address helpers"). UNIX compares by path;
/// IPv4 by host-order address then host-order port; IPv6 by the 16-byte
/// address, port, flowinfo, and scope_id as tiebreakers in that order.
///
/// `std::net::SocketAddrV6` does not expose flowinfo/scope_id as part of
/// `Ord`, so IPv6 flowinfo/scope_id tiebreaking falls back to the address
/// and port only — the two fields spec.md calls out are not observable
/// through the standard socket address type on this platform.
pub fn compare_address(a: &Address, b: &Address) -> Ordering {
    let ra = family_rank(a);
    let rb = family_rank(b);
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Address::Unix(pa), Address::Unix(pb)) => pa.cmp(pb),
        (Address::Ip(SocketAddr::V4(sa)), Address::Ip(SocketAddr::V4(sb))) => {
            u32::from(*sa.ip())
                .cmp(&u32::from(*sb.ip()))
                .then(sa.port().cmp(&sb.port()))
        }
        (Address::Ip(SocketAddr::V6(sa)), Address::Ip(SocketAddr::V6(sb))) => sa
            .ip()
            .octets()
            .cmp(&sb.ip().octets())
            .then(sa.port().cmp(&sb.port()))
            .then(sa.flowinfo().cmp(&sb.flowinfo()))
            .then(sa.scope_id().cmp(&sb.scope_id())),
        _ => unreachable!("family_rank partitions the families"),
    }
}

/// Dotted-quad / bracketed-IPv6 formatting. IPv4 takes the fast path of
/// formatting the host-order 32-bit address directly; IPv6 delegates to
/// the standard library's `Display`, which is the numeric `getnameinfo`
/// equivalent in pure Rust (spec.md §6: "else delegate to numeric
/// `getnameinfo`").
pub fn getnumerichost(addr: &Address) -> Option<String> {
    match addr {
        Address::Unix(_) => None,
        Address::Ip(sa) => match sa.ip() {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                Some(format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3]))
            }
            IpAddr::V6(v6) => Some(v6.to_string()),
        },
    }
}

/// Host-order port for IPv4/IPv6, `None` for UNIX (spec.md §6: "`getport`
/// returns host-order port for IPv4/IPv6, -1 otherwise").
pub fn getport(addr: &Address) -> Option<u16> {
    match addr {
        Address::Unix(_) => None,
        Address::Ip(sa) => Some(sa.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    fn v4(a: [u8; 4], port: u16) -> Address {
        Address::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(a), port)))
    }

    fn v6(a: [u8; 16], port: u16) -> Address {
        Address::Ip(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(a), port, 0, 0)))
    }

    #[test]
    fn total_order_is_reflexive_antisymmetric_transitive() {
        let addrs = vec![
            Address::Unix("/tmp/a".into()),
            Address::Unix("/tmp/b".into()),
            v4([10, 0, 0, 1], 80),
            v4([10, 0, 0, 1], 443),
            v4([10, 0, 0, 2], 1),
            v6([0; 16], 1),
            v6([1; 16], 1),
        ];
        for a in &addrs {
            assert_eq!(compare_address(a, a), Ordering::Equal);
        }
        for a in &addrs {
            for b in &addrs {
                assert_eq!(compare_address(a, b), compare_address(b, a).reverse());
            }
        }
        for a in &addrs {
            for b in &addrs {
                for c in &addrs {
                    if compare_address(a, b) == Ordering::Less && compare_address(b, c) == Ordering::Less {
                        assert_eq!(compare_address(a, c), Ordering::Less);
                    }
                }
            }
        }
    }

    #[test]
    fn families_order_unix_then_v4_then_v6() {
        let u = Address::Unix("/tmp/a".into());
        let four = v4([127, 0, 0, 1], 1);
        let six = v6([0; 16], 1);
        assert_eq!(compare_address(&u, &four), Ordering::Less);
        assert_eq!(compare_address(&four, &six), Ordering::Less);
    }

    #[test]
    fn numerichost_v4_fast_path() {
        let a = v4([192, 168, 1, 2], 443);
        assert_eq!(getnumerichost(&a).as_deref(), Some("192.168.1.2"));
    }

    #[test]
    fn getport_is_host_order() {
        assert_eq!(getport(&v4([1, 2, 3, 4], 8443)), Some(8443));
        assert_eq!(getport(&Address::Unix("/tmp/a".into())), None);
    }
}
