//! CIDR containment arithmetic and the table of non-routable address ranges.
//!
//! All private-address decisions go through mask arithmetic on the numeric
//! address (`u32` / `u128`), never through string prefixes: `172.16.`
//! style prefixes cannot express `/12` boundaries and silently miss
//! `172.31.x.x` or over-match `172.160.x.x`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("invalid address in CIDR '{0}'")]
    InvalidAddress(String),
    #[error("invalid prefix length in CIDR '{0}'")]
    InvalidPrefix(String),
}

/// An IPv4 or IPv6 network in CIDR notation.
///
/// The stored network address is always masked, so `10.1.2.3/8`
/// parses to `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, CidrError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(CidrError::InvalidPrefix(format!("{addr}/{prefix}")));
        }
        Ok(Self {
            network: mask(addr, prefix),
            prefix,
        })
    }

    /// Builds a table entry from an already-masked IPv4 network.
    const fn v4(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Self {
        Self {
            network: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            prefix,
        }
    }

    /// Builds a table entry from an already-masked IPv6 network.
    const fn v6(segments: [u16; 8], prefix: u8) -> Self {
        let [a, b, c, d, e, f, g, h] = segments;
        Self {
            network: IpAddr::V6(Ipv6Addr::new(a, b, c, d, e, f, g, h)),
            prefix,
        }
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv6(&self) -> bool {
        self.network.is_ipv6()
    }

    /// True if `ip` lies inside this network. Addresses of the other
    /// family never match (IPv4-mapped IPv6 is unwrapped by the caller).
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let m = v4_mask(self.prefix);
                u32::from(net) & m == u32::from(addr) & m
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let m = v6_mask(self.prefix);
                u128::from(net) & m == u128::from(addr) & m
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    /// Parses `addr/prefix`; a bare address is treated as a host route.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| CidrError::InvalidAddress(s.to_string()))?;
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| CidrError::InvalidPrefix(s.to_string()))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };
        Cidr::new(addr, prefix).map_err(|_| CidrError::InvalidPrefix(s.to_string()))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl serde::Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(a) => IpAddr::V4(Ipv4Addr::from(u32::from(a) & v4_mask(prefix))),
        IpAddr::V6(a) => IpAddr::V6(Ipv6Addr::from(u128::from(a) & v6_mask(prefix))),
    }
}

// ── Reserved ranges ──────────────────────────────────────

/// Why an address is not reachable for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Metadata,
    Loopback,
    Unspecified,
    Private,
    UniqueLocal,
    LinkLocal,
    CarrierNat,
    Documentation,
    Benchmark,
    Multicast,
    Broadcast,
    Reserved,
}

impl RangeKind {
    pub fn describe(&self) -> &'static str {
        match self {
            RangeKind::Metadata => "cloud metadata endpoint (private network)",
            RangeKind::Loopback => "loopback address",
            RangeKind::Unspecified => "unspecified address",
            RangeKind::Private => "private network address",
            RangeKind::UniqueLocal => "IPv6 unique-local (private network) address",
            RangeKind::LinkLocal => "link-local address",
            RangeKind::CarrierNat => "carrier-grade NAT (shared private network) address",
            RangeKind::Documentation => "documentation-only address",
            RangeKind::Benchmark => "benchmarking network address",
            RangeKind::Multicast => "multicast address",
            RangeKind::Broadcast => "broadcast address",
            RangeKind::Reserved => "reserved address",
        }
    }
}

/// Well-known cloud metadata service addresses (AWS/GCP/Azure, ECS,
/// Alibaba, AWS IPv6).
pub const METADATA_ADDRESSES: &[IpAddr] = &[
    IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)),
    IpAddr::V4(Ipv4Addr::new(169, 254, 170, 2)),
    IpAddr::V4(Ipv4Addr::new(100, 100, 100, 200)),
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254)),
];

const RESERVED_V4: &[(Cidr, RangeKind)] = &[
    (Cidr::v4(0, 0, 0, 0, 8), RangeKind::Unspecified),
    (Cidr::v4(10, 0, 0, 0, 8), RangeKind::Private),
    (Cidr::v4(100, 64, 0, 0, 10), RangeKind::CarrierNat),
    (Cidr::v4(127, 0, 0, 0, 8), RangeKind::Loopback),
    (Cidr::v4(169, 254, 0, 0, 16), RangeKind::LinkLocal),
    (Cidr::v4(172, 16, 0, 0, 12), RangeKind::Private),
    (Cidr::v4(192, 0, 0, 0, 24), RangeKind::Reserved),
    (Cidr::v4(192, 0, 2, 0, 24), RangeKind::Documentation),
    (Cidr::v4(192, 88, 99, 0, 24), RangeKind::Reserved),
    (Cidr::v4(192, 168, 0, 0, 16), RangeKind::Private),
    (Cidr::v4(198, 18, 0, 0, 15), RangeKind::Benchmark),
    (Cidr::v4(198, 51, 100, 0, 24), RangeKind::Documentation),
    (Cidr::v4(203, 0, 113, 0, 24), RangeKind::Documentation),
    (Cidr::v4(224, 0, 0, 0, 4), RangeKind::Multicast),
    (Cidr::v4(255, 255, 255, 255, 32), RangeKind::Broadcast),
    (Cidr::v4(240, 0, 0, 0, 4), RangeKind::Reserved),
];

const RESERVED_V6: &[(Cidr, RangeKind)] = &[
    (Cidr::v6([0, 0, 0, 0, 0, 0, 0, 1], 128), RangeKind::Loopback),
    (Cidr::v6([0, 0, 0, 0, 0, 0, 0, 0], 128), RangeKind::Unspecified),
    (Cidr::v6([0xfc00, 0, 0, 0, 0, 0, 0, 0], 7), RangeKind::UniqueLocal),
    (Cidr::v6([0xfe80, 0, 0, 0, 0, 0, 0, 0], 10), RangeKind::LinkLocal),
    // Deprecated site-local
    (Cidr::v6([0xfec0, 0, 0, 0, 0, 0, 0, 0], 10), RangeKind::Private),
    (Cidr::v6([0xff00, 0, 0, 0, 0, 0, 0, 0], 8), RangeKind::Multicast),
    (Cidr::v6([0x2001, 0x0db8, 0, 0, 0, 0, 0, 0], 32), RangeKind::Documentation),
    (Cidr::v6([0x0100, 0, 0, 0, 0, 0, 0, 0], 64), RangeKind::Reserved),
    // Deprecated IPv4-compatible addresses (::a.b.c.d)
    (Cidr::v6([0, 0, 0, 0, 0, 0, 0, 0], 96), RangeKind::Reserved),
];

/// Returns every reserved range (both families) as CIDRs, used when a
/// policy asks for the built-in private ranges to be firewalled.
pub fn reserved_ranges() -> impl Iterator<Item = &'static Cidr> {
    RESERVED_V4.iter().chain(RESERVED_V6.iter()).map(|(c, _)| c)
}

/// Classifies `ip` against the built-in non-routable ranges.
///
/// IPv6 forms that embed an IPv4 address (IPv4-mapped `::ffff:a.b.c.d`,
/// NAT64 `64:ff9b::/96`, 6to4 `2002::/16`) are unwrapped and the embedded
/// address is classified instead, so `::ffff:127.0.0.1` is loopback.
pub fn classify(ip: IpAddr) -> Option<RangeKind> {
    if METADATA_ADDRESSES.contains(&ip) {
        return Some(RangeKind::Metadata);
    }
    match ip {
        IpAddr::V4(v4) => RESERVED_V4
            .iter()
            .find(|(cidr, _)| cidr.contains(IpAddr::V4(v4)))
            .map(|(_, kind)| *kind),
        IpAddr::V6(v6) => {
            if let Some(embedded) = embedded_ipv4(v6) {
                return classify(IpAddr::V4(embedded));
            }
            RESERVED_V6
                .iter()
                .find(|(cidr, _)| cidr.contains(IpAddr::V6(v6)))
                .map(|(_, kind)| *kind)
        }
    }
}

/// Extracts an IPv4 address tunnelled inside an IPv6 literal.
fn embedded_ipv4(v6: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return Some(mapped);
    }
    let seg = v6.segments();
    let from_segments = |hi: u16, lo: u16| {
        Ipv4Addr::new((hi >> 8) as u8, (hi & 0xff) as u8, (lo >> 8) as u8, (lo & 0xff) as u8)
    };
    // NAT64 well-known prefix 64:ff9b::/96
    if seg[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        return Some(from_segments(seg[6], seg[7]));
    }
    // 6to4 2002:AABB:CCDD::/48
    if seg[0] == 0x2002 {
        return Some(from_segments(seg[1], seg[2]));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    // ── Parsing ─────────────────────────────────────────

    #[test]
    fn test_parse_masks_network() {
        let cidr: Cidr = "10.1.2.3/8".parse().unwrap();
        assert_eq!(cidr.network(), ip("10.0.0.0"));
        assert_eq!(cidr.prefix(), 8);
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_parse_bare_address_is_host_route() {
        assert_eq!("1.2.3.4".parse::<Cidr>().unwrap().prefix(), 32);
        assert_eq!("::1".parse::<Cidr>().unwrap().prefix(), 128);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("fe80::/129".parse::<Cidr>().is_err());
        assert!("10.0.0.0/abc".parse::<Cidr>().is_err());
    }

    // ── Containment ─────────────────────────────────────

    #[test]
    fn test_contains_slash_twelve_boundaries() {
        let cidr: Cidr = "172.16.0.0/12".parse().unwrap();
        assert!(cidr.contains(ip("172.16.0.1")));
        assert!(cidr.contains(ip("172.31.255.255")));
        assert!(!cidr.contains(ip("172.32.0.0")));
        assert!(!cidr.contains(ip("172.15.255.255")));
        assert!(!cidr.contains(ip("172.160.0.1")));
    }

    #[test]
    fn test_contains_zero_prefix_matches_family() {
        let all_v4: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all_v4.contains(ip("8.8.8.8")));
        assert!(!all_v4.contains(ip("2001:4860::8888")));
    }

    #[test]
    fn test_contains_ipv6() {
        let cidr: Cidr = "fc00::/7".parse().unwrap();
        assert!(cidr.contains(ip("fd12:3456::1")));
        assert!(!cidr.contains(ip("fe80::1")));
    }

    // ── Classification ──────────────────────────────────

    #[test]
    fn test_classify_ipv4_private_ranges() {
        assert_eq!(classify(ip("127.0.0.1")), Some(RangeKind::Loopback));
        assert_eq!(classify(ip("10.20.30.40")), Some(RangeKind::Private));
        assert_eq!(classify(ip("192.168.1.1")), Some(RangeKind::Private));
        assert_eq!(classify(ip("172.20.0.5")), Some(RangeKind::Private));
        assert_eq!(classify(ip("169.254.1.1")), Some(RangeKind::LinkLocal));
        assert_eq!(classify(ip("100.64.0.1")), Some(RangeKind::CarrierNat));
        assert_eq!(classify(ip("0.0.0.0")), Some(RangeKind::Unspecified));
        assert_eq!(classify(ip("255.255.255.255")), Some(RangeKind::Broadcast));
    }

    #[test]
    fn test_classify_metadata_before_link_local() {
        assert_eq!(classify(ip("169.254.169.254")), Some(RangeKind::Metadata));
        assert_eq!(classify(ip("100.100.100.200")), Some(RangeKind::Metadata));
        assert_eq!(classify(ip("fd00:ec2::254")), Some(RangeKind::Metadata));
    }

    #[test]
    fn test_classify_ipv6_loopback_and_local() {
        assert_eq!(classify(ip("::1")), Some(RangeKind::Loopback));
        assert_eq!(classify(ip("::")), Some(RangeKind::Unspecified));
        assert_eq!(classify(ip("fe80::1")), Some(RangeKind::LinkLocal));
        assert_eq!(classify(ip("fd00::1")), Some(RangeKind::UniqueLocal));
    }

    #[test]
    fn test_classify_ipv4_mapped_ipv6() {
        assert_eq!(classify(ip("::ffff:127.0.0.1")), Some(RangeKind::Loopback));
        assert_eq!(classify(ip("::ffff:10.0.0.1")), Some(RangeKind::Private));
        assert_eq!(
            classify(ip("::ffff:169.254.169.254")),
            Some(RangeKind::Metadata)
        );
        assert_eq!(classify(ip("::ffff:8.8.8.8")), None);
    }

    #[test]
    fn test_classify_nat64_and_6to4() {
        assert_eq!(classify(ip("64:ff9b::7f00:1")), Some(RangeKind::Loopback));
        assert_eq!(classify(ip("2002:c0a8:0101::1")), Some(RangeKind::Private));
    }

    #[test]
    fn test_classify_public_addresses() {
        assert_eq!(classify(ip("8.8.8.8")), None);
        assert_eq!(classify(ip("140.82.112.3")), None);
        assert_eq!(classify(ip("172.32.0.1")), None);
        assert_eq!(classify(ip("2606:4700:4700::1111")), None);
    }

    #[test]
    fn test_reserved_table_entries_are_masked() {
        for cidr in reserved_ranges() {
            let reparsed: Cidr = cidr.to_string().parse().unwrap();
            assert_eq!(&reparsed, cidr);
        }
    }
}
