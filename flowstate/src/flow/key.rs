//! Flow identity and hashing
//!
//! A [`FlowKey`] identifies a bidirectional packet stream. Addresses are
//! stored in one canonical 128-bit form (IPv4 as IPv4-mapped IPv6) so that
//! keys, masked limit keys and the hash never need per-family code paths.
//!
//! The hash is commutative over the two endpoints: a packet and its reply
//! land in the same bucket without canonicalizing the key first.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// IP protocol carried by a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    /// Internet Control Message Protocol (1)
    Icmp,
    /// Transmission Control Protocol (6)
    Tcp,
    /// User Datagram Protocol (17)
    Udp,
    /// ICMP for IPv6 (58)
    IcmpV6,
    /// Any other protocol number
    Other(u8),
}

impl IpProtocol {
    /// Map an IANA protocol number
    #[must_use]
    pub const fn from_number(number: u8) -> Self {
        match number {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            58 => Self::IcmpV6,
            n => Self::Other(n),
        }
    }

    /// IANA protocol number
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::IcmpV6 => 58,
            Self::Other(n) => n,
        }
    }
}

impl From<u8> for IpProtocol {
    fn from(number: u8) -> Self {
        Self::from_number(number)
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icmp => f.write_str("ICMP"),
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
            Self::IcmpV6 => f.write_str("ICMPv6"),
            Self::Other(n) => write!(f, "proto={n}"),
        }
    }
}

/// Address family of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Which orientation of a stored key a packet matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Same orientation as the packet that created the record
    Forward,
    /// Reply direction
    Reverse,
}

impl Direction {
    /// The other direction
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }
}

bitflags::bitflags! {
    /// Fields of a flow key that identify a limit group.
    ///
    /// Fields not in the mask are zeroed before the parent lookup, so
    /// `SRC_ADDR` alone groups every flow from one source address.
    /// The protocol is always part of the group key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LimitMask: u8 {
        const SRC_ADDR = 0b0001;
        const DST_ADDR = 0b0010;
        const SRC_PORT = 0b0100;
        const DST_PORT = 0b1000;
    }
}

/// Canonical identity of a flow
///
/// Construct with [`FlowKey::new`] or the protocol helpers; the fields are
/// private so the canonical address form cannot be bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    protocol: IpProtocol,
    family: AddressFamily,
    src_addr: Ipv6Addr,
    dst_addr: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
}

impl FlowKey {
    /// Create a key from a source and destination socket address.
    ///
    /// A key with one IPv6 endpoint is an IPv6 key; IPv4 endpoints are
    /// stored IPv4-mapped.
    #[must_use]
    pub fn new(protocol: IpProtocol, src: SocketAddr, dst: SocketAddr) -> Self {
        let family = if src.is_ipv4() && dst.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        };
        Self {
            protocol,
            family,
            src_addr: canonical(src.ip()),
            dst_addr: canonical(dst.ip()),
            src_port: src.port(),
            dst_port: dst.port(),
        }
    }

    /// Create a TCP key
    #[must_use]
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(IpProtocol::Tcp, src, dst)
    }

    /// Create a UDP key
    #[must_use]
    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(IpProtocol::Udp, src, dst)
    }

    /// Protocol of the flow
    #[inline]
    pub const fn protocol(&self) -> IpProtocol {
        self.protocol
    }

    /// Address family of the flow
    #[inline]
    pub const fn family(&self) -> AddressFamily {
        self.family
    }

    /// Source address in its original family
    pub fn src_ip(&self) -> IpAddr {
        restore(self.src_addr, self.family)
    }

    /// Destination address in its original family
    pub fn dst_ip(&self) -> IpAddr {
        restore(self.dst_addr, self.family)
    }

    /// Source port (zero for portless protocols)
    #[inline]
    pub const fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Destination port (zero for portless protocols)
    #[inline]
    pub const fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Source socket address
    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip(), self.src_port)
    }

    /// Destination socket address
    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip(), self.dst_port)
    }

    /// Check if this is a TCP flow
    #[inline]
    pub fn is_tcp(&self) -> bool {
        self.protocol == IpProtocol::Tcp
    }

    /// The same flow seen from the other endpoint
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            family: self.family,
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Compare a packet key against both orientations of this key.
    ///
    /// Returns the orientation that matched. A key whose endpoints are
    /// identical matches `Forward`.
    pub fn matches(&self, candidate: &FlowKey) -> Option<Direction> {
        if self.protocol != candidate.protocol || self.family != candidate.family {
            return None;
        }
        if self == candidate {
            Some(Direction::Forward)
        } else if self.src_addr == candidate.dst_addr
            && self.dst_addr == candidate.src_addr
            && self.src_port == candidate.dst_port
            && self.dst_port == candidate.src_port
        {
            Some(Direction::Reverse)
        } else {
            None
        }
    }

    /// Reduce the key to the fields selected by `mask`
    #[must_use]
    pub fn masked(&self, mask: LimitMask) -> Self {
        Self {
            protocol: self.protocol,
            family: self.family,
            src_addr: if mask.contains(LimitMask::SRC_ADDR) {
                self.src_addr
            } else {
                Ipv6Addr::UNSPECIFIED
            },
            dst_addr: if mask.contains(LimitMask::DST_ADDR) {
                self.dst_addr
            } else {
                Ipv6Addr::UNSPECIFIED
            },
            src_port: if mask.contains(LimitMask::SRC_PORT) {
                self.src_port
            } else {
                0
            },
            dst_port: if mask.contains(LimitMask::DST_PORT) {
                self.dst_port
            } else {
                0
            },
        }
    }

    /// Direction-agnostic hash of the key.
    ///
    /// `k.flow_hash() == k.reversed().flow_hash()` for every key.
    pub fn flow_hash(&self) -> u64 {
        let endpoints = endpoint_hash(self.src_addr, self.src_port)
            .wrapping_add(endpoint_hash(self.dst_addr, self.dst_port));
        mix64(endpoints ^ u64::from(self.protocol.number()))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}", self.protocol, self.src(), self.dst())
    }
}

/// Bucket for a hash in a table of `bucket_count` buckets (a power of two)
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn bucket_index(hash: u64, bucket_count: usize) -> usize {
    (hash as usize) & (bucket_count - 1)
}

fn canonical(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn restore(addr: Ipv6Addr, family: AddressFamily) -> IpAddr {
    match (family, addr.to_ipv4_mapped()) {
        (AddressFamily::V4, Some(v4)) => IpAddr::V4(v4),
        _ => IpAddr::V6(addr),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn endpoint_hash(addr: Ipv6Addr, port: u16) -> u64 {
    let bits = u128::from(addr);
    let folded = (bits as u64) ^ ((bits >> 64) as u64).rotate_left(29);
    mix64(folded ^ u64::from(port).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

// splitmix64 finalizer
const fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
