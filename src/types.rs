//! Core types shared across the seeder
//!
//! Network addresses are stored in their 16-byte form (IPv4 addresses as
//! v4-mapped IPv6) so the address table can key every peer the same way.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};

/// Helper module for serializing the 20-byte subnetwork identifier as hex
mod subnetwork_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(data: &[u8; 20], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        hex::encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 20], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 20 {
            return Err(serde::de::Error::custom("subnetwork id must be 20 bytes"));
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

// =============================================================================
// SERVICE FLAGS
// =============================================================================

/// Bitfield of services advertised by a peer in its version message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    /// No services.
    pub const NONE: ServiceFlags = ServiceFlags(0);

    /// Peer serves the full block DAG.
    pub const NETWORK: ServiceFlags = ServiceFlags(1 << 0);

    /// Peer supports bloom filtering.
    pub const BLOOM: ServiceFlags = ServiceFlags(1 << 2);

    /// Peer supports compact relay.
    pub const CMPCT: ServiceFlags = ServiceFlags(1 << 6);

    /// Whether all of `required` is advertised.
    pub fn has(self, required: ServiceFlags) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}

impl BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl BitAnd for ServiceFlags {
    type Output = ServiceFlags;

    fn bitand(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 & rhs.0)
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// SUBNETWORK ID
// =============================================================================

/// 20-byte identifier partitioning peers by protocol subnetwork
///
/// The all-ones value is reserved as the "supports all subnetworks"
/// sentinel: a peer advertising it accepts any subnetwork filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetworkId(#[serde(with = "subnetwork_serde")] pub [u8; 20]);

impl SubnetworkId {
    /// Sentinel accepting any subnetwork filter.
    pub const SUPPORTS_ALL: SubnetworkId = SubnetworkId([0xff; 20]);

    pub fn is_supports_all(&self) -> bool {
        *self == Self::SUPPORTS_ALL
    }

    /// Whether a peer advertising `self` satisfies the given filter.
    pub fn matches(&self, filter: Option<&SubnetworkId>) -> bool {
        match filter {
            None => true,
            Some(wanted) => self.is_supports_all() || self == wanted,
        }
    }
}

impl fmt::Display for SubnetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_supports_all() {
            write!(f, "supports-all")
        } else {
            write!(f, "{}", hex::encode(self.0))
        }
    }
}

// =============================================================================
// NETWORK ADDRESS
// =============================================================================

/// Address family requested by a DNS query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// A peer network address
///
/// IPv4 addresses are held v4-mapped, so the 16-byte `ip` is the identity
/// of a peer regardless of family. Equality and hashing ignore the port:
/// the address table keys peers by IP alone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetAddress {
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        NetAddress { ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        NetAddress::new(addr.ip(), addr.port())
    }

    /// The address in its canonical family (mapped v4 unwrapped).
    pub fn canonical_ip(&self) -> IpAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.canonical_ip(), self.port)
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.to_ipv4_mapped().is_some()
    }

    pub fn family(&self) -> IpFamily {
        if self.is_ipv4() {
            IpFamily::V4
        } else {
            IpFamily::V6
        }
    }

    /// Whether the address is worth dialing or handing out
    ///
    /// Rejects the unspecified, loopback, multicast, broadcast and
    /// link-local ranges, and port zero.
    pub fn is_routable(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        match self.canonical_ip() {
            IpAddr::V4(v4) => {
                !v4.is_unspecified()
                    && !v4.is_loopback()
                    && !v4.is_multicast()
                    && !v4.is_broadcast()
                    && !v4.is_link_local()
            }
            IpAddr::V6(v6) => {
                !v6.is_unspecified()
                    && !v6.is_loopback()
                    && !v6.is_multicast()
                    // fe80::/10 link-local unicast
                    && v6.segments()[0] & 0xffc0 != 0xfe80
            }
        }
    }
}

impl PartialEq for NetAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
    }
}

impl Eq for NetAddress {}

impl std::hash::Hash for NetAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
