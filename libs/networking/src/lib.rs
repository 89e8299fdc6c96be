//! Networking utilities for the service proxy.
//!
//! This library provides helpers for:
//! - IP family selection for single-stack proxiers
//! - CIDR prefixes (load-balancer source ranges, cluster CIDR)
//! - Bounded, collision-free chain names for packet-filter backends

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod naming;

pub use naming::{
    endpoint_chain_base, hash_and_truncate, is_service_chain_name, service_port_chain_base,
    CHAIN_NAME_BASE_LENGTH_MAX, CHAIN_NAME_PREFIX_LENGTH_MAX, NAME_LENGTH_MAX,
};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Unknown IP family name.
    #[error("unknown IP family: {0} (expected ipv4 or ipv6)")]
    UnknownFamily(String),
}

// ============================================================================
// IP family
// ============================================================================

/// The address family a proxier instance programs rules for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl IpFamily {
    /// Family of a concrete address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Returns true if the address belongs to this family.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        Self::of(addr) == *self
    }

    /// The nftables address-family keyword used in matches (`ip` / `ip6`).
    pub fn nft_keyword(&self) -> &'static str {
        match self {
            Self::Ipv4 => "ip",
            Self::Ipv6 => "ip6",
        }
    }

    /// The loopback range, which never receives node ports.
    pub fn loopback(&self) -> IpPrefix {
        match self {
            Self::Ipv4 => IpPrefix {
                address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 0)),
                prefix_len: 8,
            },
            Self::Ipv6 => IpPrefix {
                address: IpAddr::V6(Ipv6Addr::LOCALHOST),
                prefix_len: 128,
            },
        }
    }
}

impl FromStr for IpFamily {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "4" | "v4" => Ok(Self::Ipv4),
            "ipv6" | "6" | "v6" => Ok(Self::Ipv6),
            other => Err(NetworkError::UnknownFamily(other.to_string())),
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Ipv6 => write!(f, "IPv6"),
        }
    }
}

// ============================================================================
// CIDR prefixes
// ============================================================================

/// An IPv4 or IPv6 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
    /// Base address of the prefix (host bits cleared).
    pub address: IpAddr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl IpPrefix {
    /// Create a new prefix, masking away host bits.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(&address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.0.0.0/8" or "2001:db8::/32").
    ///
    /// Surrounding whitespace is ignored, as is a bare address (treated as a
    /// host prefix).
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = match prefix_str {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| NetworkError::InvalidPrefix(p.to_string()))?,
            None => max_prefix_len(&address),
        };

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix. Addresses of the other
    /// family are never contained.
    pub fn contains(&self, addr: IpAddr) -> bool {
        if IpFamily::of(&addr) != self.family() {
            return false;
        }
        mask(addr, self.prefix_len) == self.address
    }

    /// Family of this prefix.
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.address)
    }
}

impl FromStr for IpPrefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl std::fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix_len == 0 {
                0
            } else if prefix_len >= 32 {
                u32::MAX
            } else {
                u32::MAX << (32 - prefix_len)
            };
            IpAddr::V4(Ipv4Addr::from((bits & mask).to_be_bytes()))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else if prefix_len >= 128 {
                u128::MAX
            } else {
                u128::MAX << (128 - prefix_len)
            };
            IpAddr::V6(Ipv6Addr::from((bits & mask).to_be_bytes()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_prefix() {
        let prefix = IpPrefix::from_cidr("10.244.0.0/16").unwrap();
        assert_eq!(prefix.prefix_len, 16);
        assert_eq!(prefix.family(), IpFamily::Ipv4);

        assert!(prefix.contains("10.244.3.7".parse().unwrap()));
        assert!(!prefix.contains("10.245.0.1".parse().unwrap()));
        assert!(!prefix.contains("fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_prefix() {
        let prefix = IpPrefix::from_cidr("2001:db8::/32").unwrap();
        assert_eq!(prefix.prefix_len, 32);

        assert!(prefix.contains("2001:db8::1".parse().unwrap()));
        assert!(!prefix.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_prefix_masks_host_bits() {
        let prefix = IpPrefix::from_cidr("192.168.1.77/24").unwrap();
        assert_eq!(prefix.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_bare_address_is_host_prefix() {
        let prefix = IpPrefix::from_cidr(" 1.2.3.4 ").unwrap();
        assert_eq!(prefix.prefix_len, 32);
        assert!(prefix.contains("1.2.3.4".parse().unwrap()));
        assert!(!prefix.contains("1.2.3.5".parse().unwrap()));
    }

    #[test]
    fn test_invalid_prefixes() {
        assert!(IpPrefix::from_cidr("10.0.0.0/33").is_err());
        assert!(IpPrefix::from_cidr("not-an-ip/8").is_err());
        assert!(IpPrefix::from_cidr("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_family_parse_and_keyword() {
        assert_eq!("IPv6".parse::<IpFamily>().unwrap(), IpFamily::Ipv6);
        assert_eq!("ipv4".parse::<IpFamily>().unwrap().nft_keyword(), "ip");
        assert!("ipx".parse::<IpFamily>().is_err());
        assert!(IpFamily::Ipv6.matches(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_loopback_ranges() {
        assert!(IpFamily::Ipv4
            .loopback()
            .contains("127.0.0.53".parse().unwrap()));
        assert!(IpFamily::Ipv6.loopback().contains("::1".parse().unwrap()));
    }
}
