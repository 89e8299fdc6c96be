//! Chain name derivation.
//!
//! Per-service and per-endpoint chains are named after the logical key they
//! serve, prefixed by a short hash of that key:
//!
//! - service port: `HASH-namespace/name/protocol/port`
//! - endpoint: `HASH-namespace/name/protocol/port__ip/port`
//!
//! The hash keeps names distinct when the readable part has to be truncated,
//! and makes visually similar keys easy to tell apart. Fixed chains never
//! contain `/`, so a slash identifies a per-service chain.

use std::net::SocketAddr;

use sha2::{Digest, Sha256};

/// Maximum length of a backend object name.
pub const NAME_LENGTH_MAX: usize = 256;

/// Maximum length of a chain-name prefix such as `service-`, including the
/// trailing hyphen.
pub const CHAIN_NAME_PREFIX_LENGTH_MAX: usize = 16;

/// Maximum length of the string returned by [`hash_and_truncate`].
pub const CHAIN_NAME_BASE_LENGTH_MAX: usize = NAME_LENGTH_MAX - CHAIN_NAME_PREFIX_LENGTH_MAX;

const HASH_PREFIX_LEN: usize = 8;
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Prefix `name` with the first 8 base32 characters of its SHA-256 and
/// truncate the result to [`CHAIN_NAME_BASE_LENGTH_MAX`], ending in `...`
/// when cut.
pub fn hash_and_truncate(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut out = base32_prefix(&digest[..5]);
    out.push('-');
    out.push_str(name);

    if out.len() > CHAIN_NAME_BASE_LENGTH_MAX {
        let mut cut = CHAIN_NAME_BASE_LENGTH_MAX - 3;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push_str("...");
    }
    out
}

/// Base name for the chains of one service port.
pub fn service_port_chain_base(namespace: &str, name: &str, protocol: &str, port: &str) -> String {
    hash_and_truncate(&format!("{}/{}/{}/{}", namespace, name, protocol, port))
}

/// Base name for the chain of one endpoint of a service port.
///
/// IPv6 colons are not legal in chain names and are replaced with dots.
pub fn endpoint_chain_base(
    namespace: &str,
    name: &str,
    protocol: &str,
    port: &str,
    endpoint: SocketAddr,
) -> String {
    let ip = endpoint.ip().to_string().replace(':', ".");
    hash_and_truncate(&format!(
        "{}/{}/{}/{}__{}/{}",
        namespace,
        name,
        protocol,
        port,
        ip,
        endpoint.port()
    ))
}

/// Returns true for chains created per service or per endpoint.
pub fn is_service_chain_name(chain: &str) -> bool {
    chain.contains('/')
}

/// Standard base32 of 5 bytes (40 bits), which is exactly 8 characters.
fn base32_prefix(bytes: &[u8]) -> String {
    let mut bits: u64 = 0;
    for b in bytes.iter().take(5) {
        bits = (bits << 8) | u64::from(*b);
    }

    (0..HASH_PREFIX_LEN)
        .rev()
        .map(|i| BASE32_ALPHABET[((bits >> (i * 5)) & 0x1f) as usize] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_service_chain_base_shape() {
        let base = service_port_chain_base("ns1", "svc1", "tcp", "p80");
        let (hash, rest) = base.split_once('-').unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b)));
        assert_eq!(rest, "ns1/svc1/tcp/p80");
        assert!(is_service_chain_name(&base));
    }

    #[test]
    fn test_endpoint_chain_base_ipv6() {
        let ep: SocketAddr = "[fd00::1]:8080".parse().unwrap();
        let base = endpoint_chain_base("ns1", "svc1", "udp", "dns", ep);
        assert!(base.ends_with("-ns1/svc1/udp/dns__fd00..1/8080"));
        assert!(!base.contains(':'));
    }

    #[test]
    fn test_base32_known_value() {
        // "hello" in RFC 4648 base32 is NBSWY3DP.
        assert_eq!(base32_prefix(b"hello"), "NBSWY3DP");
    }

    #[test]
    fn test_fixed_chains_are_not_service_chains() {
        for chain in ["services", "nodeports", "filter-input", "mark-for-masquerade"] {
            assert!(!is_service_chain_name(chain));
        }
    }

    #[test]
    fn test_long_names_are_truncated() {
        let long = "x".repeat(400);
        let base = hash_and_truncate(&long);
        assert_eq!(base.len(), CHAIN_NAME_BASE_LENGTH_MAX);
        assert!(base.ends_with("..."));
    }

    proptest! {
        #[test]
        fn prop_chain_base_bounded(name in ".{0,400}") {
            prop_assert!(hash_and_truncate(&name).len() <= CHAIN_NAME_BASE_LENGTH_MAX);
        }

        #[test]
        fn prop_near_duplicates_differ(
            ns in "[a-z0-9-]{1,20}",
            svc in "[a-z0-9-]{1,20}",
            a in 1u16..65535,
            b in 1u16..65535,
        ) {
            prop_assume!(a != b);
            let ea: SocketAddr = ([10, 0, 0, 1], a).into();
            let eb: SocketAddr = ([10, 0, 0, 1], b).into();
            prop_assert_ne!(
                endpoint_chain_base(&ns, &svc, "tcp", "http", ea),
                endpoint_chain_base(&ns, &svc, "tcp", "http", eb)
            );
        }
    }
}
