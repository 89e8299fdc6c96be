//! Daemon configuration.
//!
//! Everything comes from `SVCPROXY_*` environment variables.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use svcproxy_networking::{IpFamily, IpPrefix};
use svcproxy_reconcile::{
    SchedulerConfig, DEFAULT_BURST_SYNCS, DEFAULT_MIN_SYNC_PERIOD, DEFAULT_STALE_GRACE,
    DEFAULT_SYNC_PERIOD,
};

use crate::conntrack::DEFAULT_CONNTRACK_BINARY;
use crate::proxier::{ProxierConfig, DEFAULT_MASQUERADE_BIT};
use crate::rules::DEFAULT_TABLE;

/// Which rule backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The `nft` command line tool.
    Nft,
    /// In-process table, nothing touches the kernel.
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nft" | "nftables" => Ok(Self::Nft),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown backend {:?} (expected nft or memory)", other),
        }
    }
}

/// Proxy daemon configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of this node; events for other nodes are ignored.
    pub hostname: String,

    pub ip_family: IpFamily,

    /// Maximum time between sync passes, also the retry delay after a
    /// failed pass.
    pub sync_period: Duration,

    /// Minimum spacing between passes once the burst is spent.
    pub min_sync_period: Duration,

    pub burst_syncs: u32,

    pub masquerade_all: bool,

    /// Bit of the packet mark used to flag traffic for masquerading.
    pub masquerade_bit: u32,

    pub cluster_cidr: Option<IpPrefix>,

    pub node_ip: Option<IpAddr>,

    /// Addresses that accept node-port traffic (empty: all local addresses).
    pub node_port_addresses: Vec<IpPrefix>,

    pub conntrack_tcp_liberal: bool,

    /// Grace window between flushing a stale chain and deleting it.
    pub stale_grace: Duration,

    pub backend: BackendKind,

    pub table: String,

    pub nft_binary: String,

    pub conntrack_binary: String,

    /// Read watch events from this file instead of stdin.
    pub event_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let hostname = lookup("SVCPROXY_HOSTNAME")
            .or_else(|| lookup("HOSTNAME"))
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .context("Missing node name. Set SVCPROXY_HOSTNAME.")?;

        let ip_family: IpFamily = lookup("SVCPROXY_IP_FAMILY")
            .map(|v| v.parse())
            .transpose()
            .context("SVCPROXY_IP_FAMILY must be ipv4 or ipv6.")?
            .unwrap_or(IpFamily::Ipv4);

        let sync_period = lookup("SVCPROXY_SYNC_PERIOD_MS")
            .map(|v| v.parse().map(Duration::from_millis))
            .transpose()
            .context("SVCPROXY_SYNC_PERIOD_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_SYNC_PERIOD);

        let min_sync_period = lookup("SVCPROXY_MIN_SYNC_PERIOD_MS")
            .map(|v| v.parse().map(Duration::from_millis))
            .transpose()
            .context("SVCPROXY_MIN_SYNC_PERIOD_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_MIN_SYNC_PERIOD);

        let burst_syncs: u32 = lookup("SVCPROXY_BURST_SYNCS")
            .map(|v| v.parse())
            .transpose()
            .context("SVCPROXY_BURST_SYNCS must be an integer.")?
            .unwrap_or(DEFAULT_BURST_SYNCS)
            .max(1);

        let masquerade_all = flag(&lookup, "SVCPROXY_MASQUERADE_ALL");

        let masquerade_bit: u32 = lookup("SVCPROXY_MASQUERADE_BIT")
            .map(|v| v.parse())
            .transpose()
            .context("SVCPROXY_MASQUERADE_BIT must be an integer.")?
            .unwrap_or(DEFAULT_MASQUERADE_BIT);
        if masquerade_bit > 31 {
            bail!("SVCPROXY_MASQUERADE_BIT must be between 0 and 31, got {}", masquerade_bit);
        }

        let cluster_cidr: Option<IpPrefix> = lookup("SVCPROXY_CLUSTER_CIDR")
            .filter(|v| !v.is_empty())
            .map(|v| v.parse())
            .transpose()
            .context("SVCPROXY_CLUSTER_CIDR must be a CIDR (example: 10.244.0.0/16).")?;
        if let Some(cidr) = cluster_cidr {
            if cidr.family() != ip_family {
                bail!("SVCPROXY_CLUSTER_CIDR {} is not an {} prefix", cidr, ip_family);
            }
        }

        let node_ip: Option<IpAddr> = lookup("SVCPROXY_NODE_IP")
            .filter(|v| !v.is_empty())
            .map(|v| v.parse())
            .transpose()
            .context("SVCPROXY_NODE_IP must be an IP address.")?;

        let node_port_addresses = lookup("SVCPROXY_NODE_PORT_ADDRESSES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(IpPrefix::from_cidr)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .context("SVCPROXY_NODE_PORT_ADDRESSES must be a comma-separated list of CIDRs.")?
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.family() == ip_family)
            .collect();

        let conntrack_tcp_liberal = flag(&lookup, "SVCPROXY_CONNTRACK_TCP_LIBERAL");

        let stale_grace = lookup("SVCPROXY_STALE_GRACE_MS")
            .map(|v| v.parse().map(Duration::from_millis))
            .transpose()
            .context("SVCPROXY_STALE_GRACE_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_STALE_GRACE);

        let backend = lookup("SVCPROXY_BACKEND")
            .map(|v| v.parse())
            .transpose()
            .context("SVCPROXY_BACKEND is invalid.")?
            .unwrap_or(BackendKind::Nft);

        let table = lookup("SVCPROXY_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string());

        let nft_binary = lookup("SVCPROXY_NFT_BINARY")
            .unwrap_or_else(|| crate::backend::nft::DEFAULT_NFT_BINARY.to_string());

        let conntrack_binary = lookup("SVCPROXY_CONNTRACK_BINARY")
            .unwrap_or_else(|| DEFAULT_CONNTRACK_BINARY.to_string());

        let event_file = lookup("SVCPROXY_EVENT_FILE")
            .filter(|v| !v.is_empty() && v != "-")
            .map(PathBuf::from);

        let log_level = lookup("SVCPROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            hostname,
            ip_family,
            sync_period,
            min_sync_period,
            burst_syncs,
            masquerade_all,
            masquerade_bit,
            cluster_cidr,
            node_ip,
            node_port_addresses,
            conntrack_tcp_liberal,
            stale_grace,
            backend,
            table,
            nft_binary,
            conntrack_binary,
            event_file,
            log_level,
        })
    }

    pub fn proxier_config(&self) -> ProxierConfig {
        ProxierConfig {
            hostname: self.hostname.clone(),
            family: self.ip_family,
            table: self.table.clone(),
            masquerade_all: self.masquerade_all,
            masquerade_mark: 1 << self.masquerade_bit,
            cluster_cidr: self.cluster_cidr,
            node_ip: self.node_ip,
            node_port_addresses: self.node_port_addresses.clone(),
            conntrack_tcp_liberal: self.conntrack_tcp_liberal,
            sync_period: self.sync_period,
            stale_grace: self.stale_grace,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            name: "sync-proxy-rules".to_string(),
            min_interval: self.min_sync_period,
            max_interval: self.sync_period,
            burst: self.burst_syncs,
        }
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("SVCPROXY_HOSTNAME", "Node-A")]).unwrap();
        assert_eq!(config.hostname, "node-a");
        assert_eq!(config.ip_family, IpFamily::Ipv4);
        assert_eq!(config.sync_period, DEFAULT_SYNC_PERIOD);
        assert_eq!(config.burst_syncs, DEFAULT_BURST_SYNCS);
        assert_eq!(config.backend, BackendKind::Nft);
        assert_eq!(config.table, DEFAULT_TABLE);
        assert!(config.event_file.is_none());

        let proxier = config.proxier_config();
        assert_eq!(proxier.masquerade_mark, 0x4000);
    }

    #[test]
    fn test_hostname_required() {
        assert!(load(&[]).is_err());
        assert_eq!(load(&[("HOSTNAME", "box")]).unwrap().hostname, "box");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SVCPROXY_HOSTNAME", "node-b"),
            ("SVCPROXY_IP_FAMILY", "ipv6"),
            ("SVCPROXY_SYNC_PERIOD_MS", "5000"),
            ("SVCPROXY_MIN_SYNC_PERIOD_MS", "250"),
            ("SVCPROXY_BURST_SYNCS", "0"),
            ("SVCPROXY_MASQUERADE_ALL", "TRUE"),
            ("SVCPROXY_MASQUERADE_BIT", "3"),
            ("SVCPROXY_CLUSTER_CIDR", "fd00:10::/48"),
            ("SVCPROXY_NODE_PORT_ADDRESSES", "fd00::/64, 10.0.0.0/8"),
            ("SVCPROXY_BACKEND", "memory"),
            ("SVCPROXY_EVENT_FILE", "/tmp/events.ndjson"),
        ])
        .unwrap();

        assert_eq!(config.ip_family, IpFamily::Ipv6);
        assert_eq!(config.sync_period, Duration::from_secs(5));
        assert_eq!(config.burst_syncs, 1);
        assert!(config.masquerade_all);
        assert_eq!(config.node_port_addresses.len(), 1);
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.event_file, Some(PathBuf::from("/tmp/events.ndjson")));
        assert_eq!(config.proxier_config().masquerade_mark, 8);

        let sched = config.scheduler_config();
        assert_eq!(sched.min_interval, Duration::from_millis(250));
        assert!(sched.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let base = ("SVCPROXY_HOSTNAME", "node-a");
        assert!(load(&[base, ("SVCPROXY_SYNC_PERIOD_MS", "soon")]).is_err());
        assert!(load(&[base, ("SVCPROXY_MASQUERADE_BIT", "32")]).is_err());
        assert!(load(&[base, ("SVCPROXY_CLUSTER_CIDR", "fd00::/64")]).is_err());
        assert!(load(&[base, ("SVCPROXY_BACKEND", "iptables")]).is_err());
        assert!(load(&[base, ("SVCPROXY_IP_FAMILY", "ipx")]).is_err());
    }
}
