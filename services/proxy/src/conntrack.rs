//! Conntrack invalidation for UDP services.
//!
//! UDP has no connection teardown, so conntrack keeps steering a client's
//! packets to a removed backend, or keeps a "no endpoint" entry alive after
//! a backend appears. After a successful sync the proxier plans the entries
//! to delete with [`plan_cleanup`] and runs them with [`execute_cleanup`].

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use svcproxy_api::Protocol;
use svcproxy_networking::IpFamily;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::endpoints::StaleUdpEndpoint;
use crate::metrics as m;
use crate::service::{ServicePortMap, ServicePortName};

/// Default conntrack binary.
pub const DEFAULT_CONNTRACK_BINARY: &str = "conntrack";

/// Errors from conntrack deletion.
#[derive(Debug, Error)]
pub enum ConntrackError {
    /// The binary could not be run.
    #[error("failed to run conntrack: {0}")]
    Command(#[from] std::io::Error),

    /// The binary ran and reported an error.
    #[error("conntrack {args} failed: {stderr}")]
    Failed { args: String, stderr: String },
}

/// Deletes conntrack entries.
#[async_trait]
pub trait Conntrack: Send + Sync {
    /// Entries whose original destination is `ip`.
    async fn clear_entries_for_ip(&self, ip: IpAddr, protocol: Protocol)
        -> Result<(), ConntrackError>;

    /// Entries whose destination port is `port`.
    async fn clear_entries_for_port(
        &self,
        port: u16,
        family: IpFamily,
        protocol: Protocol,
    ) -> Result<(), ConntrackError>;

    /// Entries to `origin` that were translated to `dest`.
    async fn clear_entries_for_nat(
        &self,
        origin: IpAddr,
        dest: IpAddr,
        protocol: Protocol,
    ) -> Result<(), ConntrackError>;

    /// Entries to node port `port` that were translated to `dest`.
    async fn clear_entries_for_port_nat(
        &self,
        dest: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Result<(), ConntrackError>;
}

/// One planned deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConntrackOp {
    ClearIp {
        ip: IpAddr,
        protocol: Protocol,
    },
    ClearPort {
        port: u16,
        family: IpFamily,
        protocol: Protocol,
    },
    ClearNat {
        origin: IpAddr,
        dest: IpAddr,
        protocol: Protocol,
    },
    ClearPortNat {
        dest: IpAddr,
        port: u16,
        protocol: Protocol,
    },
}

/// UDP conntrack work accumulated by sync passes and not yet executed.
///
/// A pass whose transaction fails keeps its work here; it runs after the
/// next successful pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingCleanup {
    pub deleted_cluster_ips: BTreeSet<IpAddr>,
    pub newly_active: BTreeSet<ServicePortName>,
    pub stale_endpoints: BTreeSet<StaleUdpEndpoint>,
}

impl PendingCleanup {
    pub fn is_empty(&self) -> bool {
        self.deleted_cluster_ips.is_empty()
            && self.newly_active.is_empty()
            && self.stale_endpoints.is_empty()
    }
}

/// Resolve pending work into concrete deletions against the current
/// services.
///
/// - removed UDP cluster IPs: every entry to that IP
/// - newly active UDP services: every entry to their cluster, external and
///   load-balancer IPs and to their node port
/// - stale UDP endpoints of services that still exist: translated entries
///   from each service address (and node port) to the endpoint
pub fn plan_cleanup(
    pending: &PendingCleanup,
    services: &ServicePortMap,
    family: IpFamily,
) -> Vec<ConntrackOp> {
    let mut service_ips: BTreeSet<IpAddr> = pending.deleted_cluster_ips.clone();
    let mut node_ports: BTreeSet<u16> = BTreeSet::new();

    for name in &pending.newly_active {
        let Some(info) = services.get(name) else {
            continue;
        };
        service_ips.insert(info.cluster_ip);
        service_ips.extend(info.external_ips.iter().copied());
        service_ips.extend(info.load_balancer_ips.iter().copied());
        if let Some(port) = info.node_port {
            node_ports.insert(port);
        }
    }

    let mut ops: Vec<ConntrackOp> = service_ips
        .into_iter()
        .map(|ip| ConntrackOp::ClearIp {
            ip,
            protocol: Protocol::Udp,
        })
        .collect();
    ops.extend(node_ports.into_iter().map(|port| ConntrackOp::ClearPort {
        port,
        family,
        protocol: Protocol::Udp,
    }));

    for stale in &pending.stale_endpoints {
        let Some(info) = services.get(&stale.service) else {
            debug!(service_port = %stale.service, endpoint = %stale.endpoint, "Service gone, skipping endpoint conntrack cleanup");
            continue;
        };
        let dest = stale.endpoint.ip();
        if let Some(port) = info.node_port {
            ops.push(ConntrackOp::ClearPortNat {
                dest,
                port,
                protocol: info.protocol,
            });
        }
        let origins = std::iter::once(info.cluster_ip)
            .chain(info.external_ips.iter().copied())
            .chain(info.load_balancer_ips.iter().copied());
        for origin in origins {
            ops.push(ConntrackOp::ClearNat {
                origin,
                dest,
                protocol: info.protocol,
            });
        }
    }

    ops
}

/// Run planned deletions. Failures are logged and counted; returns how many
/// failed.
pub async fn execute_cleanup(conntrack: &dyn Conntrack, ops: &[ConntrackOp]) -> usize {
    let mut failures = 0;
    for op in ops {
        let result = match *op {
            ConntrackOp::ClearIp { ip, protocol } => {
                conntrack.clear_entries_for_ip(ip, protocol).await
            }
            ConntrackOp::ClearPort {
                port,
                family,
                protocol,
            } => conntrack.clear_entries_for_port(port, family, protocol).await,
            ConntrackOp::ClearNat {
                origin,
                dest,
                protocol,
            } => conntrack.clear_entries_for_nat(origin, dest, protocol).await,
            ConntrackOp::ClearPortNat {
                dest,
                port,
                protocol,
            } => conntrack.clear_entries_for_port_nat(dest, port, protocol).await,
        };
        if let Err(e) = result {
            failures += 1;
            metrics::counter!(m::CONNTRACK_CLEANUP_FAILURES_TOTAL).increment(1);
            warn!(op = ?op, error = %e, "Failed to delete conntrack entries");
        }
    }
    failures
}

// ============================================================================
// CLI implementation
// ============================================================================

/// Deletes entries by running the `conntrack` tool.
#[derive(Debug, Clone)]
pub struct ConntrackCli {
    binary: String,
}

impl Default for ConntrackCli {
    fn default() -> Self {
        Self::new(DEFAULT_CONNTRACK_BINARY)
    }
}

impl ConntrackCli {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    async fn delete(&self, args: Vec<String>) -> Result<(), ConntrackError> {
        let output = Command::new(&self.binary)
            .arg("-D")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        // Exit status 1 with nothing deleted is not an error.
        if output.status.success() || stderr.contains("0 flow entries have been deleted") {
            debug!(args = %args.join(" "), "Deleted conntrack entries");
            return Ok(());
        }
        Err(ConntrackError::Failed {
            args: args.join(" "),
            stderr: stderr.trim().to_string(),
        })
    }
}

fn family_args(family: IpFamily) -> Vec<String> {
    match family {
        IpFamily::Ipv4 => Vec::new(),
        IpFamily::Ipv6 => vec!["-f".to_string(), "ipv6".to_string()],
    }
}

fn protocol_args(protocol: Protocol) -> Vec<String> {
    vec!["-p".to_string(), protocol.as_str().to_string()]
}

#[async_trait]
impl Conntrack for ConntrackCli {
    async fn clear_entries_for_ip(
        &self,
        ip: IpAddr,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        let mut args = vec!["--orig-dst".to_string(), ip.to_string()];
        args.extend(protocol_args(protocol));
        args.extend(family_args(IpFamily::of(&ip)));
        self.delete(args).await
    }

    async fn clear_entries_for_port(
        &self,
        port: u16,
        family: IpFamily,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        let mut args = protocol_args(protocol);
        args.extend(["--dport".to_string(), port.to_string()]);
        args.extend(family_args(family));
        self.delete(args).await
    }

    async fn clear_entries_for_nat(
        &self,
        origin: IpAddr,
        dest: IpAddr,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        let mut args = vec![
            "--orig-dst".to_string(),
            origin.to_string(),
            "--dst-nat".to_string(),
            dest.to_string(),
        ];
        args.extend(protocol_args(protocol));
        args.extend(family_args(IpFamily::of(&origin)));
        self.delete(args).await
    }

    async fn clear_entries_for_port_nat(
        &self,
        dest: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        let mut args = protocol_args(protocol);
        args.extend([
            "--dport".to_string(),
            port.to_string(),
            "--dst-nat".to_string(),
            dest.to_string(),
        ]);
        args.extend(family_args(IpFamily::of(&dest)));
        self.delete(args).await
    }
}

// ============================================================================
// Recording implementation
// ============================================================================

/// Records requested deletions instead of running them.
#[derive(Debug, Default)]
pub struct RecordingConntrack {
    ops: Mutex<Vec<ConntrackOp>>,
}

impl RecordingConntrack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the deletions recorded so far.
    pub fn take(&self) -> Vec<ConntrackOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    fn record(&self, op: ConntrackOp) -> Result<(), ConntrackError> {
        self.ops.lock().push(op);
        Ok(())
    }
}

#[async_trait]
impl Conntrack for RecordingConntrack {
    async fn clear_entries_for_ip(
        &self,
        ip: IpAddr,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        self.record(ConntrackOp::ClearIp { ip, protocol })
    }

    async fn clear_entries_for_port(
        &self,
        port: u16,
        family: IpFamily,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        self.record(ConntrackOp::ClearPort {
            port,
            family,
            protocol,
        })
    }

    async fn clear_entries_for_nat(
        &self,
        origin: IpAddr,
        dest: IpAddr,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        self.record(ConntrackOp::ClearNat {
            origin,
            dest,
            protocol,
        })
    }

    async fn clear_entries_for_port_nat(
        &self,
        dest: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        self.record(ConntrackOp::ClearPortNat {
            dest,
            port,
            protocol,
        })
    }
}
