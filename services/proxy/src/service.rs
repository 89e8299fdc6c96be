//! Service port state and service change tracking.
//!
//! Watch callbacks feed [`ServiceChangeTracker::update`], which keeps one
//! `(previous, current)` delta per service. A sync pass moves the deltas
//! into the [`ServicePortMap`] with [`ServicePortMap::update`].

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use parking_lot::Mutex;
use svcproxy_api::{
    NamespacedName, Protocol, Service, SessionAffinity, TrafficPolicy, ANNOTATION_TOPOLOGY_MODE,
    DEFAULT_AFFINITY_TIMEOUT_SECONDS,
};
use svcproxy_networking::{service_port_chain_base, IpFamily, IpPrefix};
use tracing::{debug, error};

use crate::metrics as m;
use crate::rules::{
    EXTERNAL_CHAIN_PREFIX, FIREWALL_CHAIN_PREFIX, LOCAL_CHAIN_PREFIX, SERVICE_CHAIN_PREFIX,
};

/// Identity of one service port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortName {
    pub namespace: String,
    pub name: String,
    /// Port name; empty for unnamed ports.
    pub port: String,
    pub protocol: Protocol,
}

impl ServicePortName {
    pub fn new(namespace: &str, name: &str, port: &str, protocol: Protocol) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port: port.to_string(),
            protocol,
        }
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }
}

impl std::fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.port.is_empty() {
            write!(f, "{}/{}", self.namespace, self.name)
        } else {
            write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
        }
    }
}

/// Chain names derived once per service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceChains {
    pub cluster_policy: String,
    pub local_policy: String,
    pub external: String,
    pub firewall: String,
}

impl ServiceChains {
    fn for_port(name: &ServicePortName) -> Self {
        let base = service_port_chain_base(
            &name.namespace,
            &name.name,
            name.protocol.as_str(),
            &name.port,
        );
        Self {
            cluster_policy: format!("{}{}", SERVICE_CHAIN_PREFIX, base),
            local_policy: format!("{}{}", LOCAL_CHAIN_PREFIX, base),
            external: format!("{}{}", EXTERNAL_CHAIN_PREFIX, base),
            firewall: format!("{}{}", FIREWALL_CHAIN_PREFIX, base),
        }
    }
}

/// Everything the rule writer needs to know about one service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortInfo {
    pub name: ServicePortName,
    pub cluster_ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub node_port: Option<u16>,
    pub external_ips: Vec<IpAddr>,
    pub load_balancer_ips: Vec<IpAddr>,
    pub load_balancer_source_ranges: Vec<IpPrefix>,
    pub internal_policy: TrafficPolicy,
    pub external_policy: TrafficPolicy,
    /// Affinity timeout when ClientIP affinity is on.
    pub affinity_timeout_seconds: Option<u32>,
    pub topology_keys: Vec<String>,
    /// Topology-aware hints requested via annotation.
    pub hints_enabled: bool,
    pub health_check_node_port: Option<u16>,
    pub chains: ServiceChains,
}

impl ServicePortInfo {
    /// Reachable via node port, external IP or load-balancer IP.
    pub fn externally_accessible(&self) -> bool {
        self.node_port.is_some()
            || !self.external_ips.is_empty()
            || !self.load_balancer_ips.is_empty()
    }

    pub fn internal_policy_local(&self) -> bool {
        self.internal_policy == TrafficPolicy::Local
    }

    pub fn external_policy_local(&self) -> bool {
        self.externally_accessible() && self.external_policy == TrafficPolicy::Local
    }

    /// Cluster-wide endpoints are needed for Cluster internal policy, and for
    /// any externally reachable port (pod and host traffic to external
    /// addresses short-circuits to them even under Local policy).
    pub fn uses_cluster_endpoints(&self) -> bool {
        !self.internal_policy_local() || self.externally_accessible()
    }

    pub fn uses_local_endpoints(&self) -> bool {
        self.internal_policy_local() || self.external_policy_local()
    }
}

/// Split a service into its ports for one IP family.
///
/// Skipped services and services of the other family produce an empty map.
pub fn service_to_port_map(
    svc: Option<&Service>,
    family: IpFamily,
) -> BTreeMap<ServicePortName, ServicePortInfo> {
    let mut ports = BTreeMap::new();
    let Some(svc) = svc else {
        return ports;
    };
    if svc.should_skip() {
        return ports;
    }

    let meta = &svc.metadata;
    let spec = &svc.spec;

    let Some(cluster_ip) = spec
        .cluster_ip
        .as_deref()
        .and_then(|ip| ip.parse::<IpAddr>().ok())
    else {
        debug!(service = %svc.namespaced_name(), "Service has unparseable cluster IP, skipping");
        return ports;
    };
    if !family.matches(&cluster_ip) {
        return ports;
    }

    let external_ips = parse_family_ips(&spec.external_ips, family);
    let load_balancer_ips = parse_family_ips(&svc.status.load_balancer_ingress, family);

    let mut load_balancer_source_ranges = Vec::new();
    for cidr in &spec.load_balancer_source_ranges {
        match IpPrefix::from_cidr(cidr) {
            Ok(prefix) if prefix.family() == family => load_balancer_source_ranges.push(prefix),
            Ok(_) => {}
            Err(e) => {
                error!(
                    service = %svc.namespaced_name(),
                    cidr = %cidr,
                    error = %e,
                    "Error parsing CIDR in load balancer source ranges, dropping it"
                );
            }
        }
    }

    let affinity_timeout_seconds = match spec.session_affinity {
        SessionAffinity::ClientIp => Some(
            spec.session_affinity_timeout_seconds
                .unwrap_or(DEFAULT_AFFINITY_TIMEOUT_SECONDS),
        ),
        SessionAffinity::None => None,
    };

    let hints_enabled = meta
        .annotations
        .get(ANNOTATION_TOPOLOGY_MODE)
        .is_some_and(|v| v.eq_ignore_ascii_case("auto"));

    for port in &spec.ports {
        let name = ServicePortName::new(&meta.namespace, &meta.name, &port.name, port.protocol);
        let info = ServicePortInfo {
            chains: ServiceChains::for_port(&name),
            name: name.clone(),
            cluster_ip,
            port: port.port,
            protocol: port.protocol,
            node_port: port.node_port.filter(|p| *p != 0),
            external_ips: external_ips.clone(),
            load_balancer_ips: load_balancer_ips.clone(),
            load_balancer_source_ranges: load_balancer_source_ranges.clone(),
            internal_policy: spec.internal_traffic_policy.unwrap_or_default(),
            external_policy: spec.external_traffic_policy.unwrap_or_default(),
            affinity_timeout_seconds,
            topology_keys: spec.topology_keys.clone(),
            hints_enabled,
            health_check_node_port: spec.health_check_node_port,
        };
        ports.insert(name, info);
    }

    ports
}

fn parse_family_ips(raw: &[String], family: IpFamily) -> Vec<IpAddr> {
    raw.iter()
        .filter_map(|s| s.parse::<IpAddr>().ok())
        .filter(|ip| family.matches(ip))
        .collect()
}

// ============================================================================
// Change tracking
// ============================================================================

/// Accumulated change for one service between two checkouts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceChange {
    pub previous: BTreeMap<ServicePortName, ServicePortInfo>,
    pub current: BTreeMap<ServicePortName, ServicePortInfo>,
}

/// Pending service deltas, keyed by service.
#[derive(Debug)]
pub struct ServiceChangeTracker {
    family: IpFamily,
    items: Mutex<BTreeMap<NamespacedName, ServiceChange>>,
}

impl ServiceChangeTracker {
    pub fn new(family: IpFamily) -> Self {
        Self {
            family,
            items: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a service add (`old` is None), update, or delete (`new` is
    /// None).
    ///
    /// Returns true if this service still has a pending delta afterwards. A
    /// delete of an unknown service or an identical replace returns false.
    pub fn update(&self, old: Option<&Service>, new: Option<&Service>) -> bool {
        let Some(svc) = new.or(old) else {
            return false;
        };
        let key = svc.namespaced_name();

        let mut items = self.items.lock();
        let change = items.entry(key.clone()).or_insert_with(|| ServiceChange {
            previous: service_to_port_map(old, self.family),
            current: BTreeMap::new(),
        });
        change.current = service_to_port_map(new, self.family);

        if change.previous == change.current {
            items.remove(&key);
        } else {
            metrics::counter!(m::SERVICE_CHANGES_TOTAL).increment(1);
        }
        metrics::gauge!(m::SERVICE_CHANGES_PENDING).set(items.len() as f64);

        items.contains_key(&key)
    }

    /// Take all pending deltas.
    pub fn checkout(&self) -> BTreeMap<NamespacedName, ServiceChange> {
        let mut items = self.items.lock();
        let changes = std::mem::take(&mut *items);
        metrics::gauge!(m::SERVICE_CHANGES_PENDING).set(0.0);
        changes
    }

    /// Number of services with a pending delta.
    pub fn pending(&self) -> usize {
        self.items.lock().len()
    }
}

// ============================================================================
// Materialized map
// ============================================================================

/// Result of applying pending service deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateServiceMapResult {
    /// Services whose ports changed.
    pub updated_services: BTreeSet<NamespacedName>,
    /// Cluster IPs of UDP ports that no longer exist.
    pub deleted_udp_cluster_ips: BTreeSet<IpAddr>,
}

/// Current service ports.
#[derive(Debug, Clone, Default)]
pub struct ServicePortMap(BTreeMap<ServicePortName, ServicePortInfo>);

impl ServicePortMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every pending delta from the tracker.
    pub fn update(&mut self, tracker: &ServiceChangeTracker) -> UpdateServiceMapResult {
        let mut result = UpdateServiceMapResult::default();

        for (service, change) in tracker.checkout() {
            for (name, info) in change.previous {
                if change.current.contains_key(&name) {
                    continue;
                }
                debug!(service_port = %name, "Removing service port");
                self.0.remove(&name);
                if info.protocol == Protocol::Udp {
                    result.deleted_udp_cluster_ips.insert(info.cluster_ip);
                }
            }
            for (name, info) in change.current {
                self.0.insert(name, info);
            }
            result.updated_services.insert(service);
        }

        // A cluster IP still used by another UDP port keeps its entries.
        for info in self.0.values() {
            if info.protocol == Protocol::Udp {
                result.deleted_udp_cluster_ips.remove(&info.cluster_ip);
            }
        }

        result
    }

    pub fn get(&self, name: &ServicePortName) -> Option<&ServicePortInfo> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServicePortName, &ServicePortInfo)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Health-check node ports of services with Local external policy.
    pub fn health_check_node_ports(&self) -> BTreeMap<NamespacedName, u16> {
        self.0
            .values()
            .filter(|info| info.external_policy_local())
            .filter_map(|info| {
                info.health_check_node_port
                    .map(|port| (info.name.namespaced_name(), port))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcproxy_api::ServiceType;
    use svcproxy_testing::ServiceBuilder;

    fn web() -> Service {
        ServiceBuilder::new("ns1", "web")
            .cluster_ip("10.0.0.10")
            .port("http", Protocol::Tcp, 80)
            .port("dns", Protocol::Udp, 53)
            .build()
    }

    #[test]
    fn test_port_name_display() {
        let name = ServicePortName::new("ns1", "web", "http", Protocol::Tcp);
        assert_eq!(name.to_string(), "ns1/web:http");

        let unnamed = ServicePortName::new("ns1", "web", "", Protocol::Tcp);
        assert_eq!(unnamed.to_string(), "ns1/web");
    }

    #[test]
    fn test_service_to_port_map() {
        let ports = service_to_port_map(Some(&web()), IpFamily::Ipv4);
        assert_eq!(ports.len(), 2);

        let http = &ports[&ServicePortName::new("ns1", "web", "http", Protocol::Tcp)];
        assert_eq!(http.port, 80);
        assert!(http.chains.cluster_policy.starts_with("service-"));
        assert!(http.chains.cluster_policy.ends_with("-ns1/web/tcp/http"));
        assert!(!http.externally_accessible());
        assert!(http.uses_cluster_endpoints());
        assert!(!http.uses_local_endpoints());
    }

    #[test]
    fn test_other_family_and_headless_are_empty() {
        assert!(service_to_port_map(Some(&web()), IpFamily::Ipv6).is_empty());

        let headless = ServiceBuilder::new("ns1", "db")
            .cluster_ip("None")
            .port("pg", Protocol::Tcp, 5432)
            .build();
        assert!(service_to_port_map(Some(&headless), IpFamily::Ipv4).is_empty());
    }

    #[test]
    fn test_invalid_source_ranges_are_dropped() {
        let svc = ServiceBuilder::new("ns1", "lb")
            .cluster_ip("10.0.0.20")
            .port("http", Protocol::Tcp, 80)
            .load_balancer_ip("203.0.113.5")
            .source_range("192.168.0.0/16")
            .source_range("bogus")
            .build();

        let ports = service_to_port_map(Some(&svc), IpFamily::Ipv4);
        let info = ports.values().next().unwrap();
        assert_eq!(info.load_balancer_source_ranges.len(), 1);
        assert_eq!(info.load_balancer_ips.len(), 1);
        assert!(info.externally_accessible());
        assert_eq!(svc.spec.service_type, ServiceType::LoadBalancer);
    }

    #[test]
    fn test_external_policy_local_requires_external_access() {
        let svc = ServiceBuilder::new("ns1", "web")
            .cluster_ip("10.0.0.10")
            .port("http", Protocol::Tcp, 80)
            .external_policy(TrafficPolicy::Local)
            .build();
        let ports = service_to_port_map(Some(&svc), IpFamily::Ipv4);
        let info = ports.values().next().unwrap();
        assert!(!info.external_policy_local());
        assert!(!info.uses_local_endpoints());
    }

    #[test]
    fn test_tracker_no_op_changes() {
        let tracker = ServiceChangeTracker::new(IpFamily::Ipv4);

        // Deleting something never seen is not a change.
        assert!(!tracker.update(Some(&web()), None));
        // Replacing with an identical object is not a change.
        assert!(!tracker.update(Some(&web()), Some(&web())));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_tracker_no_op_reported_per_service() {
        let tracker = ServiceChangeTracker::new(IpFamily::Ipv4);
        let db = ServiceBuilder::new("ns1", "db")
            .cluster_ip("10.0.0.11")
            .port("pg", Protocol::Tcp, 5432)
            .build();
        let cache = ServiceBuilder::new("ns1", "cache")
            .cluster_ip("10.0.0.12")
            .port("redis", Protocol::Tcp, 6379)
            .build();

        assert!(tracker.update(None, Some(&web())));
        assert!(!tracker.update(Some(&db), Some(&db)));
        assert!(!tracker.update(Some(&cache), None));
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_tracker_add_then_delete_cancels() {
        let tracker = ServiceChangeTracker::new(IpFamily::Ipv4);

        assert!(tracker.update(None, Some(&web())));
        assert_eq!(tracker.pending(), 1);
        assert!(!tracker.update(Some(&web()), None));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_tracker_keeps_original_previous() {
        let tracker = ServiceChangeTracker::new(IpFamily::Ipv4);
        let v1 = web();
        let mut v2 = web();
        v2.spec.ports[0].port = 8080;
        let mut v3 = web();
        v3.spec.ports[0].port = 9090;

        assert!(tracker.update(Some(&v1), Some(&v2)));
        assert!(tracker.update(Some(&v2), Some(&v3)));

        let changes = tracker.checkout();
        assert_eq!(changes.len(), 1);
        let change = changes.values().next().unwrap();
        let http = ServicePortName::new("ns1", "web", "http", Protocol::Tcp);
        assert_eq!(change.previous[&http].port, 80);
        assert_eq!(change.current[&http].port, 9090);
    }

    #[test]
    fn test_checkout_is_exactly_once() {
        let tracker = ServiceChangeTracker::new(IpFamily::Ipv4);
        tracker.update(None, Some(&web()));

        assert_eq!(tracker.checkout().len(), 1);
        assert!(tracker.checkout().is_empty());
    }

    #[test]
    fn test_map_update_reports_deleted_udp_cluster_ips() {
        let tracker = ServiceChangeTracker::new(IpFamily::Ipv4);
        let mut map = ServicePortMap::new();

        tracker.update(None, Some(&web()));
        let result = map.update(&tracker);
        assert_eq!(map.len(), 2);
        assert!(result.deleted_udp_cluster_ips.is_empty());
        assert!(result
            .updated_services
            .contains(&NamespacedName::new("ns1", "web")));

        let mut tcp_only = web();
        tcp_only.spec.ports.retain(|p| p.protocol == Protocol::Tcp);
        tracker.update(Some(&web()), Some(&tcp_only));
        let result = map.update(&tracker);

        assert_eq!(map.len(), 1);
        let ip: IpAddr = "10.0.0.10".parse().unwrap();
        assert!(result.deleted_udp_cluster_ips.contains(&ip));
    }

    #[test]
    fn test_health_check_node_ports() {
        let svc = ServiceBuilder::new("ns1", "lb")
            .cluster_ip("10.0.0.20")
            .node_port("http", Protocol::Tcp, 80, 30080)
            .external_policy(TrafficPolicy::Local)
            .health_check_node_port(32000)
            .build();
        let tracker = ServiceChangeTracker::new(IpFamily::Ipv4);
        let mut map = ServicePortMap::new();
        tracker.update(None, Some(&svc));
        map.update(&tracker);

        let ports = map.health_check_node_ports();
        assert_eq!(ports.get(&NamespacedName::new("ns1", "lb")), Some(&32000));
    }
}
