//! Endpoint state and endpoint change tracking.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use svcproxy_api::{
    AddressType, EndpointSlice, NamespacedName, Protocol, ANNOTATION_LAST_CHANGE_TRIGGER_TIME,
};
use svcproxy_networking::IpFamily;
use tracing::{debug, warn};

use crate::metrics as m;
use crate::service::ServicePortName;
use crate::slice_cache::{EndpointSliceCache, EndpointsChange, PortEndpoints};

/// One backend of a service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub addr: SocketAddr,
    /// Fully healthy.
    pub ready: bool,
    /// Accepting traffic, possibly while terminating.
    pub serving: bool,
    pub terminating: bool,
    /// Runs on this node.
    pub is_local: bool,
    /// Zones this endpoint is hinted for; None when the slice carries no
    /// hints.
    pub zone_hints: Option<BTreeSet<String>>,
    pub topology: BTreeMap<String, String>,
    pub chain_name: String,
    pub affinity_set: String,
}

impl EndpointInfo {
    /// Usable only while draining.
    pub fn serving_terminating(&self) -> bool {
        self.serving && self.terminating
    }
}

impl std::fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

// ============================================================================
// Change tracking
// ============================================================================

#[derive(Debug)]
struct TrackerState {
    cache: EndpointSliceCache,
    trigger_times: BTreeMap<NamespacedName, Vec<DateTime<Utc>>>,
}

/// Pending endpoint-slice changes.
#[derive(Debug)]
pub struct EndpointsChangeTracker {
    family: IpFamily,
    started_at: DateTime<Utc>,
    state: Mutex<TrackerState>,
}

impl EndpointsChangeTracker {
    pub fn new(hostname: &str, family: IpFamily) -> Self {
        Self::with_start_time(hostname, family, Utc::now())
    }

    /// Trigger times before `started_at` belong to changes made before the
    /// proxy started and are not recorded.
    pub fn with_start_time(hostname: &str, family: IpFamily, started_at: DateTime<Utc>) -> Self {
        Self {
            family,
            started_at,
            state: Mutex::new(TrackerState {
                cache: EndpointSliceCache::new(hostname),
                trigger_times: BTreeMap::new(),
            }),
        }
    }

    /// Stage a slice add/update, or its removal. Returns true if the
    /// service's endpoints may have changed.
    pub fn endpoint_slice_update(&self, slice: &EndpointSlice, remove: bool) -> bool {
        let slice_family = match slice.address_type {
            AddressType::Ipv4 => IpFamily::Ipv4,
            AddressType::Ipv6 => IpFamily::Ipv6,
            AddressType::Fqdn => {
                warn!(
                    namespace = %slice.metadata.namespace,
                    slice = %slice.metadata.name,
                    "Ignoring endpoint slice with unsupported address type"
                );
                return false;
            }
        };
        if slice_family != self.family {
            debug!(
                namespace = %slice.metadata.namespace,
                slice = %slice.metadata.name,
                address_type = ?slice.address_type,
                "Ignoring endpoint slice of the other IP family"
            );
            return false;
        }

        let Some(service_name) = slice.service_name() else {
            warn!(
                namespace = %slice.metadata.namespace,
                slice = %slice.metadata.name,
                "Ignoring endpoint slice with no service name label"
            );
            return false;
        };
        let service = NamespacedName::new(&slice.metadata.namespace, service_name);

        let mut state = self.state.lock();
        let changed = state.cache.update_pending(service.clone(), slice, remove);
        if changed {
            metrics::counter!(m::ENDPOINT_CHANGES_TOTAL).increment(1);

            if remove {
                state.trigger_times.remove(&service);
            } else if let Some(t) = self.trigger_time(slice) {
                state.trigger_times.entry(service).or_default().push(t);
            }
        }
        metrics::gauge!(m::ENDPOINT_CHANGES_PENDING)
            .set(state.cache.pending_services().len() as f64);

        changed
    }

    fn trigger_time(&self, slice: &EndpointSlice) -> Option<DateTime<Utc>> {
        let raw = slice
            .metadata
            .annotations
            .get(ANNOTATION_LAST_CHANGE_TRIGGER_TIME)?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => {
                let t = t.with_timezone(&Utc);
                (t >= self.started_at).then_some(t)
            }
            Err(e) => {
                warn!(
                    slice = %slice.metadata.name,
                    value = %raw,
                    error = %e,
                    "Ignoring unparseable trigger time annotation"
                );
                None
            }
        }
    }

    /// Take all pending endpoint changes.
    pub fn checkout_changes(&self) -> BTreeMap<NamespacedName, EndpointsChange> {
        let mut state = self.state.lock();
        let changes = state.cache.checkout_changes();
        metrics::gauge!(m::ENDPOINT_CHANGES_PENDING).set(0.0);
        changes
    }

    /// Take the trigger times recorded since the last call.
    pub fn checkout_trigger_times(&self) -> BTreeMap<NamespacedName, Vec<DateTime<Utc>>> {
        std::mem::take(&mut self.state.lock().trigger_times)
    }

    /// Services with staged slice changes.
    pub fn pending_changes(&self) -> BTreeSet<NamespacedName> {
        self.state.lock().cache.pending_services()
    }
}

// ============================================================================
// Materialized map
// ============================================================================

/// A UDP endpoint whose conntrack entries must go.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaleUdpEndpoint {
    pub service: ServicePortName,
    pub endpoint: SocketAddr,
}

/// Result of applying pending endpoint changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateEndpointsMapResult {
    pub updated_services: BTreeSet<NamespacedName>,
    /// UDP endpoints that stopped serving.
    pub deleted_udp_endpoints: Vec<StaleUdpEndpoint>,
    /// UDP service ports that went from no serving endpoints to some.
    pub newly_active_udp_services: Vec<ServicePortName>,
    pub last_change_trigger_times: BTreeMap<NamespacedName, Vec<DateTime<Utc>>>,
}

/// Current endpoints of every service port.
#[derive(Debug, Clone, Default)]
pub struct EndpointsMap(BTreeMap<ServicePortName, Vec<EndpointInfo>>);

impl EndpointsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every pending change from the tracker.
    pub fn update(&mut self, tracker: &EndpointsChangeTracker) -> UpdateEndpointsMapResult {
        let mut result = UpdateEndpointsMapResult::default();

        for (service, change) in tracker.checkout_changes() {
            for name in change.previous.keys() {
                self.0.remove(name);
            }
            for (name, eps) in &change.current {
                self.0.insert(name.clone(), eps.clone());
            }

            detect_stale_conntrack_entries(
                &change.previous,
                &change.current,
                &mut result.deleted_udp_endpoints,
                &mut result.newly_active_udp_services,
            );
            result.updated_services.insert(service);
        }
        result.last_change_trigger_times = tracker.checkout_trigger_times();

        result
    }

    pub fn get(&self, name: &ServicePortName) -> Option<&[EndpointInfo]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServicePortName, &Vec<EndpointInfo>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct local ready endpoint IPs per service.
    pub fn local_ready_endpoints(&self) -> BTreeMap<NamespacedName, usize> {
        let mut ips: BTreeMap<NamespacedName, BTreeSet<std::net::IpAddr>> = BTreeMap::new();
        for (name, eps) in &self.0 {
            for ep in eps.iter().filter(|e| e.is_local && e.ready) {
                ips.entry(name.namespaced_name())
                    .or_default()
                    .insert(ep.addr.ip());
            }
        }
        ips.into_iter().map(|(svc, set)| (svc, set.len())).collect()
    }
}

/// Single-step diff of a service's UDP endpoints.
///
/// An endpoint serving before and not serving (or gone) after is stale. A
/// port with no serving endpoints before and some after is newly active.
pub fn detect_stale_conntrack_entries(
    previous: &PortEndpoints,
    current: &PortEndpoints,
    deleted: &mut Vec<StaleUdpEndpoint>,
    newly_active: &mut Vec<ServicePortName>,
) {
    for (name, old_eps) in previous {
        if name.protocol != Protocol::Udp {
            continue;
        }
        let new_eps = current.get(name).map(Vec::as_slice).unwrap_or_default();

        for old in old_eps.iter().filter(|e| e.serving) {
            let still_serving = new_eps.iter().any(|e| e.addr == old.addr && e.serving);
            if !still_serving {
                deleted.push(StaleUdpEndpoint {
                    service: name.clone(),
                    endpoint: old.addr,
                });
            }
        }
    }

    for (name, new_eps) in current {
        if name.protocol != Protocol::Udp {
            continue;
        }
        let serving_before = previous
            .get(name)
            .is_some_and(|eps| eps.iter().any(|e| e.serving));
        let serving_now = new_eps.iter().any(|e| e.serving);
        if !serving_before && serving_now {
            newly_active.push(name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcproxy_testing::{EndpointBuilder, SliceBuilder, TEST_HOSTNAME};

    fn dns() -> ServicePortName {
        ServicePortName::new("ns1", "dns", "dns", Protocol::Udp)
    }

    fn dns_slice(endpoints: &[EndpointBuilder]) -> EndpointSlice {
        endpoints
            .iter()
            .fold(
                SliceBuilder::new("ns1", "dns", "dns-1").port("dns", Protocol::Udp, 53),
                |b, ep| b.with(ep.clone()),
            )
            .build()
    }

    fn tracker() -> EndpointsChangeTracker {
        EndpointsChangeTracker::new(TEST_HOSTNAME, IpFamily::Ipv4)
    }

    #[test]
    fn test_fqdn_and_other_family_are_rejected() {
        let t = tracker();
        let fqdn = SliceBuilder::new("ns1", "web", "web-1")
            .address_type(AddressType::Fqdn)
            .build();
        assert!(!t.endpoint_slice_update(&fqdn, false));

        let v6 = SliceBuilder::new("ns1", "web", "web-1")
            .address_type(AddressType::Ipv6)
            .port("http", Protocol::Tcp, 80)
            .endpoint("fd00::1")
            .build();
        assert!(!t.endpoint_slice_update(&v6, false));
        assert!(t.pending_changes().is_empty());
    }

    #[test]
    fn test_slice_without_service_label_is_rejected() {
        let t = tracker();
        let mut slice = dns_slice(&[EndpointBuilder::new("10.1.0.1")]);
        slice.metadata.labels.clear();
        assert!(!t.endpoint_slice_update(&slice, false));
    }

    #[test]
    fn test_udp_endpoint_loss_reported_once() {
        let t = tracker();
        let mut map = EndpointsMap::new();

        t.endpoint_slice_update(
            &dns_slice(&[EndpointBuilder::new("10.1.0.1"), EndpointBuilder::new("10.1.0.2")]),
            false,
        );
        let first = map.update(&t);
        assert_eq!(first.newly_active_udp_services, vec![dns()]);
        assert!(first.deleted_udp_endpoints.is_empty());

        t.endpoint_slice_update(&dns_slice(&[EndpointBuilder::new("10.1.0.2")]), false);
        let second = map.update(&t);
        assert_eq!(
            second.deleted_udp_endpoints,
            vec![StaleUdpEndpoint {
                service: dns(),
                endpoint: "10.1.0.1:53".parse().unwrap(),
            }]
        );
        assert!(second.newly_active_udp_services.is_empty());

        let third = map.update(&t);
        assert!(third.deleted_udp_endpoints.is_empty());
        assert!(third.updated_services.is_empty());
    }

    #[test]
    fn test_endpoint_that_stops_serving_is_stale() {
        let t = tracker();
        let mut map = EndpointsMap::new();

        t.endpoint_slice_update(&dns_slice(&[EndpointBuilder::new("10.1.0.1")]), false);
        map.update(&t);

        t.endpoint_slice_update(&dns_slice(&[EndpointBuilder::new("10.1.0.1").gone()]), false);
        let result = map.update(&t);
        assert_eq!(result.deleted_udp_endpoints.len(), 1);
    }

    #[test]
    fn test_terminating_serving_endpoint_is_not_stale() {
        let t = tracker();
        let mut map = EndpointsMap::new();

        t.endpoint_slice_update(&dns_slice(&[EndpointBuilder::new("10.1.0.1")]), false);
        map.update(&t);

        t.endpoint_slice_update(
            &dns_slice(&[EndpointBuilder::new("10.1.0.1").terminating()]),
            false,
        );
        let result = map.update(&t);
        assert!(result.deleted_udp_endpoints.is_empty());
        assert_eq!(result.updated_services.len(), 1);
    }

    #[test]
    fn test_zero_to_one_is_newly_active() {
        let t = tracker();
        let mut map = EndpointsMap::new();

        t.endpoint_slice_update(&dns_slice(&[EndpointBuilder::new("10.1.0.1").not_ready()]), false);
        assert!(map.update(&t).newly_active_udp_services.is_empty());

        t.endpoint_slice_update(&dns_slice(&[EndpointBuilder::new("10.1.0.1")]), false);
        let result = map.update(&t);
        assert_eq!(result.newly_active_udp_services, vec![dns()]);
    }

    #[test]
    fn test_tcp_is_never_reported() {
        let t = tracker();
        let mut map = EndpointsMap::new();
        let slice = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 80)
            .endpoint("10.1.0.1")
            .build();

        t.endpoint_slice_update(&slice, false);
        map.update(&t);
        t.endpoint_slice_update(&slice, true);
        let result = map.update(&t);

        assert!(result.deleted_udp_endpoints.is_empty());
        assert!(result.newly_active_udp_services.is_empty());
        assert!(map.is_empty());
    }

    #[test]
    fn test_trigger_times() {
        let start = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t = EndpointsChangeTracker::with_start_time(TEST_HOSTNAME, IpFamily::Ipv4, start);

        let old = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 80)
            .endpoint("10.1.0.1")
            .trigger_time("2025-12-31T23:59:00Z")
            .build();
        t.endpoint_slice_update(&old, false);
        assert!(t.checkout_trigger_times().is_empty());

        let new = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 80)
            .endpoint("10.1.0.2")
            .trigger_time("2026-01-01T00:00:05Z")
            .build();
        t.endpoint_slice_update(&new, false);
        let times = t.checkout_trigger_times();
        assert_eq!(times[&NamespacedName::new("ns1", "web")].len(), 1);

        t.endpoint_slice_update(&old, false);
        t.endpoint_slice_update(&old, true);
        assert!(t.checkout_trigger_times().is_empty());
    }

    #[test]
    fn test_local_ready_endpoints_counts_distinct_ips() {
        let t = tracker();
        let mut map = EndpointsMap::new();
        let slice = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 80)
            .port("https", Protocol::Tcp, 443)
            .with(EndpointBuilder::new("10.1.0.1").local())
            .with(EndpointBuilder::new("10.1.0.2").node("node-b"))
            .build();
        t.endpoint_slice_update(&slice, false);
        map.update(&t);

        let counts = map.local_ready_endpoints();
        assert_eq!(counts[&NamespacedName::new("ns1", "web")], 1);
    }
}
