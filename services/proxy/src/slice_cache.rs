//! Per-service cache of endpoint slices.
//!
//! A service's endpoints may be split across many slices. For each service
//! the cache keeps the slices last handed to a sync pass (`applied`) and the
//! changes received since (`pending`). Checking out folds pending into
//! applied and returns the merged endpoint lists before and after.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};

use svcproxy_api::{Endpoint, EndpointPort, EndpointSlice, NamespacedName, Protocol};
use svcproxy_networking::endpoint_chain_base;
use tracing::{debug, warn};

use crate::endpoints::EndpointInfo;
use crate::rules::{AFFINITY_SET_PREFIX, ENDPOINT_CHAIN_PREFIX};
use crate::service::ServicePortName;

/// Endpoints of every port of one service.
pub type PortEndpoints = BTreeMap<ServicePortName, Vec<EndpointInfo>>;

/// The parts of a slice that affect rules.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedSlice {
    ports: Vec<EndpointPort>,
    endpoints: Vec<Endpoint>,
    remove: bool,
}

impl CachedSlice {
    fn new(slice: &EndpointSlice, remove: bool) -> Self {
        Self {
            ports: slice.ports.clone(),
            endpoints: slice.endpoints.clone(),
            remove,
        }
    }
}

#[derive(Debug, Default)]
struct SliceTracker {
    applied: BTreeMap<String, CachedSlice>,
    pending: BTreeMap<String, CachedSlice>,
}

/// Endpoint changes of one service produced by a checkout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointsChange {
    pub previous: PortEndpoints,
    pub current: PortEndpoints,
}

#[derive(Debug)]
pub(crate) struct EndpointSliceCache {
    hostname: String,
    trackers: BTreeMap<NamespacedName, SliceTracker>,
}

impl EndpointSliceCache {
    pub(crate) fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            trackers: BTreeMap::new(),
        }
    }

    /// Stage a slice add/update (or removal). Returns true if it differs
    /// from what is already staged or applied.
    pub(crate) fn update_pending(
        &mut self,
        service: NamespacedName,
        slice: &EndpointSlice,
        remove: bool,
    ) -> bool {
        let info = CachedSlice::new(slice, remove);
        let slice_name = &slice.metadata.name;
        let tracker = self.trackers.entry(service).or_default();

        let changed = match (tracker.pending.get(slice_name), tracker.applied.get(slice_name)) {
            (Some(pending), _) => *pending != info,
            (None, Some(applied)) => *applied != info,
            // Removing a slice that was never seen changes nothing.
            (None, None) => !remove,
        };

        if changed {
            tracker.pending.insert(slice_name.clone(), info);
        }
        changed
    }

    /// Fold every pending slice into the applied set.
    pub(crate) fn checkout_changes(&mut self) -> BTreeMap<NamespacedName, EndpointsChange> {
        let mut changes = BTreeMap::new();

        for (service, tracker) in self.trackers.iter_mut() {
            if tracker.pending.is_empty() {
                continue;
            }

            let previous = endpoints_by_port(&self.hostname, service, &tracker.applied);
            for (name, slice) in std::mem::take(&mut tracker.pending) {
                if slice.remove {
                    tracker.applied.remove(&name);
                } else {
                    tracker.applied.insert(name, slice);
                }
            }
            let current = endpoints_by_port(&self.hostname, service, &tracker.applied);

            if previous != current {
                changes.insert(service.clone(), EndpointsChange { previous, current });
            }
        }

        self.trackers
            .retain(|_, t| !t.applied.is_empty() || !t.pending.is_empty());
        changes
    }

    /// Services with staged slice changes.
    pub(crate) fn pending_services(&self) -> BTreeSet<NamespacedName> {
        self.trackers
            .iter()
            .filter(|(_, t)| !t.pending.is_empty())
            .map(|(svc, _)| svc.clone())
            .collect()
    }
}

/// Merge a service's slices into per-port endpoint lists, de-duplicated by
/// address and sorted.
fn endpoints_by_port(
    hostname: &str,
    service: &NamespacedName,
    slices: &BTreeMap<String, CachedSlice>,
) -> PortEndpoints {
    let mut merged: BTreeMap<ServicePortName, BTreeMap<SocketAddr, EndpointInfo>> =
        BTreeMap::new();

    for (slice_name, slice) in slices {
        for port in &slice.ports {
            let Some(port_number) = port.port else {
                debug!(service = %service, slice = %slice_name, "Ignoring slice port with no port number");
                continue;
            };
            let name = ServicePortName::new(
                &service.namespace,
                &service.name,
                port.name.as_deref().unwrap_or_default(),
                port.protocol.unwrap_or(Protocol::Tcp),
            );
            let by_addr = merged.entry(name.clone()).or_default();

            for endpoint in &slice.endpoints {
                let Some(ip) = first_address(endpoint) else {
                    warn!(service = %service, slice = %slice_name, "Ignoring endpoint with no usable address");
                    continue;
                };
                let info = endpoint_info(hostname, &name, endpoint, SocketAddr::new(ip, port_number));

                // A ready copy wins over a non-ready one.
                let replace = by_addr
                    .get(&info.addr)
                    .map_or(true, |existing| !existing.ready);
                if replace {
                    by_addr.insert(info.addr, info);
                }
            }
        }
    }

    merged
        .into_iter()
        .filter(|(_, eps)| !eps.is_empty())
        .map(|(name, eps)| (name, eps.into_values().collect()))
        .collect()
}

fn first_address(endpoint: &Endpoint) -> Option<IpAddr> {
    endpoint.addresses.first()?.parse().ok()
}

fn endpoint_info(
    hostname: &str,
    service: &ServicePortName,
    endpoint: &Endpoint,
    addr: SocketAddr,
) -> EndpointInfo {
    let ready = endpoint.conditions.ready.unwrap_or(true);
    let serving = endpoint.conditions.serving.unwrap_or(ready);
    let terminating = endpoint.conditions.terminating.unwrap_or(false);

    let base = endpoint_chain_base(
        &service.namespace,
        &service.name,
        service.protocol.as_str(),
        &service.port,
        addr,
    );

    EndpointInfo {
        addr,
        ready,
        serving,
        terminating,
        is_local: endpoint.node_name.as_deref() == Some(hostname),
        zone_hints: endpoint
            .hints
            .as_ref()
            .map(|h| h.for_zones.iter().cloned().collect()),
        topology: endpoint.topology.clone(),
        chain_name: format!("{}{}", ENDPOINT_CHAIN_PREFIX, base),
        affinity_set: format!("{}{}", AFFINITY_SET_PREFIX, base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcproxy_testing::{EndpointBuilder, SliceBuilder, TEST_HOSTNAME};

    fn svc() -> NamespacedName {
        NamespacedName::new("ns1", "web")
    }

    fn http() -> ServicePortName {
        ServicePortName::new("ns1", "web", "http", Protocol::Tcp)
    }

    #[test]
    fn test_remove_of_unknown_slice_is_not_a_change() {
        let mut cache = EndpointSliceCache::new(TEST_HOSTNAME);
        let slice = SliceBuilder::new("ns1", "web", "web-1").build();
        assert!(!cache.update_pending(svc(), &slice, true));
        assert!(cache.checkout_changes().is_empty());
    }

    #[test]
    fn test_identical_update_is_not_a_change() {
        let mut cache = EndpointSliceCache::new(TEST_HOSTNAME);
        let slice = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 8080)
            .endpoint("10.1.0.1")
            .build();

        assert!(cache.update_pending(svc(), &slice, false));
        assert!(!cache.update_pending(svc(), &slice, false));
        cache.checkout_changes();
        assert!(!cache.update_pending(svc(), &slice, false));
    }

    #[test]
    fn test_merges_slices_and_dedups_by_address() {
        let mut cache = EndpointSliceCache::new(TEST_HOSTNAME);
        let a = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 8080)
            .with(EndpointBuilder::new("10.1.0.2").not_ready())
            .endpoint("10.1.0.3")
            .build();
        let b = SliceBuilder::new("ns1", "web", "web-2")
            .port("http", Protocol::Tcp, 8080)
            .endpoint("10.1.0.2")
            .with(EndpointBuilder::new("10.1.0.1").local())
            .build();

        cache.update_pending(svc(), &a, false);
        cache.update_pending(svc(), &b, false);
        let changes = cache.checkout_changes();
        let eps = &changes[&svc()].current[&http()];

        let addrs: Vec<String> = eps.iter().map(|e| e.addr.to_string()).collect();
        assert_eq!(addrs, vec!["10.1.0.1:8080", "10.1.0.2:8080", "10.1.0.3:8080"]);
        assert!(eps[0].is_local);
        assert!(eps[1].ready);
    }

    #[test]
    fn test_missing_conditions_default_to_ready() {
        let mut cache = EndpointSliceCache::new(TEST_HOSTNAME);
        let mut slice = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 8080)
            .endpoint("10.1.0.1")
            .build();
        slice.endpoints[0].conditions = Default::default();

        cache.update_pending(svc(), &slice, false);
        let changes = cache.checkout_changes();
        let ep = &changes[&svc()].current[&http()][0];
        assert!(ep.ready && ep.serving && !ep.terminating);
    }

    #[test]
    fn test_removal_yields_previous_only() {
        let mut cache = EndpointSliceCache::new(TEST_HOSTNAME);
        let slice = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 8080)
            .endpoint("10.1.0.1")
            .build();

        cache.update_pending(svc(), &slice, false);
        cache.checkout_changes();

        assert!(cache.update_pending(svc(), &slice, true));
        assert_eq!(cache.pending_services().len(), 1);
        let changes = cache.checkout_changes();
        let change = &changes[&svc()];
        assert_eq!(change.previous[&http()].len(), 1);
        assert!(change.current.is_empty());
        assert!(cache.pending_services().is_empty());
    }

    #[test]
    fn test_port_without_number_is_skipped() {
        let mut cache = EndpointSliceCache::new(TEST_HOSTNAME);
        let mut slice = SliceBuilder::new("ns1", "web", "web-1")
            .port("http", Protocol::Tcp, 8080)
            .endpoint("10.1.0.1")
            .build();
        slice.ports[0].port = None;

        cache.update_pending(svc(), &slice, false);
        assert!(cache.checkout_changes().is_empty());
    }
}
