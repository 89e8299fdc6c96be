//! Traffic policy and topology filtering of endpoints.
//!
//! All functions here are pure. Missing labels or hints never fail; they
//! just match nothing.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use svcproxy_api::{TrafficPolicy, LABEL_TOPOLOGY_ZONE};
use tracing::debug;

use crate::endpoints::EndpointInfo;
use crate::service::ServicePortInfo;

/// Topology key matching any node.
pub const TOPOLOGY_WILDCARD: &str = "*";

/// Endpoints of one service port split by the policy that may use them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategorizedEndpoints<'a> {
    /// Targets for Cluster policy traffic.
    pub cluster: Vec<&'a EndpointInfo>,
    /// Targets for Local policy traffic.
    pub local: Vec<&'a EndpointInfo>,
    /// Union of `cluster` and `local`; each needs an endpoint chain.
    pub all_reachable: Vec<&'a EndpointInfo>,
    /// Some endpoint, local or not, can take traffic.
    pub has_any_endpoints: bool,
}

/// Split a service port's endpoints into the cluster and local sets.
///
/// Ready endpoints are preferred. Serving-but-terminating endpoints are used
/// only when no ready endpoint qualifies for a set, so that draining
/// connections keep a target.
pub fn categorize_endpoints<'a>(
    endpoints: &'a [EndpointInfo],
    svc: &ServicePortInfo,
    node_labels: &BTreeMap<String, String>,
) -> CategorizedEndpoints<'a> {
    let mut out = CategorizedEndpoints::default();

    if svc.uses_cluster_endpoints() {
        let ready: Vec<&EndpointInfo> = endpoints.iter().filter(|e| e.ready).collect();
        out.cluster = if !svc.topology_keys.is_empty() {
            filter_topology_endpoint(node_labels, &svc.topology_keys, &ready)
        } else if can_use_hints(endpoints, svc, node_labels) {
            let zone = node_labels
                .get(LABEL_TOPOLOGY_ZONE)
                .map(String::as_str)
                .unwrap_or_default();
            ready
                .into_iter()
                .filter(|e| e.zone_hints.as_ref().is_some_and(|h| h.contains(zone)))
                .collect()
        } else {
            ready
        };

        if out.cluster.is_empty() {
            let draining: Vec<&EndpointInfo> = endpoints
                .iter()
                .filter(|e| e.serving_terminating())
                .collect();
            out.cluster = if svc.topology_keys.is_empty() {
                draining
            } else {
                filter_topology_endpoint(node_labels, &svc.topology_keys, &draining)
            };
        }
        out.has_any_endpoints = !out.cluster.is_empty();
    }

    if !svc.uses_local_endpoints() {
        out.all_reachable = out.cluster.clone();
        return out;
    }

    let mut has_local_ready = false;
    let mut has_local_draining = false;
    for ep in endpoints {
        if ep.ready {
            out.has_any_endpoints = true;
            has_local_ready |= ep.is_local;
        } else if ep.serving_terminating() {
            out.has_any_endpoints = true;
            has_local_draining |= ep.is_local;
        }
    }

    let candidates: Vec<&EndpointInfo> = if has_local_ready {
        endpoints.iter().filter(|e| e.ready).collect()
    } else if has_local_draining {
        endpoints.iter().filter(|e| e.serving_terminating()).collect()
    } else {
        Vec::new()
    };
    out.local = filter_local_endpoint(TrafficPolicy::Local, &candidates);

    if !svc.uses_cluster_endpoints() {
        out.all_reachable = out.local.clone();
        return out;
    }

    let mut union: BTreeMap<SocketAddr, &EndpointInfo> = BTreeMap::new();
    for ep in out.local.iter().chain(out.cluster.iter()) {
        union.insert(ep.addr, ep);
    }
    out.all_reachable = union.into_values().collect();
    out
}

/// Hints are usable only if the service opted in, the node has a zone,
/// every ready endpoint carries hints, and some endpoint is hinted for this
/// node's zone.
fn can_use_hints(
    endpoints: &[EndpointInfo],
    svc: &ServicePortInfo,
    node_labels: &BTreeMap<String, String>,
) -> bool {
    if !svc.hints_enabled {
        return false;
    }
    let Some(zone) = node_labels
        .get(LABEL_TOPOLOGY_ZONE)
        .filter(|z| !z.is_empty())
    else {
        return false;
    };

    let mut has_zone_hint = false;
    for ep in endpoints.iter().filter(|e| e.ready) {
        match &ep.zone_hints {
            Some(hints) if !hints.is_empty() => has_zone_hint |= hints.contains(zone),
            _ => {
                debug!(service_port = %svc.name, endpoint = %ep, "Endpoint without zone hints, ignoring hints");
                return false;
            }
        }
    }
    if !has_zone_hint {
        debug!(service_port = %svc.name, zone = %zone, "No endpoint hinted for this zone, ignoring hints");
    }
    has_zone_hint
}

/// Narrow endpoints by ordered topology keys.
///
/// The first key for which the node has a label and at least one endpoint
/// shares its value wins. A `*` key returns every endpoint. Without node
/// labels nothing matches unless the last key is `*`. No keys means no
/// filtering.
pub fn filter_topology_endpoint<'a>(
    node_labels: &BTreeMap<String, String>,
    topology_keys: &[String],
    endpoints: &[&'a EndpointInfo],
) -> Vec<&'a EndpointInfo> {
    if topology_keys.is_empty() {
        return endpoints.to_vec();
    }
    if node_labels.is_empty() {
        return if topology_keys.last().map(String::as_str) == Some(TOPOLOGY_WILDCARD) {
            endpoints.to_vec()
        } else {
            Vec::new()
        };
    }

    for key in topology_keys {
        if key == TOPOLOGY_WILDCARD {
            return endpoints.to_vec();
        }
        let Some(value) = node_labels.get(key) else {
            continue;
        };
        let matching: Vec<&EndpointInfo> = endpoints
            .iter()
            .copied()
            .filter(|e| e.topology.get(key) == Some(value))
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}

/// Under Local policy keep only endpoints on this node.
pub fn filter_local_endpoint<'a>(
    policy: TrafficPolicy,
    endpoints: &[&'a EndpointInfo],
) -> Vec<&'a EndpointInfo> {
    match policy {
        TrafficPolicy::Local => endpoints.iter().copied().filter(|e| e.is_local).collect(),
        TrafficPolicy::Cluster => endpoints.to_vec(),
    }
}
