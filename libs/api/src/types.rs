//! Watched object definitions.
//!
//! Field names follow the snake_case JSON used on the event feed. Optional
//! fields default so partially filled objects still decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Well-known labels and annotations
// =============================================================================

/// Label on an endpoint slice naming the service it belongs to.
pub const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";

/// Node label holding the node's hostname.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

/// Node label holding the node's zone.
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// Endpoint-slice annotation recording when the change that produced it
/// was triggered (RFC 3339).
pub const ANNOTATION_LAST_CHANGE_TRIGGER_TIME: &str =
    "endpoints.kubernetes.io/last-change-trigger-time";

/// Service annotation opting into topology-aware routing hints.
pub const ANNOTATION_TOPOLOGY_MODE: &str = "service.kubernetes.io/topology-mode";

/// Cluster IP value of a headless service.
pub const CLUSTER_IP_NONE: &str = "None";

/// Default session affinity timeout (3 hours).
pub const DEFAULT_AFFINITY_TIMEOUT_SECONDS: u32 = 10_800;

// =============================================================================
// Shared enums
// =============================================================================

/// L4 protocol of a port.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// Lowercase name as used in rule matches and chain names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether traffic may go to any endpoint in the cluster or only to
/// endpoints on the receiving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

/// Session affinity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionAffinity {
    #[default]
    None,
    ClientIp,
}

/// How a service is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    ClusterIp,
    NodePort,
    LoadBalancer,
    ExternalName,
}

/// Address type of an endpoint slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    #[default]
    Ipv4,
    Ipv6,
    Fqdn,
}

// =============================================================================
// Metadata
// =============================================================================

/// Object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectMeta {
    /// Namespace (empty for cluster-scoped objects such as nodes).
    #[serde(default)]
    pub namespace: String,

    /// Object name.
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create metadata for a namespaced object.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Namespace and name of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Service
// =============================================================================

/// One port of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServicePort {
    /// Port name; may be empty for single-port services.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub protocol: Protocol,

    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
}

/// Service specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceSpec {
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,

    /// Cluster IP; `None` (the string) for headless services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,

    #[serde(default)]
    pub ports: Vec<ServicePort>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_source_ranges: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_traffic_policy: Option<TrafficPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_traffic_policy: Option<TrafficPolicy>,

    #[serde(default)]
    pub session_affinity: SessionAffinity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity_timeout_seconds: Option<u32>,

    /// Ordered topology keys; `*` matches any node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_node_port: Option<u16>,
}

/// Service status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceStatus {
    /// Load-balancer ingress IPs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_ingress: Vec<String>,
}

/// A service object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Service {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ServiceSpec,

    #[serde(default)]
    pub status: ServiceStatus,
}

impl Service {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Returns true if the service should get proxy rules at all.
    ///
    /// ExternalName services and services without a usable cluster IP are
    /// skipped.
    pub fn should_skip(&self) -> bool {
        if self.spec.service_type == ServiceType::ExternalName {
            return true;
        }
        match self.spec.cluster_ip.as_deref() {
            None | Some("") | Some(CLUSTER_IP_NONE) => true,
            Some(_) => false,
        }
    }
}

// =============================================================================
// EndpointSlice
// =============================================================================

/// Readiness conditions of one endpoint. Absent values are filled in by
/// consumers (ready defaults to true, serving to ready, terminating to
/// false).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndpointConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminating: Option<bool>,
}

/// Topology-aware routing hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndpointHints {
    #[serde(default)]
    pub for_zones: Vec<String>,
}

/// One endpoint in a slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Endpoint {
    /// Addresses; only the first is used.
    pub addresses: Vec<String>,

    #[serde(default)]
    pub conditions: EndpointConditions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<EndpointHints>,

    /// Topology labels, matched against node labels by topology keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub topology: BTreeMap<String, String>,
}

/// One port in a slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndpointPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A partial list of endpoints for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndpointSlice {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub address_type: AddressType,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

impl EndpointSlice {
    /// Name of the owning service, from the service-name label.
    pub fn service_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(LABEL_SERVICE_NAME)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

// =============================================================================
// Node
// =============================================================================

/// A node object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Node {
    pub metadata: ObjectMeta,
}

impl Node {
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_serialization() {
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"udp\"");
        assert_eq!(
            serde_json::from_str::<Protocol>("\"sctp\"").unwrap(),
            Protocol::Sctp
        );
    }

    #[test]
    fn test_session_affinity_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionAffinity::ClientIp).unwrap(),
            "\"client_ip\""
        );
    }

    #[test]
    fn test_service_minimal_decode() {
        let svc: Service = serde_json::from_value(serde_json::json!({
            "metadata": {"namespace": "ns1", "name": "web"},
            "spec": {"cluster_ip": "10.0.0.10", "ports": [{"name": "http", "port": 80}]}
        }))
        .unwrap();

        assert_eq!(svc.spec.ports[0].protocol, Protocol::Tcp);
        assert_eq!(svc.spec.session_affinity, SessionAffinity::None);
        assert_eq!(svc.spec.service_type, ServiceType::ClusterIp);
        assert!(!svc.should_skip());
    }

    #[test]
    fn test_headless_and_external_name_are_skipped() {
        let mut svc = Service {
            metadata: ObjectMeta::new("ns1", "db"),
            ..Default::default()
        };
        assert!(svc.should_skip());

        svc.spec.cluster_ip = Some(CLUSTER_IP_NONE.to_string());
        assert!(svc.should_skip());

        svc.spec.cluster_ip = Some("10.0.0.5".to_string());
        svc.spec.service_type = ServiceType::ExternalName;
        assert!(svc.should_skip());
    }

    #[test]
    fn test_slice_service_name() {
        let mut slice = EndpointSlice {
            metadata: ObjectMeta::new("ns1", "web-abcde"),
            ..Default::default()
        };
        assert_eq!(slice.service_name(), None);

        slice
            .metadata
            .labels
            .insert(LABEL_SERVICE_NAME.to_string(), "web".to_string());
        assert_eq!(slice.service_name(), Some("web"));
    }

    #[test]
    fn test_slice_decode_with_conditions() {
        let slice: EndpointSlice = serde_json::from_value(serde_json::json!({
            "metadata": {"namespace": "ns1", "name": "web-1"},
            "address_type": "ipv6",
            "endpoints": [{
                "addresses": ["fd00::1"],
                "conditions": {"ready": false, "terminating": true},
                "node_name": "node-a",
                "hints": {"for_zones": ["zone-a"]}
            }],
            "ports": [{"name": "http", "protocol": "tcp", "port": 8080}]
        }))
        .unwrap();

        assert_eq!(slice.address_type, AddressType::Ipv6);
        let ep = &slice.endpoints[0];
        assert_eq!(ep.conditions.ready, Some(false));
        assert_eq!(ep.conditions.serving, None);
        assert_eq!(ep.hints.as_ref().unwrap().for_zones, vec!["zone-a"]);
    }
}
