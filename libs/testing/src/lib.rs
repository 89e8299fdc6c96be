//! Fixture builders for services, endpoint slices and nodes.

use std::collections::BTreeMap;

use svcproxy_api::{
    AddressType, Endpoint, EndpointConditions, EndpointHints, EndpointPort, EndpointSlice, Node,
    ObjectMeta, Protocol, Service, ServicePort, ServiceType, SessionAffinity, TrafficPolicy,
    ANNOTATION_LAST_CHANGE_TRIGGER_TIME, ANNOTATION_TOPOLOGY_MODE, LABEL_HOSTNAME,
    LABEL_SERVICE_NAME, LABEL_TOPOLOGY_ZONE,
};

/// Hostname used by fixtures for "this node".
pub const TEST_HOSTNAME: &str = "node-a";

/// Builder for [`Service`].
#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    svc: Service,
}

impl ServiceBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            svc: Service {
                metadata: ObjectMeta::new(namespace, name),
                ..Default::default()
            },
        }
    }

    pub fn cluster_ip(mut self, ip: &str) -> Self {
        self.svc.spec.cluster_ip = Some(ip.to_string());
        self
    }

    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.svc.spec.service_type = service_type;
        self
    }

    pub fn port(mut self, name: &str, protocol: Protocol, port: u16) -> Self {
        self.svc.spec.ports.push(ServicePort {
            name: name.to_string(),
            protocol,
            port,
            node_port: None,
        });
        self
    }

    /// Add a port with a node port; switches the service type to NodePort
    /// unless it is already a LoadBalancer.
    pub fn node_port(mut self, name: &str, protocol: Protocol, port: u16, node_port: u16) -> Self {
        self.svc.spec.ports.push(ServicePort {
            name: name.to_string(),
            protocol,
            port,
            node_port: Some(node_port),
        });
        if self.svc.spec.service_type == ServiceType::ClusterIp {
            self.svc.spec.service_type = ServiceType::NodePort;
        }
        self
    }

    pub fn external_ip(mut self, ip: &str) -> Self {
        self.svc.spec.external_ips.push(ip.to_string());
        self
    }

    pub fn load_balancer_ip(mut self, ip: &str) -> Self {
        self.svc.spec.service_type = ServiceType::LoadBalancer;
        self.svc.status.load_balancer_ingress.push(ip.to_string());
        self
    }

    pub fn source_range(mut self, cidr: &str) -> Self {
        self.svc
            .spec
            .load_balancer_source_ranges
            .push(cidr.to_string());
        self
    }

    pub fn internal_policy(mut self, policy: TrafficPolicy) -> Self {
        self.svc.spec.internal_traffic_policy = Some(policy);
        self
    }

    pub fn external_policy(mut self, policy: TrafficPolicy) -> Self {
        self.svc.spec.external_traffic_policy = Some(policy);
        self
    }

    pub fn client_ip_affinity(mut self, timeout_seconds: u32) -> Self {
        self.svc.spec.session_affinity = SessionAffinity::ClientIp;
        self.svc.spec.session_affinity_timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn topology_keys(mut self, keys: &[&str]) -> Self {
        self.svc.spec.topology_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn topology_mode_auto(mut self) -> Self {
        self.svc
            .metadata
            .annotations
            .insert(ANNOTATION_TOPOLOGY_MODE.to_string(), "Auto".to_string());
        self
    }

    pub fn health_check_node_port(mut self, port: u16) -> Self {
        self.svc.spec.health_check_node_port = Some(port);
        self
    }

    pub fn build(self) -> Service {
        self.svc
    }
}

/// Builder for one [`Endpoint`] inside a slice.
#[derive(Debug, Clone)]
pub struct EndpointBuilder {
    ep: Endpoint,
}

impl EndpointBuilder {
    /// A ready endpoint with no node.
    pub fn new(ip: &str) -> Self {
        Self {
            ep: Endpoint {
                addresses: vec![ip.to_string()],
                conditions: EndpointConditions {
                    ready: Some(true),
                    serving: Some(true),
                    terminating: Some(false),
                },
                ..Default::default()
            },
        }
    }

    pub fn not_ready(mut self) -> Self {
        self.ep.conditions.ready = Some(false);
        self.ep.conditions.serving = Some(false);
        self
    }

    /// Terminating but still serving.
    pub fn terminating(mut self) -> Self {
        self.ep.conditions.ready = Some(false);
        self.ep.conditions.serving = Some(true);
        self.ep.conditions.terminating = Some(true);
        self
    }

    /// Terminating and no longer serving.
    pub fn gone(mut self) -> Self {
        self.ep.conditions.ready = Some(false);
        self.ep.conditions.serving = Some(false);
        self.ep.conditions.terminating = Some(true);
        self
    }

    pub fn node(mut self, node: &str) -> Self {
        self.ep.node_name = Some(node.to_string());
        self
    }

    /// Place the endpoint on [`TEST_HOSTNAME`].
    pub fn local(self) -> Self {
        self.node(TEST_HOSTNAME)
    }

    pub fn zone(mut self, zone: &str) -> Self {
        self.ep.zone = Some(zone.to_string());
        self.ep
            .topology
            .insert(LABEL_TOPOLOGY_ZONE.to_string(), zone.to_string());
        self
    }

    pub fn topology(mut self, key: &str, value: &str) -> Self {
        self.ep.topology.insert(key.to_string(), value.to_string());
        self
    }

    pub fn hint_zones(mut self, zones: &[&str]) -> Self {
        self.ep.hints = Some(EndpointHints {
            for_zones: zones.iter().map(|z| z.to_string()).collect(),
        });
        self
    }

    pub fn build(self) -> Endpoint {
        self.ep
    }
}

/// Builder for [`EndpointSlice`].
#[derive(Debug, Clone)]
pub struct SliceBuilder {
    slice: EndpointSlice,
}

impl SliceBuilder {
    /// An IPv4 slice owned by `namespace/service`.
    pub fn new(namespace: &str, service: &str, slice_name: &str) -> Self {
        let mut metadata = ObjectMeta::new(namespace, slice_name);
        metadata
            .labels
            .insert(LABEL_SERVICE_NAME.to_string(), service.to_string());
        Self {
            slice: EndpointSlice {
                metadata,
                address_type: AddressType::Ipv4,
                ..Default::default()
            },
        }
    }

    pub fn address_type(mut self, address_type: AddressType) -> Self {
        self.slice.address_type = address_type;
        self
    }

    pub fn port(mut self, name: &str, protocol: Protocol, port: u16) -> Self {
        self.slice.ports.push(EndpointPort {
            name: Some(name.to_string()),
            protocol: Some(protocol),
            port: Some(port),
        });
        self
    }

    /// Add a ready endpoint.
    pub fn endpoint(self, ip: &str) -> Self {
        self.with(EndpointBuilder::new(ip))
    }

    pub fn with(mut self, endpoint: EndpointBuilder) -> Self {
        self.slice.endpoints.push(endpoint.build());
        self
    }

    pub fn trigger_time(mut self, rfc3339: &str) -> Self {
        self.slice.metadata.annotations.insert(
            ANNOTATION_LAST_CHANGE_TRIGGER_TIME.to_string(),
            rfc3339.to_string(),
        );
        self
    }

    pub fn build(self) -> EndpointSlice {
        self.slice
    }
}

/// A node named [`TEST_HOSTNAME`] with the given labels.
pub fn local_node(labels: &[(&str, &str)]) -> Node {
    let mut metadata = ObjectMeta::new("", TEST_HOSTNAME);
    metadata.labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>();
    metadata
        .labels
        .insert(LABEL_HOSTNAME.to_string(), TEST_HOSTNAME.to_string());
    Node { metadata }
}
