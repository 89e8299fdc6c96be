//! Watch-event envelope.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ApiError, EndpointSlice, Node, Service};

/// All event type names as constants.
pub mod event_types {
    // Service
    pub const SERVICE_ADDED: &str = "service.added";
    pub const SERVICE_UPDATED: &str = "service.updated";
    pub const SERVICE_DELETED: &str = "service.deleted";
    pub const SERVICES_SYNCED: &str = "services.synced";

    // EndpointSlice
    pub const ENDPOINT_SLICE_ADDED: &str = "endpointslice.added";
    pub const ENDPOINT_SLICE_UPDATED: &str = "endpointslice.updated";
    pub const ENDPOINT_SLICE_DELETED: &str = "endpointslice.deleted";
    pub const ENDPOINT_SLICES_SYNCED: &str = "endpointslices.synced";

    // Node
    pub const NODE_ADDED: &str = "node.added";
    pub const NODE_UPDATED: &str = "node.updated";
    pub const NODE_DELETED: &str = "node.deleted";
    pub const NODES_SYNCED: &str = "nodes.synced";
}

/// One line of the watch feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    /// The event type (e.g., "service.added").
    pub event_type: String,

    /// When the watch layer observed the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,

    /// Event-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of add and delete events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectPayload<T> {
    pub object: T,
}

/// Payload of update events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload<T> {
    pub old: T,
    pub new: T,
}

/// A decoded watch event.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchObject {
    ServiceAdded(Service),
    ServiceUpdated { old: Service, new: Service },
    ServiceDeleted(Service),
    ServicesSynced,
    EndpointSliceAdded(EndpointSlice),
    EndpointSliceUpdated { old: EndpointSlice, new: EndpointSlice },
    EndpointSliceDeleted(EndpointSlice),
    EndpointSlicesSynced,
    NodeAdded(Node),
    NodeUpdated { old: Node, new: Node },
    NodeDeleted(Node),
    NodesSynced,
}

impl WatchEvent {
    /// Build an event from an object payload.
    pub fn new<P: Serialize>(event_type: &str, payload: &P) -> Result<Self, ApiError> {
        Ok(Self {
            event_type: event_type.to_string(),
            occurred_at: Some(Utc::now()),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Parse one line of the feed.
    pub fn from_line(line: &str) -> Result<Self, ApiError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Decode the payload according to the event type.
    pub fn decode(&self) -> Result<WatchObject, ApiError> {
        use event_types::*;

        let decoded = match self.event_type.as_str() {
            SERVICE_ADDED => WatchObject::ServiceAdded(self.object()?),
            SERVICE_UPDATED => {
                let p: UpdatePayload<Service> = self.payload_as()?;
                WatchObject::ServiceUpdated { old: p.old, new: p.new }
            }
            SERVICE_DELETED => WatchObject::ServiceDeleted(self.object()?),
            SERVICES_SYNCED => WatchObject::ServicesSynced,
            ENDPOINT_SLICE_ADDED => WatchObject::EndpointSliceAdded(self.object()?),
            ENDPOINT_SLICE_UPDATED => {
                let p: UpdatePayload<EndpointSlice> = self.payload_as()?;
                WatchObject::EndpointSliceUpdated { old: p.old, new: p.new }
            }
            ENDPOINT_SLICE_DELETED => WatchObject::EndpointSliceDeleted(self.object()?),
            ENDPOINT_SLICES_SYNCED => WatchObject::EndpointSlicesSynced,
            NODE_ADDED => WatchObject::NodeAdded(self.object()?),
            NODE_UPDATED => {
                let p: UpdatePayload<Node> = self.payload_as()?;
                WatchObject::NodeUpdated { old: p.old, new: p.new }
            }
            NODE_DELETED => WatchObject::NodeDeleted(self.object()?),
            NODES_SYNCED => WatchObject::NodesSynced,
            other => return Err(ApiError::UnknownEventType(other.to_string())),
        };
        Ok(decoded)
    }

    fn object<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let p: ObjectPayload<T> = self.payload_as()?;
        Ok(p.object)
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ApiError::InvalidPayload {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectMeta;

    #[test]
    fn test_decode_service_added() {
        let line = r#"{"event_type":"service.added","payload":{"object":{"metadata":{"namespace":"ns1","name":"web"},"spec":{"cluster_ip":"10.0.0.1","ports":[{"name":"http","port":80}]}}}}"#;
        let event = WatchEvent::from_line(line).unwrap();

        match event.decode().unwrap() {
            WatchObject::ServiceAdded(svc) => {
                assert_eq!(svc.metadata.name, "web");
                assert_eq!(svc.spec.ports[0].port, 80);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_update_requires_both_sides() {
        let node = Node {
            metadata: ObjectMeta::new("", "node-a"),
        };
        let event = WatchEvent::new(
            event_types::NODE_UPDATED,
            &ObjectPayload { object: node },
        )
        .unwrap();

        let err = event.decode().unwrap_err();
        assert!(matches!(err, ApiError::InvalidPayload { .. }));
    }

    #[test]
    fn test_decode_synced_markers_without_payload() {
        let event = WatchEvent::from_line(r#"{"event_type":"endpointslices.synced"}"#).unwrap();
        assert_eq!(event.decode().unwrap(), WatchObject::EndpointSlicesSynced);
    }

    #[test]
    fn test_unknown_event_type() {
        let event = WatchEvent::from_line(r#"{"event_type":"pod.added","payload":{}}"#).unwrap();
        assert!(matches!(
            event.decode(),
            Err(ApiError::UnknownEventType(t)) if t == "pod.added"
        ));
    }

    #[test]
    fn test_malformed_line() {
        assert!(matches!(
            WatchEvent::from_line("{not json"),
            Err(ApiError::Serialization(_))
        ));
    }

    #[test]
    fn test_update_round_trips_through_json() {
        let old = Service {
            metadata: ObjectMeta::new("ns1", "web"),
            ..Default::default()
        };
        let mut new = old.clone();
        new.spec.cluster_ip = Some("10.0.0.2".to_string());

        let event = WatchEvent::new(
            event_types::SERVICE_UPDATED,
            &UpdatePayload {
                old: old.clone(),
                new: new.clone(),
            },
        )
        .unwrap();
        let line = serde_json::to_string(&event).unwrap();

        assert_eq!(
            WatchEvent::from_line(&line).unwrap().decode().unwrap(),
            WatchObject::ServiceUpdated { old, new }
        );
    }
}
