//! Typed event queue between the watch feed and the proxier.
//!
//! One task owns the receiver and applies events in arrival order, so the
//! trackers see the same sequence the watch layer produced.

use std::sync::Arc;

use svcproxy_api::{EndpointSlice, Node, Service, WatchObject};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::proxier::Proxier;

/// A change the proxier reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
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

impl From<WatchObject> for ProxyEvent {
    fn from(obj: WatchObject) -> Self {
        match obj {
            WatchObject::ServiceAdded(s) => Self::ServiceAdded(s),
            WatchObject::ServiceUpdated { old, new } => Self::ServiceUpdated { old, new },
            WatchObject::ServiceDeleted(s) => Self::ServiceDeleted(s),
            WatchObject::ServicesSynced => Self::ServicesSynced,
            WatchObject::EndpointSliceAdded(s) => Self::EndpointSliceAdded(s),
            WatchObject::EndpointSliceUpdated { old, new } => {
                Self::EndpointSliceUpdated { old, new }
            }
            WatchObject::EndpointSliceDeleted(s) => Self::EndpointSliceDeleted(s),
            WatchObject::EndpointSlicesSynced => Self::EndpointSlicesSynced,
            WatchObject::NodeAdded(n) => Self::NodeAdded(n),
            WatchObject::NodeUpdated { old, new } => Self::NodeUpdated { old, new },
            WatchObject::NodeDeleted(n) => Self::NodeDeleted(n),
            WatchObject::NodesSynced => Self::NodesSynced,
        }
    }
}

impl ProxyEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceAdded(_) => "service_added",
            Self::ServiceUpdated { .. } => "service_updated",
            Self::ServiceDeleted(_) => "service_deleted",
            Self::ServicesSynced => "services_synced",
            Self::EndpointSliceAdded(_) => "endpoint_slice_added",
            Self::EndpointSliceUpdated { .. } => "endpoint_slice_updated",
            Self::EndpointSliceDeleted(_) => "endpoint_slice_deleted",
            Self::EndpointSlicesSynced => "endpoint_slices_synced",
            Self::NodeAdded(_) => "node_added",
            Self::NodeUpdated { .. } => "node_updated",
            Self::NodeDeleted(_) => "node_deleted",
            Self::NodesSynced => "nodes_synced",
        }
    }
}

/// Dispatch one event to the matching handler.
pub fn apply_event(proxier: &Proxier, event: ProxyEvent) {
    match event {
        ProxyEvent::ServiceAdded(svc) => proxier.on_service_add(&svc),
        ProxyEvent::ServiceUpdated { old, new } => proxier.on_service_update(Some(&old), Some(&new)),
        ProxyEvent::ServiceDeleted(svc) => proxier.on_service_delete(&svc),
        ProxyEvent::ServicesSynced => proxier.on_services_synced(),
        ProxyEvent::EndpointSliceAdded(slice) => proxier.on_endpoint_slice_add(&slice),
        ProxyEvent::EndpointSliceUpdated { old, new } => {
            proxier.on_endpoint_slice_update(&old, &new)
        }
        ProxyEvent::EndpointSliceDeleted(slice) => proxier.on_endpoint_slice_delete(&slice),
        ProxyEvent::EndpointSlicesSynced => proxier.on_endpoint_slices_synced(),
        ProxyEvent::NodeAdded(node) => proxier.on_node_add(&node),
        ProxyEvent::NodeUpdated { new, .. } => proxier.on_node_update(&new),
        ProxyEvent::NodeDeleted(node) => proxier.on_node_delete(&node),
        ProxyEvent::NodesSynced => proxier.on_nodes_synced(),
    }
}

/// Consume events until the queue closes or shutdown is signalled.
/// Returns the number of events applied.
pub async fn run_event_loop(
    proxier: Arc<Proxier>,
    mut rx: mpsc::UnboundedReceiver<ProxyEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut processed = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Event loop received shutdown signal");
                    break;
                }
            }

            event = rx.recv() => {
                let Some(event) = event else {
                    debug!("Event queue closed");
                    break;
                };
                debug!(kind = event.kind(), "Applying event");
                apply_event(&proxier, event);
                processed += 1;
            }
        }
    }

    info!(events_processed = processed, "Event loop stopped");
    processed
}
