//! The proxier: event handlers and the sync pass.
//!
//! Event handlers only record deltas in the change trackers and request a
//! sync. The sync pass, driven by the [`SyncRunner`](svcproxy_reconcile::SyncRunner),
//! folds the deltas into the materialized maps, regenerates the rules,
//! applies them in one transaction, garbage collects stale chains and clears
//! UDP conntrack entries that would otherwise keep pointing at dead
//! backends.

pub mod writer;

pub use writer::{build_rules, BuiltRules};

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use svcproxy_api::{EndpointSlice, NamespacedName, Node, Service};
use svcproxy_networking::{is_service_chain_name, IpFamily, IpPrefix};
use svcproxy_reconcile::{StaleChains, SyncHandle, DEFAULT_STALE_GRACE, DEFAULT_SYNC_PERIOD};
use tracing::{debug, error, info, warn};

use crate::backend::RuleBackend;
use crate::conntrack::{execute_cleanup, plan_cleanup, Conntrack, PendingCleanup};
use crate::endpoints::{EndpointsChangeTracker, EndpointsMap};
use crate::health::SyncHealth;
use crate::metrics as m;
use crate::rules::{AffinitySet, ObjectKind, DEFAULT_TABLE};
use crate::service::{ServiceChangeTracker, ServicePortMap};
use crate::ProxyError;

/// Default masquerade mark bit.
pub const DEFAULT_MASQUERADE_BIT: u32 = 14;

/// Static proxier settings.
#[derive(Debug, Clone)]
pub struct ProxierConfig {
    /// Name of the node this proxier runs on.
    pub hostname: String,
    pub family: IpFamily,
    /// Table owned by this proxier.
    pub table: String,
    /// Masquerade every packet sent to a service address.
    pub masquerade_all: bool,
    pub masquerade_mark: u32,
    /// Pod network; traffic from outside it to a cluster IP is masqueraded.
    pub cluster_cidr: Option<IpPrefix>,
    pub node_ip: Option<IpAddr>,
    /// Node addresses that accept node-port traffic. Empty means all local
    /// addresses.
    pub node_port_addresses: Vec<IpPrefix>,
    /// Skip the invalid-conntrack-state drop rule.
    pub conntrack_tcp_liberal: bool,
    /// Retry delay after a failed transaction.
    pub sync_period: Duration,
    /// How long a flushed chain stays before it is deleted.
    pub stale_grace: Duration,
}

impl Default for ProxierConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            family: IpFamily::Ipv4,
            table: DEFAULT_TABLE.to_string(),
            masquerade_all: false,
            masquerade_mark: 1 << DEFAULT_MASQUERADE_BIT,
            cluster_cidr: None,
            node_ip: None,
            node_port_addresses: Vec::new(),
            conntrack_tcp_liberal: false,
            sync_period: DEFAULT_SYNC_PERIOD,
            stale_grace: DEFAULT_STALE_GRACE,
        }
    }
}

/// Summary of one successful sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Rules in the applied transaction.
    pub rules: usize,
    pub active_chains: usize,
    /// Chains emptied this pass; deleted once the grace window passes.
    pub flushed_stale_chains: Vec<String>,
    pub deleted_stale_chains: Vec<String>,
    pub deleted_stale_sets: Vec<String>,
    /// Affinity sets deleted and re-added because their definition changed.
    pub recreated_sets: Vec<String>,
    pub conntrack_ops: usize,
    pub conntrack_failures: usize,
}

#[derive(Debug)]
struct ProxierState {
    services: ServicePortMap,
    endpoints: EndpointsMap,
    stale_chains: StaleChains,
    /// Conntrack work not yet executed; survives failed passes.
    pending_cleanup: PendingCleanup,
    /// Affinity sets as of the last applied transaction.
    programmed_sets: BTreeMap<String, AffinitySet>,
}

/// Keeps the packet filter in sync with services and endpoints.
pub struct Proxier {
    config: ProxierConfig,

    service_changes: ServiceChangeTracker,
    endpoint_changes: EndpointsChangeTracker,
    state: Mutex<ProxierState>,
    node_labels: ArcSwap<BTreeMap<String, String>>,

    services_synced: AtomicBool,
    slices_synced: AtomicBool,
    initialized: AtomicBool,

    backend: Arc<dyn RuleBackend>,
    conntrack: Arc<dyn Conntrack>,
    sync: SyncHandle,
    health: SyncHealth,
}

impl std::fmt::Debug for Proxier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxier")
            .field("hostname", &self.config.hostname)
            .field("family", &self.config.family)
            .field("backend", &self.backend.name())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl Proxier {
    pub fn new(
        config: ProxierConfig,
        backend: Arc<dyn RuleBackend>,
        conntrack: Arc<dyn Conntrack>,
        sync: SyncHandle,
    ) -> Self {
        let state = ProxierState {
            services: ServicePortMap::new(),
            endpoints: EndpointsMap::new(),
            stale_chains: StaleChains::new(config.stale_grace),
            pending_cleanup: PendingCleanup::default(),
            programmed_sets: BTreeMap::new(),
        };

        Self {
            service_changes: ServiceChangeTracker::new(config.family),
            endpoint_changes: EndpointsChangeTracker::new(&config.hostname, config.family),
            state: Mutex::new(state),
            node_labels: ArcSwap::from_pointee(BTreeMap::new()),
            services_synced: AtomicBool::new(false),
            slices_synced: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            backend,
            conntrack,
            sync,
            health: SyncHealth::new(),
            config,
        }
    }

    pub fn config(&self) -> &ProxierConfig {
        &self.config
    }

    pub fn health(&self) -> &SyncHealth {
        &self.health
    }

    /// Both initial listings have been received.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Current node labels.
    pub fn node_labels(&self) -> Arc<BTreeMap<String, String>> {
        self.node_labels.load_full()
    }

    /// Request a sync pass.
    pub fn sync(&self) {
        self.health.queued_update();
        metrics::gauge!(m::SYNC_PROXY_RULES_LAST_QUEUED_TIMESTAMP_SECONDS)
            .set(Utc::now().timestamp() as f64);
        self.sync.run();
    }

    // ========================================================================
    // Services
    // ========================================================================

    pub fn on_service_add(&self, service: &Service) {
        self.on_service_update(None, Some(service));
    }

    /// `old` None is an add, `new` None a delete.
    pub fn on_service_update(&self, old: Option<&Service>, new: Option<&Service>) {
        if self.service_changes.update(old, new) && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_service_delete(&self, service: &Service) {
        self.on_service_update(Some(service), None);
    }

    pub fn on_services_synced(&self) {
        self.services_synced.store(true, Ordering::Release);
        self.mark_initialized();
        self.sync();
    }

    // ========================================================================
    // Endpoint slices
    // ========================================================================

    pub fn on_endpoint_slice_add(&self, slice: &EndpointSlice) {
        if self.endpoint_changes.endpoint_slice_update(slice, false) && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_endpoint_slice_update(&self, _old: &EndpointSlice, new: &EndpointSlice) {
        if self.endpoint_changes.endpoint_slice_update(new, false) && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_endpoint_slice_delete(&self, slice: &EndpointSlice) {
        if self.endpoint_changes.endpoint_slice_update(slice, true) && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_endpoint_slices_synced(&self) {
        self.slices_synced.store(true, Ordering::Release);
        self.mark_initialized();
        self.sync();
    }

    fn mark_initialized(&self) {
        if self.services_synced.load(Ordering::Acquire)
            && self.slices_synced.load(Ordering::Acquire)
            && !self.initialized.swap(true, Ordering::AcqRel)
        {
            info!(hostname = %self.config.hostname, "Initial listings received, rule sync enabled");
        }
    }

    // ========================================================================
    // Node
    // ========================================================================

    pub fn on_node_add(&self, node: &Node) {
        self.on_node_update(node);
    }

    /// Only this node's labels matter, and only for topology filtering.
    pub fn on_node_update(&self, node: &Node) {
        if !self.is_own_node(node) {
            return;
        }
        if **self.node_labels.load() == *node.labels() {
            return;
        }
        info!(node = %node.metadata.name, labels = ?node.labels(), "Node labels changed");
        self.node_labels.store(Arc::new(node.labels().clone()));
        self.sync();
    }

    pub fn on_node_delete(&self, node: &Node) {
        if !self.is_own_node(node) {
            return;
        }
        self.node_labels.store(Arc::new(BTreeMap::new()));
        self.sync();
    }

    pub fn on_nodes_synced(&self) {
        debug!("Node listing received");
    }

    fn is_own_node(&self, node: &Node) -> bool {
        if node.metadata.name != self.config.hostname {
            error!(
                node = %node.metadata.name,
                hostname = %self.config.hostname,
                "Received a watch event for a node that is not this node"
            );
            return false;
        }
        true
    }

    // ========================================================================
    // Sync pass
    // ========================================================================

    /// Run one full sync pass.
    pub async fn sync_proxy_rules(&self) -> Result<SyncOutcome, ProxyError> {
        if !self.is_initialized() {
            debug!("Not syncing rules until services and endpoint slices are synced");
            return Err(ProxyError::NotInitialized);
        }

        let start = std::time::Instant::now();
        let mut outcome = SyncOutcome::default();

        let (expired, trigger_times) = {
            let mut state = self.state.lock();
            let state = &mut *state;

            let svc_result = state.services.update(&self.service_changes);
            let eps_result = state.endpoints.update(&self.endpoint_changes);

            let pending = &mut state.pending_cleanup;
            pending
                .deleted_cluster_ips
                .extend(svc_result.deleted_udp_cluster_ips);
            pending
                .newly_active
                .extend(eps_result.newly_active_udp_services);
            pending
                .stale_endpoints
                .extend(eps_result.deleted_udp_endpoints);

            debug!(
                updated_services = svc_result.updated_services.len(),
                updated_endpoints = eps_result.updated_services.len(),
                "Applied pending changes"
            );

            let expired = state.stale_chains.take_expired(tokio::time::Instant::now());
            (expired, eps_result.last_change_trigger_times)
        };

        if !expired.is_empty() {
            let mut tx = self.backend.new_transaction();
            for chain in &expired {
                tx.delete_chain(chain);
            }
            match self.backend.run(&tx).await {
                Ok(()) => {
                    debug!(chains = expired.len(), "Deleted stale chains");
                    outcome.deleted_stale_chains = expired;
                }
                Err(e) => {
                    metrics::counter!(m::STALE_CHAIN_DELETE_FAILURES_TOTAL).increment(1);
                    warn!(error = %e, chains = expired.len(), "Failed to delete stale chains");
                }
            }
        }

        let mut built = {
            let state = self.state.lock();
            let labels = self.node_labels.load();
            let mut built = build_rules(&self.config, &state.services, &state.endpoints, &labels);

            // The chains referencing an affinity set are flushed before the
            // set is added, so a changed set can be replaced in place.
            let changed: Vec<String> = built
                .tx
                .sets()
                .filter(|set| {
                    state
                        .programmed_sets
                        .get(&set.name)
                        .is_some_and(|programmed| programmed != *set)
                })
                .map(|set| set.name.clone())
                .collect();
            for set in changed {
                built.tx.recreate_set(&set);
                outcome.recreated_sets.push(set);
            }
            built
        };

        let mut chains_listed = false;
        match self.backend.list(ObjectKind::Chains).await {
            Ok(existing) => {
                chains_listed = true;
                for chain in existing {
                    if is_service_chain_name(&chain) && !built.active_chains.contains(&chain) {
                        built.tx.flush_chain(&chain);
                        outcome.flushed_stale_chains.push(chain);
                    }
                }
            }
            Err(e) if e.is_not_found() => chains_listed = true,
            Err(e) => warn!(error = %e, "Failed to list chains, skipping stale chain cleanup"),
        }

        // Stale sets may still be referenced by chains that were not flushed.
        let sets = if chains_listed {
            self.backend.list(ObjectKind::Sets).await
        } else {
            Ok(Vec::new())
        };
        match sets {
            Ok(existing) => {
                for set in existing {
                    if !built.active_sets.contains(&set) {
                        built.tx.delete_set(&set);
                        outcome.deleted_stale_sets.push(set);
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(error = %e, "Failed to list sets, skipping stale set cleanup"),
        }

        if let Err(e) = self.backend.run(&built.tx).await {
            metrics::counter!(m::SYNC_PROXY_RULES_FAILURES_TOTAL).increment(1);
            error!(
                backend = self.backend.name(),
                error = %e,
                retry_in = ?self.config.sync_period,
                "Failed to apply rule transaction"
            );
            self.sync.retry_after(self.config.sync_period);
            return Err(ProxyError::Backend(e));
        }

        outcome.rules = built.tx.rule_count();
        outcome.active_chains = built.active_chains.len();
        self.record_success(&built, start.elapsed(), &trigger_times);

        let (ops, health_ports, local_endpoints) = {
            let mut state = self.state.lock();
            let now = tokio::time::Instant::now();
            state.stale_chains.forget_active(&built.active_chains);
            state.programmed_sets = built
                .tx
                .sets()
                .map(|set| (set.name.clone(), set.clone()))
                .collect();
            for chain in &outcome.flushed_stale_chains {
                state.stale_chains.mark(chain, now);
            }

            let pending = std::mem::take(&mut state.pending_cleanup);
            let ops = plan_cleanup(&pending, &state.services, self.config.family);
            (
                ops,
                state.services.health_check_node_ports().len(),
                state.endpoints.local_ready_endpoints().len(),
            )
        };

        outcome.conntrack_ops = ops.len();
        outcome.conntrack_failures = execute_cleanup(self.conntrack.as_ref(), &ops).await;

        info!(
            rules = outcome.rules,
            active_chains = outcome.active_chains,
            flushed_stale_chains = outcome.flushed_stale_chains.len(),
            deleted_stale_chains = outcome.deleted_stale_chains.len(),
            conntrack_ops = outcome.conntrack_ops,
            health_check_node_ports = health_ports,
            services_with_local_endpoints = local_endpoints,
            elapsed = ?start.elapsed(),
            "Synced proxy rules"
        );

        Ok(outcome)
    }

    fn record_success(
        &self,
        built: &BuiltRules,
        elapsed: Duration,
        trigger_times: &BTreeMap<NamespacedName, Vec<DateTime<Utc>>>,
    ) {
        let now = Utc::now();

        metrics::gauge!(m::SYNC_PROXY_RULES_RULES).set(built.tx.rule_count() as f64);
        metrics::gauge!(m::SYNC_PROXY_RULES_ACTIVE_CHAINS).set(built.active_chains.len() as f64);
        metrics::gauge!(m::SYNC_PROXY_RULES_NO_LOCAL_ENDPOINTS, m::LABEL_TRAFFIC_POLICY => "internal")
            .set(built.no_local_internal as f64);
        metrics::gauge!(m::SYNC_PROXY_RULES_NO_LOCAL_ENDPOINTS, m::LABEL_TRAFFIC_POLICY => "external")
            .set(built.no_local_external as f64);
        metrics::histogram!(m::SYNC_PROXY_RULES_DURATION_SECONDS).record(elapsed.as_secs_f64());
        metrics::gauge!(m::SYNC_PROXY_RULES_LAST_TIMESTAMP_SECONDS).set(now.timestamp() as f64);

        for time in trigger_times.values().flatten() {
            let latency = now.signed_duration_since(*time);
            if let Ok(latency) = latency.to_std() {
                metrics::histogram!(m::NETWORK_PROGRAMMING_DURATION_SECONDS)
                    .record(latency.as_secs_f64());
            }
        }

        self.health.updated();
    }

    /// Whether `chain` was flushed and is waiting out the grace window.
    pub fn is_stale_chain(&self, chain: &str) -> bool {
        self.state.lock().stale_chains.contains(chain)
    }
}
