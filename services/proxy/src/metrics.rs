//! Metric names and descriptions.
//!
//! Modules record through the `metrics` facade macros using these
//! constants; whichever recorder the binary installs receives them.
//!
//! # Naming
//!
//! - prefix: `svcproxy_`
//! - suffix: `_total` (counter), `_seconds` (histogram), none (gauge)

/// Traffic policy label key (internal, external).
pub const LABEL_TRAFFIC_POLICY: &str = "traffic_policy";

// ─── Sync pass ─────────────────────────────────────────────────────

/// Duration of one rule sync pass (histogram, seconds).
pub const SYNC_PROXY_RULES_DURATION_SECONDS: &str = "svcproxy_sync_proxy_rules_duration_seconds";

/// Unix time of the last successful sync (gauge).
pub const SYNC_PROXY_RULES_LAST_TIMESTAMP_SECONDS: &str =
    "svcproxy_sync_proxy_rules_last_timestamp_seconds";

/// Unix time a sync was last requested (gauge).
pub const SYNC_PROXY_RULES_LAST_QUEUED_TIMESTAMP_SECONDS: &str =
    "svcproxy_sync_proxy_rules_last_queued_timestamp_seconds";

/// Failed rule transactions (counter).
pub const SYNC_PROXY_RULES_FAILURES_TOTAL: &str = "svcproxy_sync_proxy_rules_failures_total";

/// Rules in the last applied transaction (gauge).
pub const SYNC_PROXY_RULES_RULES: &str = "svcproxy_sync_proxy_rules_rules";

/// Per-service chains referenced by the last transaction (gauge).
pub const SYNC_PROXY_RULES_ACTIVE_CHAINS: &str = "svcproxy_sync_proxy_rules_active_chains";

/// Service ports whose Local policy has no local endpoints (gauge, label:
/// traffic_policy).
pub const SYNC_PROXY_RULES_NO_LOCAL_ENDPOINTS: &str =
    "svcproxy_sync_proxy_rules_no_local_endpoints";

/// Failed stale-chain deletions (counter).
pub const STALE_CHAIN_DELETE_FAILURES_TOTAL: &str = "svcproxy_stale_chain_delete_failures_total";

// ─── Change tracking ───────────────────────────────────────────────

/// Time from an endpoint change to its rules being applied (histogram,
/// seconds).
pub const NETWORK_PROGRAMMING_DURATION_SECONDS: &str =
    "svcproxy_network_programming_duration_seconds";

/// Endpoint slice changes that produced a delta (counter).
pub const ENDPOINT_CHANGES_TOTAL: &str = "svcproxy_endpoint_changes_total";

/// Services with pending endpoint deltas (gauge).
pub const ENDPOINT_CHANGES_PENDING: &str = "svcproxy_endpoint_changes_pending";

/// Service changes that produced a delta (counter).
pub const SERVICE_CHANGES_TOTAL: &str = "svcproxy_service_changes_total";

/// Services with pending deltas (gauge).
pub const SERVICE_CHANGES_PENDING: &str = "svcproxy_service_changes_pending";

// ─── Conntrack ─────────────────────────────────────────────────────

/// Failed conntrack deletions (counter).
pub const CONNTRACK_CLEANUP_FAILURES_TOTAL: &str = "svcproxy_conntrack_cleanup_failures_total";

/// Register descriptions with the installed recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    describe_histogram!(
        SYNC_PROXY_RULES_DURATION_SECONDS,
        Unit::Seconds,
        "Duration of a rule sync pass"
    );
    describe_gauge!(
        SYNC_PROXY_RULES_LAST_TIMESTAMP_SECONDS,
        Unit::Seconds,
        "Time of the last successful rule sync"
    );
    describe_gauge!(
        SYNC_PROXY_RULES_LAST_QUEUED_TIMESTAMP_SECONDS,
        Unit::Seconds,
        "Time a rule sync was last requested"
    );
    describe_counter!(
        SYNC_PROXY_RULES_FAILURES_TOTAL,
        "Rule transactions rejected by the backend"
    );
    describe_gauge!(SYNC_PROXY_RULES_RULES, "Rules in the last transaction");
    describe_gauge!(
        SYNC_PROXY_RULES_ACTIVE_CHAINS,
        "Per-service chains in the last transaction"
    );
    describe_gauge!(
        SYNC_PROXY_RULES_NO_LOCAL_ENDPOINTS,
        "Service ports with Local policy and no local endpoints"
    );
    describe_counter!(
        STALE_CHAIN_DELETE_FAILURES_TOTAL,
        "Failed deletions of stale chains"
    );
    describe_histogram!(
        NETWORK_PROGRAMMING_DURATION_SECONDS,
        Unit::Seconds,
        "Time from an endpoint change to its rules being applied"
    );
    describe_counter!(
        ENDPOINT_CHANGES_TOTAL,
        "Endpoint slice changes that produced a delta"
    );
    describe_gauge!(
        ENDPOINT_CHANGES_PENDING,
        "Services with pending endpoint deltas"
    );
    describe_counter!(SERVICE_CHANGES_TOTAL, "Service changes that produced a delta");
    describe_gauge!(SERVICE_CHANGES_PENDING, "Services with pending deltas");
    describe_counter!(
        CONNTRACK_CLEANUP_FAILURES_TOTAL,
        "Failed conntrack entry deletions"
    );
}
