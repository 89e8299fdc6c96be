//! Rule generation.
//!
//! [`build_rules`] turns the materialized services and endpoints into one
//! transaction that rebuilds every chain this proxier owns. It is a pure
//! function of its inputs, so an unchanged cluster yields an identical
//! transaction.
//!
//! Chain layout per service port:
//!
//! ```text
//! services ──(cluster IP)──────────────▶ internal policy chain
//!          ──(external / LB IP)────────▶ external-<svc> ──▶ external policy chain
//! nodeports ──(node port)──────────────▶ external-<svc>
//! firewall ──(LB IP, source ranges)────▶ firewall-<svc>   (drop unlisted sources)
//! service-<svc> / local-<svc> ──(affinity, weighted)──▶ endpoint-<ep> ──▶ dnat
//! services-filter / external-services: reject or drop with no usable endpoint
//! ```

use std::collections::{BTreeMap, BTreeSet};

use svcproxy_networking::IpFamily;

use super::ProxierConfig;
use crate::endpoints::{EndpointInfo, EndpointsMap};
use crate::rules::{
    chains, Action, AffinitySet, BaseChain, Chain, ChainType, Hook, Match, Priority, Rule,
    Transaction,
};
use crate::service::{ServicePortInfo, ServicePortMap};
use crate::topology::categorize_endpoints;

const FILTER_INPUT: &str = "filter-input";
const FILTER_FORWARD: &str = "filter-forward";
const FILTER_OUTPUT: &str = "filter-output";
const NAT_PREROUTING: &str = "nat-prerouting";
const NAT_OUTPUT: &str = "nat-output";
const NAT_POSTROUTING: &str = "nat-postrouting";

const BASE_CHAINS: [(&str, ChainType, Hook, Priority); 6] = [
    (FILTER_INPUT, ChainType::Filter, Hook::Input, Priority::Filter),
    (FILTER_FORWARD, ChainType::Filter, Hook::Forward, Priority::Filter),
    (FILTER_OUTPUT, ChainType::Filter, Hook::Output, Priority::Filter),
    (NAT_PREROUTING, ChainType::Nat, Hook::Prerouting, Priority::DstNat),
    (NAT_OUTPUT, ChainType::Nat, Hook::Output, Priority::DstNat),
    (NAT_POSTROUTING, ChainType::Nat, Hook::Postrouting, Priority::SrcNat),
];

const FIXED_CHAINS: [&str; 8] = [
    chains::SERVICES,
    chains::NODE_PORTS,
    chains::SERVICES_FILTER,
    chains::EXTERNAL_SERVICES,
    chains::FIREWALL,
    chains::MARK_FOR_MASQUERADE,
    chains::MASQUERADING,
    chains::FORWARD,
];

/// Jumps from base chains into the fixed chains: (target, sources, only
/// new connections).
const JUMPS: [(&str, &[&str], bool); 6] = [
    (chains::EXTERNAL_SERVICES, &[FILTER_INPUT, FILTER_FORWARD], true),
    (chains::SERVICES_FILTER, &[FILTER_FORWARD, FILTER_OUTPUT], true),
    (chains::FORWARD, &[FILTER_FORWARD], false),
    (chains::FIREWALL, &[FILTER_INPUT, FILTER_OUTPUT, FILTER_FORWARD], true),
    (chains::SERVICES, &[NAT_OUTPUT, NAT_PREROUTING], false),
    (chains::MASQUERADING, &[NAT_POSTROUTING], false),
];

/// Output of one rule generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltRules {
    pub tx: Transaction,
    /// Per-service and per-endpoint chains referenced by `tx`.
    pub active_chains: BTreeSet<String>,
    /// Affinity sets referenced by `tx`.
    pub active_sets: BTreeSet<String>,
    /// Service ports with Local internal policy and no local endpoints.
    pub no_local_internal: usize,
    /// Service ports with Local external policy and no local endpoints.
    pub no_local_external: usize,
    pub endpoint_chains: usize,
}

/// Generate the transaction for the current state.
pub fn build_rules(
    config: &ProxierConfig,
    services: &ServicePortMap,
    endpoints: &EndpointsMap,
    node_labels: &BTreeMap<String, String>,
) -> BuiltRules {
    let mut w = RuleWriter {
        config,
        out: BuiltRules::default(),
    };

    w.write_base();
    for (name, svc) in services.iter() {
        let eps = endpoints.get(name).unwrap_or_default();
        w.write_service(svc, eps, node_labels);
    }
    w.write_node_ports_jump();

    w.out
}

struct RuleWriter<'a> {
    config: &'a ProxierConfig,
    out: BuiltRules,
}

impl RuleWriter<'_> {
    fn tx(&mut self) -> &mut Transaction {
        &mut self.out.tx
    }

    fn mark(&self) -> u32 {
        self.config.masquerade_mark
    }

    /// Add a chain and clear whatever it held before.
    fn ensure_chain(&mut self, chain: Chain) {
        let name = chain.name.clone();
        self.tx().add_chain(chain);
        self.tx().flush_chain(&name);
    }

    /// Like `ensure_chain`, for per-service chains that are garbage
    /// collected when no longer used.
    fn ensure_service_chain(&mut self, name: &str) {
        if self.out.active_chains.insert(name.to_string()) {
            self.ensure_chain(Chain::regular(name));
        }
    }

    fn add(&mut self, rule: Rule) {
        self.tx().add_rule(rule);
    }

    fn write_base(&mut self) {
        let comment = format!("rules for {}", self.config.table);
        self.tx().add_table(&comment);

        for (name, chain_type, hook, priority) in BASE_CHAINS {
            self.ensure_chain(Chain {
                name: name.to_string(),
                base: Some(BaseChain {
                    chain_type,
                    hook,
                    priority,
                }),
            });
        }
        for name in FIXED_CHAINS {
            self.ensure_chain(Chain::regular(name));
        }

        for (target, sources, new_only) in JUMPS {
            for source in sources {
                let mut rule = Rule::new(source);
                if new_only {
                    rule = rule.matching(Match::CtStateNew);
                }
                self.add(rule.then(Action::Jump(target.to_string())));
            }
        }

        let mark = self.mark();
        self.add(Rule::new(chains::MARK_FOR_MASQUERADE).then(Action::MarkOr(mark)));
        self.add(
            Rule::new(chains::MASQUERADING)
                .matching(Match::MarkUnset(mark))
                .then(Action::Return),
        );
        self.add(Rule::new(chains::MASQUERADING).then(Action::MarkXor(mark)));
        self.add(Rule::new(chains::MASQUERADING).then(Action::Masquerade));

        if !self.config.conntrack_tcp_liberal {
            self.add(
                Rule::new(chains::FORWARD)
                    .matching(Match::CtStateInvalid)
                    .then(Action::Drop),
            );
        }
    }

    fn write_service(
        &mut self,
        svc: &ServicePortInfo,
        eps: &[EndpointInfo],
        node_labels: &BTreeMap<String, String>,
    ) {
        let cat = categorize_endpoints(eps, svc, node_labels);
        let svc_name = svc.name.to_string();
        let has_endpoints = cat.has_any_endpoints;

        let uses_cluster_chain = !cat.cluster.is_empty() && svc.uses_cluster_endpoints();
        let uses_local_chain = !cat.local.is_empty() && svc.uses_local_endpoints();
        let cluster_chain = svc.chains.cluster_policy.as_str();
        let local_chain = svc.chains.local_policy.as_str();

        let (internal_chain, has_internal) = if svc.internal_policy_local() {
            (local_chain, has_endpoints && uses_local_chain)
        } else {
            (cluster_chain, has_endpoints && uses_cluster_chain)
        };
        let (external_policy_chain, has_external) = if svc.external_policy_local() {
            (local_chain, has_endpoints && uses_local_chain)
        } else {
            (cluster_chain, has_endpoints && uses_cluster_chain)
        };
        let external_chain = svc.chains.external.as_str();
        let uses_external_chain = has_endpoints && svc.externally_accessible();

        // Verdicts for traffic that has nowhere to go.
        let verdict = if has_endpoints { Action::Drop } else { Action::Reject };
        if has_endpoints && svc.internal_policy_local() && cat.local.is_empty() {
            self.out.no_local_internal += 1;
        }
        if has_endpoints && svc.external_policy_local() && cat.local.is_empty() {
            self.out.no_local_external += 1;
        }

        for ep in &cat.all_reachable {
            self.ensure_service_chain(&ep.chain_name);
        }
        if uses_cluster_chain {
            self.ensure_service_chain(cluster_chain);
        }
        if uses_local_chain {
            self.ensure_service_chain(local_chain);
        }
        if uses_external_chain {
            self.ensure_service_chain(external_chain);
        }
        let uses_firewall =
            !svc.load_balancer_ips.is_empty() && !svc.load_balancer_source_ranges.is_empty();
        if uses_firewall {
            self.ensure_service_chain(&svc.chains.firewall);
        }

        if let Some(timeout_seconds) = svc.affinity_timeout_seconds {
            for ep in &cat.all_reachable {
                if self.out.active_sets.insert(ep.affinity_set.clone()) {
                    let ipv6 = self.config.family == IpFamily::Ipv6;
                    self.tx().add_set(AffinitySet {
                        name: ep.affinity_set.clone(),
                        ipv6,
                        timeout_seconds,
                    });
                }
            }
        }

        let port_match = Match::DestPort(svc.protocol, svc.port);

        // Cluster IP.
        let cluster_ip_rule = Rule::new(chains::SERVICES)
            .matching(Match::DestAddr(svc.cluster_ip))
            .matching(port_match.clone());
        if has_internal {
            self.add(
                cluster_ip_rule
                    .then(Action::Goto(internal_chain.to_string()))
                    .comment(format!("{} cluster IP", svc_name)),
            );
        } else {
            let mut rule = cluster_ip_rule.then(verdict.clone());
            rule.chain = chains::SERVICES_FILTER.to_string();
            self.add(rule.comment(format!("{} has no endpoints", svc_name)));
        }

        // External IPs.
        for ip in &svc.external_ips {
            let base = Rule::new(chains::SERVICES)
                .matching(Match::DestAddr(*ip))
                .matching(port_match.clone());
            if has_external {
                self.add(
                    base.then(Action::Goto(external_chain.to_string()))
                        .comment(format!("{} external IP", svc_name)),
                );
            } else {
                let mut rule = base.then(verdict.clone());
                rule.chain = chains::EXTERNAL_SERVICES.to_string();
                self.add(rule.comment(format!("{} has no external endpoints", svc_name)));
            }
        }

        // Load-balancer IPs.
        if uses_firewall {
            self.write_firewall(svc, &svc_name);
        }
        for ip in &svc.load_balancer_ips {
            if has_endpoints {
                self.add(
                    Rule::new(chains::SERVICES)
                        .matching(Match::DestAddr(*ip))
                        .matching(port_match.clone())
                        .then(Action::Goto(external_chain.to_string()))
                        .comment(format!("{} load balancer IP", svc_name)),
                );
            }
            if uses_firewall {
                self.add(
                    Rule::new(chains::FIREWALL)
                        .matching(Match::DestAddr(*ip))
                        .matching(port_match.clone())
                        .then(Action::Jump(svc.chains.firewall.clone())),
                );
            }
            if !has_external {
                self.add(
                    Rule::new(chains::EXTERNAL_SERVICES)
                        .matching(Match::DestAddr(*ip))
                        .matching(port_match.clone())
                        .then(verdict.clone())
                        .comment(format!("{} has no external endpoints", svc_name)),
                );
            }
        }

        // Node port.
        if let Some(node_port) = svc.node_port {
            let node_port_match = Match::DestPort(svc.protocol, node_port);
            if has_endpoints {
                self.add(
                    Rule::new(chains::NODE_PORTS)
                        .matching(node_port_match.clone())
                        .then(Action::Goto(external_chain.to_string()))
                        .comment(format!("{} node port", svc_name)),
                );
            }
            if !has_external {
                self.add(
                    Rule::new(chains::EXTERNAL_SERVICES)
                        .matching(Match::DestLocal)
                        .matching(node_port_match)
                        .then(verdict.clone())
                        .comment(format!("{} has no external endpoints", svc_name)),
                );
            }
        }

        // Internal traffic masquerade.
        if has_internal {
            let base = Rule::new(internal_chain)
                .matching(Match::DestAddr(svc.cluster_ip))
                .matching(port_match.clone());
            if self.config.masquerade_all {
                self.add(base.then(Action::Jump(chains::MARK_FOR_MASQUERADE.to_string())));
            } else if let Some(cidr) = self.config.cluster_cidr {
                self.add(
                    base.matching(Match::NotSourcePrefix(cidr))
                        .then(Action::Jump(chains::MARK_FOR_MASQUERADE.to_string())),
                );
            }
        }

        // External traffic.
        if uses_external_chain {
            if !svc.external_policy_local() {
                self.add(
                    Rule::new(external_chain)
                        .then(Action::Jump(chains::MARK_FOR_MASQUERADE.to_string())),
                );
            } else if uses_cluster_chain {
                if let Some(cidr) = self.config.cluster_cidr {
                    self.add(
                        Rule::new(external_chain)
                            .matching(Match::SourcePrefix(cidr))
                            .then(Action::Goto(cluster_chain.to_string()))
                            .comment("short-circuit pod traffic"),
                    );
                }
                self.add(
                    Rule::new(external_chain)
                        .matching(Match::SourceLocal)
                        .then(Action::Jump(chains::MARK_FOR_MASQUERADE.to_string()))
                        .comment("masquerade local traffic"),
                );
                self.add(
                    Rule::new(external_chain)
                        .matching(Match::SourceLocal)
                        .then(Action::Goto(cluster_chain.to_string()))
                        .comment("short-circuit local traffic"),
                );
            }
            if has_external {
                self.add(
                    Rule::new(external_chain).then(Action::Goto(external_policy_chain.to_string())),
                );
            }
        }

        if uses_cluster_chain {
            self.write_dispatch(svc, cluster_chain, &cat.cluster, &svc_name);
        }
        if uses_local_chain {
            self.write_dispatch(svc, local_chain, &cat.local, &svc_name);
        }

        for ep in &cat.all_reachable {
            self.write_endpoint(svc, ep, &svc_name);
        }
    }

    fn write_firewall(&mut self, svc: &ServicePortInfo, svc_name: &str) {
        let chain = svc.chains.firewall.as_str();
        let mut allow_from_node = false;

        for range in &svc.load_balancer_source_ranges {
            if self.config.node_ip.is_some_and(|ip| range.contains(ip)) {
                allow_from_node = true;
            }
            self.add(
                Rule::new(chain)
                    .matching(Match::SourcePrefix(*range))
                    .then(Action::Return),
            );
        }
        // Node-originated requests to a local LB IP carry the LB IP as source.
        if allow_from_node {
            for ip in &svc.load_balancer_ips {
                self.add(
                    Rule::new(chain)
                        .matching(Match::SourceAddr(*ip))
                        .then(Action::Return),
                );
            }
        }
        self.add(
            Rule::new(chain)
                .then(Action::Drop)
                .comment(format!("{} source not allowed", svc_name)),
        );
    }

    /// Session affinity first, then weighted random selection: rule `i` of
    /// `n` matches with probability `1 / (n - i)`, the last always.
    fn write_dispatch(
        &mut self,
        svc: &ServicePortInfo,
        chain: &str,
        eps: &[&EndpointInfo],
        svc_name: &str,
    ) {
        if svc.affinity_timeout_seconds.is_some() {
            for ep in eps {
                self.add(
                    Rule::new(chain)
                        .matching(Match::InAffinitySet(ep.affinity_set.clone()))
                        .then(Action::Goto(ep.chain_name.clone())),
                );
            }
        }

        let n = eps.len();
        for (i, ep) in eps.iter().enumerate() {
            let mut rule = Rule::new(chain);
            if i + 1 < n {
                rule = rule.matching(Match::Random {
                    denominator: n - i,
                });
            }
            self.add(
                rule.then(Action::Goto(ep.chain_name.clone()))
                    .comment(format!("{} -> {}", svc_name, ep)),
            );
        }
    }

    fn write_endpoint(&mut self, svc: &ServicePortInfo, ep: &EndpointInfo, svc_name: &str) {
        let chain = ep.chain_name.as_str();
        self.out.endpoint_chains += 1;

        // Hairpin: an endpoint reaching itself through the service.
        self.add(
            Rule::new(chain)
                .matching(Match::SourceAddr(ep.addr.ip()))
                .then(Action::Jump(chains::MARK_FOR_MASQUERADE.to_string())),
        );
        if svc.affinity_timeout_seconds.is_some() {
            self.add(Rule::new(chain).then(Action::RecordAffinity(ep.affinity_set.clone())));
        }
        self.add(
            Rule::new(chain)
                .matching(Match::Protocol(svc.protocol))
                .then(Action::Dnat(ep.addr))
                .comment(svc_name.to_string()),
        );
    }

    /// Last rule of `services`: anything addressed to this node goes on to
    /// the node port chain.
    fn write_node_ports_jump(&mut self) {
        let family = self.config.family;
        if self.config.node_port_addresses.is_empty() {
            self.add(
                Rule::new(chains::SERVICES)
                    .matching(Match::DestLocal)
                    .matching(Match::NotDestPrefix(family.loopback()))
                    .then(Action::Jump(chains::NODE_PORTS.to_string()))
                    .comment("node ports"),
            );
            return;
        }

        let prefixes: Vec<_> = self
            .config
            .node_port_addresses
            .iter()
            .filter(|p| p.family() == family)
            .copied()
            .collect();
        for prefix in prefixes {
            self.add(
                Rule::new(chains::SERVICES)
                    .matching(Match::DestPrefix(prefix))
                    .matching(Match::DestLocal)
                    .then(Action::Jump(chains::NODE_PORTS.to_string()))
                    .comment("node ports"),
            );
        }
    }
}
