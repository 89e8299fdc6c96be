//! Declarative rule model.
//!
//! A sync pass produces one [`Transaction`]: an ordered list of add, flush
//! and delete operations on chains, affinity sets and rules inside a single
//! table. Backends apply a transaction atomically. Nothing here knows a
//! concrete rule syntax; see `backend::nft` for the nftables rendering.

use std::net::{IpAddr, SocketAddr};

use svcproxy_api::Protocol;
use svcproxy_networking::IpPrefix;

// ============================================================================
// Names
// ============================================================================

/// Default table name.
pub const DEFAULT_TABLE: &str = "svcproxy";

/// Fixed chains jumped to from the base chains.
pub mod chains {
    pub const SERVICES: &str = "services";
    pub const NODE_PORTS: &str = "nodeports";
    pub const SERVICES_FILTER: &str = "services-filter";
    pub const EXTERNAL_SERVICES: &str = "external-services";
    pub const FIREWALL: &str = "firewall";
    pub const MARK_FOR_MASQUERADE: &str = "mark-for-masquerade";
    pub const MASQUERADING: &str = "masquerading";
    pub const FORWARD: &str = "forward";
}

pub const SERVICE_CHAIN_PREFIX: &str = "service-";
pub const LOCAL_CHAIN_PREFIX: &str = "local-";
pub const EXTERNAL_CHAIN_PREFIX: &str = "external-";
pub const FIREWALL_CHAIN_PREFIX: &str = "firewall-";
pub const ENDPOINT_CHAIN_PREFIX: &str = "endpoint-";
pub const AFFINITY_SET_PREFIX: &str = "affinity-";

// ============================================================================
// Objects
// ============================================================================

/// Netfilter hook a base chain attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

/// Base chain type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    Filter,
    Nat,
}

/// Named hook priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Filter,
    DstNat,
    SrcNat,
}

/// Attachment of a base chain to a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseChain {
    pub chain_type: ChainType,
    pub hook: Hook,
    pub priority: Priority,
}

/// A chain; regular unless `base` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub base: Option<BaseChain>,
}

impl Chain {
    pub fn regular(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base: None,
        }
    }
}

/// A dynamic set of client addresses with per-element expiry, used for
/// session affinity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinitySet {
    pub name: String,
    pub ipv6: bool,
    pub timeout_seconds: u32,
}

/// Packet match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    DestAddr(IpAddr),
    SourceAddr(IpAddr),
    SourcePrefix(IpPrefix),
    NotSourcePrefix(IpPrefix),
    DestPrefix(IpPrefix),
    NotDestPrefix(IpPrefix),
    /// L4 protocol.
    Protocol(Protocol),
    /// L4 protocol and destination port.
    DestPort(Protocol, u16),
    /// Destination is an address of this node.
    DestLocal,
    /// Source is an address of this node.
    SourceLocal,
    CtStateNew,
    CtStateInvalid,
    /// None of the given mark bits are set.
    MarkUnset(u32),
    /// Matches with probability `1 / denominator`.
    Random { denominator: usize },
    /// Source address is in the named affinity set.
    InAffinitySet(String),
}

/// Rule statement; the last one is usually a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Jump(String),
    Goto(String),
    Return,
    Drop,
    Reject,
    /// Set the given mark bits.
    MarkOr(u32),
    /// Toggle the given mark bits.
    MarkXor(u32),
    Masquerade,
    /// Add or refresh the source address in the named affinity set.
    RecordAffinity(String),
    Dnat(SocketAddr),
}

impl Action {
    /// Chain this action transfers control to, if any.
    pub fn target_chain(&self) -> Option<&str> {
        match self {
            Action::Jump(c) | Action::Goto(c) => Some(c),
            _ => None,
        }
    }

    /// Affinity set this action writes to, if any.
    pub fn affinity_set(&self) -> Option<&str> {
        match self {
            Action::RecordAffinity(s) => Some(s),
            _ => None,
        }
    }
}

/// A rule appended to a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: String,
    pub matches: Vec<Match>,
    pub actions: Vec<Action>,
    pub comment: Option<String>,
}

impl Rule {
    pub fn new(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            matches: Vec::new(),
            actions: Vec::new(),
            comment: None,
        }
    }

    pub fn matching(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Chains this rule references.
    pub fn target_chains(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(Action::target_chain)
    }

    /// Affinity sets this rule references.
    pub fn referenced_sets(&self) -> impl Iterator<Item = &str> {
        self.matches
            .iter()
            .filter_map(|m| match m {
                Match::InAffinitySet(s) => Some(s.as_str()),
                _ => None,
            })
            .chain(self.actions.iter().filter_map(Action::affinity_set))
    }
}

/// Anything a transaction can add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Table { comment: String },
    Chain(Chain),
    Set(AffinitySet),
    Rule(Rule),
}

/// Listable object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Chains,
    Sets,
}

/// One transaction operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Add(Object),
    FlushChain(String),
    DeleteChain(String),
    DeleteSet(String),
}

// ============================================================================
// Transaction
// ============================================================================

/// An ordered batch of operations applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, comment: &str) {
        self.ops.push(Op::Add(Object::Table {
            comment: comment.to_string(),
        }));
    }

    pub fn add_chain(&mut self, chain: Chain) {
        self.ops.push(Op::Add(Object::Chain(chain)));
    }

    pub fn add_set(&mut self, set: AffinitySet) {
        self.ops.push(Op::Add(Object::Set(set)));
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.ops.push(Op::Add(Object::Rule(rule)));
    }

    pub fn flush_chain(&mut self, name: &str) {
        self.ops.push(Op::FlushChain(name.to_string()));
    }

    pub fn delete_chain(&mut self, name: &str) {
        self.ops.push(Op::DeleteChain(name.to_string()));
    }

    pub fn delete_set(&mut self, name: &str) {
        self.ops.push(Op::DeleteSet(name.to_string()));
    }

    /// Delete set `name` right before this transaction adds it again, so a
    /// changed definition replaces the programmed one. Returns false if the
    /// transaction does not add the set.
    pub fn recreate_set(&mut self, name: &str) -> bool {
        let pos = self
            .ops
            .iter()
            .position(|op| matches!(op, Op::Add(Object::Set(s)) if s.name == name));
        match pos {
            Some(pos) => {
                self.ops.insert(pos, Op::DeleteSet(name.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Rules added by this transaction.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.ops.iter().filter_map(|op| match op {
            Op::Add(Object::Rule(r)) => Some(r),
            _ => None,
        })
    }

    /// Sets added by this transaction.
    pub fn sets(&self) -> impl Iterator<Item = &AffinitySet> {
        self.ops.iter().filter_map(|op| match op {
            Op::Add(Object::Set(s)) => Some(s),
            _ => None,
        })
    }

    /// Rules added to one chain, in order.
    pub fn rules_in<'a>(&'a self, chain: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules().filter(move |r| r.chain == chain)
    }

    pub fn rule_count(&self) -> usize {
        self.rules().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_builder_and_references() {
        let rule = Rule::new("service-X")
            .matching(Match::InAffinitySet("affinity-A".to_string()))
            .then(Action::Jump("endpoint-A".to_string()))
            .comment("ns/svc:http -> 10.0.0.1:80");

        assert_eq!(rule.target_chains().collect::<Vec<_>>(), vec!["endpoint-A"]);
        assert_eq!(rule.referenced_sets().collect::<Vec<_>>(), vec!["affinity-A"]);
        assert_eq!(rule.comment.as_deref(), Some("ns/svc:http -> 10.0.0.1:80"));
    }

    #[test]
    fn test_transaction_rule_queries() {
        let mut tx = Transaction::new();
        tx.add_table("rules for svcproxy");
        tx.add_chain(Chain::regular(chains::SERVICES));
        tx.flush_chain(chains::SERVICES);
        tx.add_rule(Rule::new(chains::SERVICES).then(Action::Drop));
        tx.add_rule(Rule::new(chains::FORWARD).then(Action::Drop));

        assert_eq!(tx.len(), 5);
        assert_eq!(tx.rule_count(), 2);
        assert_eq!(tx.rules_in(chains::SERVICES).count(), 1);
    }

    #[test]
    fn test_recreate_set_deletes_before_add() {
        let set = AffinitySet {
            name: "affinity-A".to_string(),
            ipv6: false,
            timeout_seconds: 120,
        };
        let mut tx = Transaction::new();
        tx.flush_chain("service-X");
        tx.add_set(set.clone());

        assert!(tx.recreate_set("affinity-A"));
        assert!(!tx.recreate_set("affinity-B"));
        assert_eq!(
            tx.ops(),
            &[
                Op::FlushChain("service-X".to_string()),
                Op::DeleteSet("affinity-A".to_string()),
                Op::Add(Object::Set(set.clone())),
            ]
        );
        assert_eq!(tx.sets().collect::<Vec<_>>(), vec![&set]);
    }
}
