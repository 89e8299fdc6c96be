//! In-process backend.
//!
//! Keeps the table as plain data and applies transactions with the same
//! all-or-nothing semantics and reference checks a kernel backend enforces.
//! Used by tests and by `SVCPROXY_BACKEND=memory` dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{BackendError, RuleBackend};
use crate::rules::{AffinitySet, BaseChain, Object, ObjectKind, Op, Rule, Transaction};

#[derive(Debug, Clone, Default)]
struct MemChain {
    base: Option<BaseChain>,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default)]
struct TableState {
    exists: bool,
    chains: BTreeMap<String, MemChain>,
    sets: BTreeMap<String, AffinitySet>,
}

impl TableState {
    fn apply(&mut self, op: &Op) -> Result<(), BackendError> {
        if !self.exists && !matches!(op, Op::Add(Object::Table { .. })) {
            return Err(BackendError::NotFound("table".to_string()));
        }

        match op {
            Op::Add(Object::Table { .. }) => self.exists = true,
            Op::Add(Object::Chain(chain)) => {
                let entry = self.chains.entry(chain.name.clone()).or_default();
                entry.base = chain.base;
            }
            Op::Add(Object::Set(set)) => match self.sets.get(&set.name) {
                Some(existing) if existing != set => {
                    return Err(BackendError::Apply(format!(
                        "set {} exists with a different definition",
                        set.name
                    )));
                }
                Some(_) => {}
                None => {
                    self.sets.insert(set.name.clone(), set.clone());
                }
            },
            Op::Add(Object::Rule(rule)) => {
                for target in rule.target_chains() {
                    if !self.chains.contains_key(target) {
                        return Err(BackendError::NotFound(format!("chain {}", target)));
                    }
                }
                for set in rule.referenced_sets() {
                    if !self.sets.contains_key(set) {
                        return Err(BackendError::NotFound(format!("set {}", set)));
                    }
                }
                let chain = self
                    .chains
                    .get_mut(&rule.chain)
                    .ok_or_else(|| BackendError::NotFound(format!("chain {}", rule.chain)))?;
                chain.rules.push(rule.clone());
            }
            Op::FlushChain(name) => {
                self.chains
                    .get_mut(name)
                    .ok_or_else(|| BackendError::NotFound(format!("chain {}", name)))?
                    .rules
                    .clear();
            }
            Op::DeleteChain(name) => {
                let chain = self
                    .chains
                    .get(name)
                    .ok_or_else(|| BackendError::NotFound(format!("chain {}", name)))?;
                if !chain.rules.is_empty() {
                    return Err(BackendError::Apply(format!("chain {} is not empty", name)));
                }
                if self.is_chain_referenced(name) {
                    return Err(BackendError::Apply(format!("chain {} is in use", name)));
                }
                self.chains.remove(name);
            }
            Op::DeleteSet(name) => {
                if !self.sets.contains_key(name) {
                    return Err(BackendError::NotFound(format!("set {}", name)));
                }
                if self.is_set_referenced(name) {
                    return Err(BackendError::Apply(format!("set {} is in use", name)));
                }
                self.sets.remove(name);
            }
        }
        Ok(())
    }

    fn is_chain_referenced(&self, name: &str) -> bool {
        self.chains
            .values()
            .flat_map(|c| c.rules.iter())
            .any(|r| r.target_chains().any(|t| t == name))
    }

    fn is_set_referenced(&self, name: &str) -> bool {
        self.chains
            .values()
            .flat_map(|c| c.rules.iter())
            .any(|r| r.referenced_sets().any(|s| s == name))
    }
}

#[derive(Debug, Default)]
struct Inner {
    table: TableState,
    applied: Vec<Transaction>,
    attempts: usize,
    fail_runs: usize,
    fail_lists: bool,
}

/// Backend that applies transactions to an in-memory table.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` transactions.
    pub fn fail_next(&self, n: usize) {
        self.inner.lock().fail_runs = n;
    }

    /// Make `list` fail until turned off again.
    pub fn fail_lists(&self, fail: bool) {
        self.inner.lock().fail_lists = fail;
    }

    /// Transactions applied successfully, oldest first.
    pub fn applied(&self) -> Vec<Transaction> {
        self.inner.lock().applied.clone()
    }

    pub fn last_applied(&self) -> Option<Transaction> {
        self.inner.lock().applied.last().cloned()
    }

    /// Calls to `run`, including rejected ones.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    pub fn has_chain(&self, name: &str) -> bool {
        self.inner.lock().table.chains.contains_key(name)
    }

    pub fn has_set(&self, name: &str) -> bool {
        self.inner.lock().table.sets.contains_key(name)
    }

    pub fn set(&self, name: &str) -> Option<AffinitySet> {
        self.inner.lock().table.sets.get(name).cloned()
    }

    /// Current rules of one chain.
    pub fn rules(&self, chain: &str) -> Vec<Rule> {
        self.inner
            .lock()
            .table
            .chains
            .get(chain)
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.inner.lock().table.chains.keys().cloned().collect()
    }
}

#[async_trait]
impl RuleBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn run(&self, tx: &Transaction) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner.attempts += 1;

        if inner.fail_runs > 0 {
            inner.fail_runs -= 1;
            return Err(BackendError::Apply("injected failure".to_string()));
        }

        let mut next = inner.table.clone();
        for op in tx.ops() {
            next.apply(op)?;
        }
        inner.table = next;
        inner.applied.push(tx.clone());

        debug!(ops = tx.len(), "Applied transaction to memory backend");
        Ok(())
    }

    async fn list(&self, kind: ObjectKind) -> Result<Vec<String>, BackendError> {
        let inner = self.inner.lock();
        if inner.fail_lists {
            return Err(BackendError::Apply("injected list failure".to_string()));
        }
        if !inner.table.exists {
            return Err(BackendError::NotFound("table".to_string()));
        }
        Ok(match kind {
            ObjectKind::Chains => inner.table.chains.keys().cloned().collect(),
            ObjectKind::Sets => inner.table.sets.keys().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{chains, Action, Chain};

    fn base_tx() -> Transaction {
        let mut tx = Transaction::new();
        tx.add_table("test");
        tx.add_chain(Chain::regular(chains::SERVICES));
        tx.add_chain(Chain::regular("service-A/x"));
        tx.add_rule(Rule::new(chains::SERVICES).then(Action::Jump("service-A/x".to_string())));
        tx
    }

    fn affinity(timeout_seconds: u32) -> AffinitySet {
        AffinitySet {
            name: "affinity-A".to_string(),
            ipv6: false,
            timeout_seconds,
        }
    }

    #[tokio::test]
    async fn test_apply_and_list() {
        let backend = MemoryBackend::new();
        backend.run(&base_tx()).await.unwrap();

        let mut listed = backend.list(ObjectKind::Chains).await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["service-A/x", "services"]);
        assert_eq!(backend.rules(chains::SERVICES).len(), 1);
        assert_eq!(backend.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_list_without_table_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.list(ObjectKind::Chains).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failed_transaction_changes_nothing() {
        let backend = MemoryBackend::new();
        backend.run(&base_tx()).await.unwrap();

        let mut tx = Transaction::new();
        tx.flush_chain(chains::SERVICES);
        tx.add_rule(Rule::new(chains::SERVICES).then(Action::Jump("missing".to_string())));
        assert!(backend.run(&tx).await.is_err());

        assert_eq!(backend.rules(chains::SERVICES).len(), 1);
        assert_eq!(backend.applied().len(), 1);
        assert_eq!(backend.attempts(), 2);
    }

    #[tokio::test]
    async fn test_delete_requires_unreferenced_empty_chain() {
        let backend = MemoryBackend::new();
        backend.run(&base_tx()).await.unwrap();

        let mut tx = Transaction::new();
        tx.delete_chain("service-A/x");
        let err = backend.run(&tx).await.unwrap_err();
        assert!(matches!(err, BackendError::Apply(_)));

        let mut tx = Transaction::new();
        tx.flush_chain(chains::SERVICES);
        tx.delete_chain("service-A/x");
        backend.run(&tx).await.unwrap();
        assert!(!backend.has_chain("service-A/x"));
    }

    #[tokio::test]
    async fn test_set_redefinition_needs_delete() {
        let backend = MemoryBackend::new();
        let mut tx = base_tx();
        tx.add_set(affinity(60));
        backend.run(&tx).await.unwrap();

        let mut same = Transaction::new();
        same.add_set(affinity(60));
        backend.run(&same).await.unwrap();

        let mut changed = Transaction::new();
        changed.add_set(affinity(120));
        let err = backend.run(&changed).await.unwrap_err();
        assert!(matches!(err, BackendError::Apply(_)));
        assert_eq!(backend.set("affinity-A").unwrap().timeout_seconds, 60);

        assert!(changed.recreate_set("affinity-A"));
        backend.run(&changed).await.unwrap();
        assert_eq!(backend.set("affinity-A").unwrap().timeout_seconds, 120);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemoryBackend::new();
        backend.fail_next(1);
        assert!(backend.run(&base_tx()).await.is_err());
        backend.run(&base_tx()).await.unwrap();

        backend.fail_lists(true);
        assert!(backend.list(ObjectKind::Sets).await.is_err());
    }
}
