//! Packet-filter backends.
//!
//! The proxier builds one [`Transaction`] per sync pass against the
//! [`RuleBackend`] trait; each backend family applies it atomically.

use async_trait::async_trait;
use thiserror::Error;

use crate::rules::{ObjectKind, Transaction};

pub mod memory;
pub mod nft;

pub use memory::MemoryBackend;
pub use nft::NftBackend;

/// Errors from a rule backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The transaction was rejected as a whole.
    #[error("transaction rejected: {0}")]
    Apply(String),

    /// The table or an object it names does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The transaction is malformed.
    #[error("invalid transaction: {0}")]
    Invalid(String),

    /// The backend command could not be run.
    #[error("backend command failed: {0}")]
    Command(#[from] std::io::Error),

    /// Backend output could not be parsed.
    #[error("failed to parse backend output: {0}")]
    Parse(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

/// A packet-filter backend owning one table.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Start a new, empty transaction.
    fn new_transaction(&self) -> Transaction {
        Transaction::new()
    }

    /// Apply every operation of the transaction, or none.
    async fn run(&self, tx: &Transaction) -> Result<(), BackendError>;

    /// Names of existing objects of one kind in the table.
    async fn list(&self, kind: ObjectKind) -> Result<Vec<String>, BackendError>;
}
