use pact_common::{AddressError, Amount, AmountError, Cancelled, StorageError};
use thiserror::Error;

use crate::entry::{EntryId, EntryType};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance: need {need}, have {have}")]
    InsufficientBalance { need: Amount, have: Amount },

    #[error("credit limit {limit} is below used credit {used}")]
    CreditLimitBelowUsed { limit: Amount, used: Amount },

    #[error("credit draw {need} exceeds available credit {available}")]
    CreditExhausted { need: Amount, available: Amount },

    #[error("balance overflow")]
    Overflow,

    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("deposit already recorded for tx {0}")]
    DuplicateDeposit(String),

    #[error("refund already recorded for reference {0}")]
    DuplicateRefund(String),

    #[error("ledger entry {0} not found")]
    EntryNotFound(EntryId),

    #[error("ledger entry {0} already reversed")]
    AlreadyReversed(EntryId),

    #[error("entry type {0} is not reversible")]
    NotReversible(EntryType),

    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The partition mutation committed but a post-commit side effect
    /// (audit append) failed. The mutation must NOT be compensated; the
    /// discrepancy is surfaced through reconciliation.
    #[error("post-commit {what} append failed for {reference}: {source}")]
    PostCommit {
        what: &'static str,
        reference: String,
        source: StorageError,
    },
}

impl LedgerError {
    /// True when the underlying mutation was applied despite the error.
    ///
    /// Compensation logic must skip errors for which this returns true:
    /// issuing the inverse move would double-apply.
    pub fn is_applied(&self) -> bool {
        matches!(self, LedgerError::PostCommit { .. })
    }
}

impl From<Cancelled> for LedgerError {
    fn from(_: Cancelled) -> Self {
        LedgerError::Cancelled
    }
}
