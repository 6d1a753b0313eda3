use pact_common::duration::DurationError;
use pact_common::{AddressError, Amount, AmountError, Cancelled, StorageError};
use pact_ledger::LedgerError;
use thiserror::Error;

use crate::contract::ContractStatus;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("contract {0} not found")]
    ContractNotFound(String),

    #[error("contract {id} already resolved ({status})")]
    AlreadyResolved { id: String, status: ContractStatus },

    #[error("contract is {actual}, expected {expected}")]
    InvalidStatus {
        expected: &'static str,
        actual: ContractStatus,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("budget exhausted: {remaining} remaining, {price} per call")]
    BudgetExhausted { remaining: Amount, price: Amount },

    #[error("buyer and seller must be distinct")]
    SameParty,

    #[error("invalid duration: {0}")]
    InvalidDuration(#[from] DurationError),

    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for ContractError {
    fn from(_: Cancelled) -> Self {
        ContractError::Cancelled
    }
}
