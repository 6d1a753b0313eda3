use pact_common::{AddressError, Amount, AmountError, Cancelled, StorageError};
use pact_ledger::LedgerError;
use thiserror::Error;

use crate::policy::EvaluationResult;
use crate::providers::ProviderError;
use crate::verification::VerificationStatus;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification {0} not found")]
    VerificationNotFound(String),

    #[error("agent {0} is not verified")]
    NotVerified(String),

    #[error("agent {0} already holds an open verification")]
    AlreadyVerified(String),

    #[error("agent not eligible: {reason}")]
    NotEligible {
        reason: String,
        evaluation: EvaluationResult,
    },

    #[error("bond {offered} below the tier minimum {minimum}")]
    BondTooLow { minimum: Amount, offered: Amount },

    #[error("verification is {actual}, expected {expected}")]
    InvalidStatus {
        expected: &'static str,
        actual: VerificationStatus,
    },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for VerificationError {
    fn from(_: Cancelled) -> Self {
        VerificationError::Cancelled
    }
}
