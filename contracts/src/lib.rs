//! SLA contract engine
//!
//! Per-contract coordinator binding payments to per-call success: a buyer's
//! budget is escrowed on accept, released to the seller one micro-payment
//! per successful call, and evaluated against a rolling success-rate window
//! after every call. Terminal transitions (completed, violated, terminated,
//! rejected) each perform their compensating escrow moves exactly once.

pub mod contract;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod store;

pub use contract::{
    CallStatus, Contract, ContractCall, ContractProposal, ContractStatus, ViolationDetails,
};
pub use engine::{CallOutcome, ContractEngine};
pub use error::ContractError;
pub use expiry::{ExpirationChecker, DEFAULT_EXPIRATION_INTERVAL};
pub use store::{ContractStore, MemoryContractStore, PostgresContractStore};
