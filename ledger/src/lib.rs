//! Fund-custody ledger
//!
//! Every agent balance is split into three partitions: `available`
//! (spendable), `pending` (two-phase holds awaiting external settlement)
//! and `escrowed` (locked for conditional release to a counterparty), with
//! an integrated credit line shadowing the partitions. All mutations append
//! immutable history entries and authoritative replay events; per-agent
//! fund conservation (`total_in - total_out = available + pending +
//! escrowed`) holds at every quiescent point.

#![allow(clippy::too_many_arguments)]

pub mod audit;
pub mod balance;
pub mod entry;
pub mod error;
pub mod event;
pub mod service;
pub mod store;

pub use audit::{AuditRecord, AuditSink};
pub use balance::AgentBalance;
pub use entry::{EntryId, EntryType, LedgerEntry};
pub use error::LedgerError;
pub use event::{rebuild_balance, LedgerEvent};
pub use service::{Ledger, LedgerService, ReconcileReport};
pub use store::{CreditInfo, LedgerStore, MemoryLedgerStore, PostgresLedgerStore};
