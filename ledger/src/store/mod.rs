//! Ledger storage backends
//!
//! A backend owns the single-agent serialization scope: every mutating
//! operation performs its read-compute-write and the history/event appends
//! as one unit. Partition-reducing operations guard conditionally (no
//! pre-read decisions) so a lost race surfaces as `InsufficientBalance`
//! with no side effect.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

use async_trait::async_trait;
use pact_common::{AgentAddr, Amount, CallContext};
use serde::{Deserialize, Serialize};

use crate::balance::AgentBalance;
use crate::entry::{EntryId, LedgerEntry};
use crate::error::LedgerError;
use crate::event::LedgerEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditInfo {
    pub credit_limit: Amount,
    pub credit_used: Amount,
    pub available_credit: Amount,
}

#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    // --- custody mutations -------------------------------------------------

    /// Credit `available`; idempotent per `tx_hash`. Outstanding credit is
    /// auto-repaid first, reducing the amount that reaches `available`.
    async fn deposit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError>;

    async fn withdraw(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError>;

    /// Debit `available`, drawing the gap from the credit line when the
    /// partition alone cannot cover the amount.
    async fn spend(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    /// Credit `available` back; idempotent per `reference`.
    async fn refund(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    /// Reserve funds into `pending`, credit-drawing the gap like `spend`.
    /// A credit draw is remembered as a shadow keyed by `addr:reference`.
    async fn hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    /// Burn a pending reservation (external settlement happened). Credit
    /// stays drawn; the shadow is dropped.
    async fn confirm_hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    /// Return a pending reservation to `available`, reversing any credit
    /// drawn for it.
    async fn release_hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    async fn escrow_lock(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    /// Move escrowed funds to the counterparty's `available`. Both row
    /// updates commit as one atomic unit.
    async fn release_escrow(
        &self,
        ctx: &CallContext,
        from: &AgentAddr,
        to: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn refund_escrow(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    /// Settle a pending hold into a seller amount plus a platform fee.
    async fn settle_hold_with_fee(
        &self,
        ctx: &CallContext,
        buyer: &AgentAddr,
        seller: &AgentAddr,
        seller_amount: Amount,
        platform: &AgentAddr,
        fee: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn set_credit_limit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        limit: Amount,
    ) -> Result<AgentBalance, LedgerError>;

    async fn use_credit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    async fn repay_credit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError>;

    /// Apply the inverse partition move of an existing entry and append the
    /// compensating `reversal_*` entry.
    async fn reverse(
        &self,
        ctx: &CallContext,
        entry_id: EntryId,
        reason: &str,
        admin: &str,
    ) -> Result<LedgerEntry, LedgerError>;

    // --- reads -------------------------------------------------------------

    /// Zero balance for unknown agents; rows are only materialized on the
    /// first mutation.
    async fn get_balance(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<AgentBalance, LedgerError>;

    async fn get_credit_info(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<CreditInfo, LedgerError>;

    /// Newest-first page of history entries
    async fn get_history(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn entries_by_reference(
        &self,
        ctx: &CallContext,
        reference: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn has_deposit(&self, ctx: &CallContext, tx_hash: &str) -> Result<bool, LedgerError>;

    async fn get_entry(
        &self,
        ctx: &CallContext,
        entry_id: EntryId,
    ) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Full event stream for an agent, insertion order
    async fn events_for(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<Vec<LedgerEvent>, LedgerError>;
}
