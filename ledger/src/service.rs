//! Ledger service
//!
//! Wraps a storage backend with boundary normalization (addresses are
//! lowercased, amounts validated upstream), optional audit decoration and
//! the replay-based reconciliation read. The service also exposes
//! [`LedgerService`], the operation subset the contract and verification
//! layers are permitted to consume.

use std::sync::Arc;

use async_trait::async_trait;
use log::error;
use pact_common::{now_millis, AgentAddr, Amount, CallContext};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditRecord, AuditSink};
use crate::balance::AgentBalance;
use crate::entry::{EntryId, LedgerEntry};
use crate::error::LedgerError;
use crate::event::rebuild_balance;
use crate::store::{CreditInfo, LedgerStore};

/// Result of replaying an agent's event stream against its stored balance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub agent_addr: AgentAddr,
    pub stored: AgentBalance,
    pub replayed: AgentBalance,
    pub matches: bool,
}

impl ReconcileReport {
    /// Partitions that differ, as `(name, stored, replayed)`
    pub fn mismatches(&self) -> Vec<(&'static str, Amount, Amount)> {
        let pairs = [
            ("available", self.stored.available, self.replayed.available),
            ("pending", self.stored.pending, self.replayed.pending),
            ("escrowed", self.stored.escrowed, self.replayed.escrowed),
            (
                "creditLimit",
                self.stored.credit_limit,
                self.replayed.credit_limit,
            ),
            (
                "creditUsed",
                self.stored.credit_used,
                self.replayed.credit_used,
            ),
            ("totalIn", self.stored.total_in, self.replayed.total_in),
            ("totalOut", self.stored.total_out, self.replayed.total_out),
        ];
        pairs
            .into_iter()
            .filter(|(_, stored, replayed)| stored != replayed)
            .collect()
    }
}

/// The ledger operation subset consumed by the contract and verification
/// engines. Addresses are case-insensitive strings at this seam.
#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn deposit(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<(), LedgerError>;

    async fn hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn confirm_hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn release_hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn escrow_lock(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn release_escrow(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn refund_escrow(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;
}

pub struct Ledger<S: LedgerStore> {
    store: Arc<S>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl<S: LedgerStore> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, audit: None }
    }

    pub fn with_audit(store: Arc<S>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            audit: Some(audit),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn snapshot(&self, ctx: &CallContext, addr: &AgentAddr) -> Option<AgentBalance> {
        if self.audit.is_none() {
            return None;
        }
        self.store.get_balance(ctx, addr).await.ok()
    }

    /// Append an audit record after a committed mutation. A failing sink is
    /// reported as `PostCommit`: the mutation stands, reconciliation will
    /// surface the gap.
    #[allow(clippy::too_many_arguments)]
    async fn audit_applied(
        &self,
        ctx: &CallContext,
        operation: &str,
        addr: &AgentAddr,
        counterparty: Option<&AgentAddr>,
        amount: Amount,
        reference: &str,
        before: Option<AgentBalance>,
        after: Option<AgentBalance>,
    ) -> Result<(), LedgerError> {
        let Some(sink) = &self.audit else {
            return Ok(());
        };
        let record = AuditRecord {
            actor: ctx.actor().cloned(),
            operation: operation.to_string(),
            agent_addr: addr.clone(),
            counterparty: counterparty.cloned(),
            amount,
            reference: reference.to_string(),
            before,
            after,
            created_at: now_millis(),
        };
        sink.record(record).await.map_err(|source| {
            error!(
                "CRITICAL: audit append failed after committed {} '{}' for {}: {}",
                operation, reference, addr, source
            );
            LedgerError::PostCommit {
                what: "audit",
                reference: reference.to_string(),
                source,
            }
        })
    }

    pub async fn deposit(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.deposit(ctx, &addr, amount, tx_hash).await?;
        self.audit_applied(
            ctx,
            "deposit",
            &addr,
            None,
            amount,
            tx_hash,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn withdraw(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.withdraw(ctx, &addr, amount, tx_hash).await?;
        self.audit_applied(
            ctx,
            "withdraw",
            &addr,
            None,
            amount,
            tx_hash,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn spend(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.spend(ctx, &addr, amount, reference).await?;
        self.audit_applied(
            ctx,
            "spend",
            &addr,
            None,
            amount,
            reference,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn refund(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.refund(ctx, &addr, amount, reference).await?;
        self.audit_applied(
            ctx,
            "refund",
            &addr,
            None,
            amount,
            reference,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.hold(ctx, &addr, amount, reference).await?;
        self.audit_applied(
            ctx,
            "hold",
            &addr,
            None,
            amount,
            reference,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn confirm_hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.confirm_hold(ctx, &addr, amount, reference).await?;
        self.audit_applied(
            ctx,
            "confirm_hold",
            &addr,
            None,
            amount,
            reference,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn release_hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.release_hold(ctx, &addr, amount, reference).await?;
        self.audit_applied(
            ctx,
            "release_hold",
            &addr,
            None,
            amount,
            reference,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn escrow_lock(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.escrow_lock(ctx, &addr, amount, reference).await?;
        self.audit_applied(
            ctx,
            "escrow_lock",
            &addr,
            None,
            amount,
            reference,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn release_escrow(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let from = AgentAddr::new(from)?;
        let to = AgentAddr::new(to)?;
        let before = self.snapshot(ctx, &from).await;
        self.store
            .release_escrow(ctx, &from, &to, amount, reference)
            .await?;
        let after = self.snapshot(ctx, &from).await;
        self.audit_applied(
            ctx,
            "release_escrow",
            &from,
            Some(&to),
            amount,
            reference,
            before,
            after,
        )
        .await
    }

    pub async fn refund_escrow(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.refund_escrow(ctx, &addr, amount, reference).await?;
        self.audit_applied(
            ctx,
            "refund_escrow",
            &addr,
            None,
            amount,
            reference,
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn settle_hold_with_fee(
        &self,
        ctx: &CallContext,
        buyer: &str,
        seller: &str,
        seller_amount: Amount,
        platform: &str,
        fee: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let buyer = AgentAddr::new(buyer)?;
        let seller = AgentAddr::new(seller)?;
        let platform = AgentAddr::new(platform)?;
        let before = self.snapshot(ctx, &buyer).await;
        self.store
            .settle_hold_with_fee(ctx, &buyer, &seller, seller_amount, &platform, fee, reference)
            .await?;
        let after = self.snapshot(ctx, &buyer).await;
        let total = seller_amount
            .checked_add(fee)
            .ok_or(LedgerError::Overflow)?;
        self.audit_applied(
            ctx,
            "settle_hold_with_fee",
            &buyer,
            Some(&seller),
            total,
            reference,
            before,
            after,
        )
        .await
    }

    pub async fn set_credit_limit(
        &self,
        ctx: &CallContext,
        addr: &str,
        limit: Amount,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let before = self.snapshot(ctx, &addr).await;
        let balance = self.store.set_credit_limit(ctx, &addr, limit).await?;
        self.audit_applied(
            ctx,
            "set_credit_limit",
            &addr,
            None,
            limit,
            "credit_limit",
            before,
            Some(balance.clone()),
        )
        .await?;
        Ok(balance)
    }

    pub async fn use_credit(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        self.store.use_credit(ctx, &addr, amount, reference).await
    }

    pub async fn repay_credit(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        self.store.repay_credit(ctx, &addr, amount, reference).await
    }

    pub async fn get_credit_info(
        &self,
        ctx: &CallContext,
        addr: &str,
    ) -> Result<CreditInfo, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        self.store.get_credit_info(ctx, &addr).await
    }

    /// Reverse an entry: apply the inverse partition move and append the
    /// compensating `reversal_*` entry. The original is left untouched on
    /// any failure.
    pub async fn reverse(
        &self,
        ctx: &CallContext,
        entry_id: EntryId,
        reason: &str,
        admin: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = self.store.reverse(ctx, entry_id, reason, admin).await?;
        self.audit_applied(
            ctx,
            "reverse",
            &entry.agent_addr,
            None,
            entry.amount,
            &entry.reference,
            None,
            None,
        )
        .await?;
        Ok(entry)
    }

    pub async fn get_balance(
        &self,
        ctx: &CallContext,
        addr: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        self.store.get_balance(ctx, &addr).await
    }

    pub async fn get_history(
        &self,
        ctx: &CallContext,
        addr: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        self.store.get_history(ctx, &addr, limit, offset).await
    }

    pub async fn entries_by_reference(
        &self,
        ctx: &CallContext,
        reference: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.entries_by_reference(ctx, reference).await
    }

    pub async fn has_deposit(
        &self,
        ctx: &CallContext,
        tx_hash: &str,
    ) -> Result<bool, LedgerError> {
        self.store.has_deposit(ctx, tx_hash).await
    }

    pub async fn get_entry(
        &self,
        ctx: &CallContext,
        entry_id: EntryId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        self.store.get_entry(ctx, entry_id).await
    }

    /// Replay the event stream and compare against the stored balance
    pub async fn reconcile_agent(
        &self,
        ctx: &CallContext,
        addr: &str,
    ) -> Result<ReconcileReport, LedgerError> {
        let addr = AgentAddr::new(addr)?;
        let stored = self.store.get_balance(ctx, &addr).await?;
        let events = self.store.events_for(ctx, &addr).await?;
        let replayed = rebuild_balance(&addr, &events);
        let matches = stored.available == replayed.available
            && stored.pending == replayed.pending
            && stored.escrowed == replayed.escrowed
            && stored.credit_limit == replayed.credit_limit
            && stored.credit_used == replayed.credit_used
            && stored.total_in == replayed.total_in
            && stored.total_out == replayed.total_out;
        Ok(ReconcileReport {
            agent_addr: addr,
            stored,
            replayed,
            matches,
        })
    }
}

#[async_trait]
impl<S: LedgerStore> LedgerService for Ledger<S> {
    async fn deposit(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<(), LedgerError> {
        Ledger::deposit(self, ctx, addr, amount, tx_hash).await.map(|_| ())
    }

    async fn hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        Ledger::hold(self, ctx, addr, amount, reference).await.map(|_| ())
    }

    async fn confirm_hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        Ledger::confirm_hold(self, ctx, addr, amount, reference)
            .await
            .map(|_| ())
    }

    async fn release_hold(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        Ledger::release_hold(self, ctx, addr, amount, reference)
            .await
            .map(|_| ())
    }

    async fn escrow_lock(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        Ledger::escrow_lock(self, ctx, addr, amount, reference)
            .await
            .map(|_| ())
    }

    async fn release_escrow(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        Ledger::release_escrow(self, ctx, from, to, amount, reference).await
    }

    async fn refund_escrow(
        &self,
        ctx: &CallContext,
        addr: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        Ledger::refund_escrow(self, ctx, addr, amount, reference)
            .await
            .map(|_| ())
    }
}
