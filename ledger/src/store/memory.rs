//! In-memory ledger backend for demo and test use
//!
//! A single `RwLock` guards the balance map plus history list: reads take
//! the shared side, every partition-changing operation takes the exclusive
//! side and performs its read-compute-write, history append and event
//! append inside one critical section. Release-escrow and settlement touch
//! both parties under the same guard, so the two row updates are one
//! atomic unit.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use log::trace;
use pact_common::{now_millis, AgentAddr, Amount, AmountError, CallContext, StorageError};
use tokio::sync::RwLock;

use crate::balance::AgentBalance;
use crate::entry::{EntryId, EntryType, LedgerEntry};
use crate::error::LedgerError;
use crate::event::LedgerEvent;
use crate::store::{CreditInfo, LedgerStore};

#[derive(Default)]
struct MemoryState {
    balances: HashMap<AgentAddr, AgentBalance>,
    entries: Vec<LedgerEntry>,
    events: Vec<LedgerEvent>,
    deposit_hashes: HashSet<String>,
    refund_refs: HashSet<String>,
    /// Credit drawn for an open hold, keyed `addr:reference`
    shadows: HashMap<String, Amount>,
    next_entry_id: EntryId,
}

impl MemoryState {
    fn balance(&self, addr: &AgentAddr) -> AgentBalance {
        self.balances
            .get(addr)
            .cloned()
            .unwrap_or_else(|| AgentBalance::zeroed(addr.clone()))
    }

    fn commit(&mut self, balance: AgentBalance) {
        self.balances.insert(balance.agent_addr.clone(), balance);
    }

    fn append(
        &mut self,
        addr: &AgentAddr,
        entry_type: EntryType,
        amount: Amount,
        reference: &str,
        description: &str,
        reversal_of: Option<EntryId>,
    ) -> EntryId {
        self.next_entry_id += 1;
        let id = self.next_entry_id;
        let created_at = now_millis();
        self.entries.push(LedgerEntry {
            id,
            agent_addr: addr.clone(),
            entry_type,
            amount,
            reference: reference.to_string(),
            description: description.to_string(),
            reversal_of,
            created_at,
        });
        self.events.push(LedgerEvent {
            seq: id as u64,
            agent_addr: addr.clone(),
            entry_type,
            amount,
            reference: reference.to_string(),
            created_at,
        });
        id
    }
}

fn shadow_key(addr: &AgentAddr, reference: &str) -> String {
    format!("{}:{}", addr, reference)
}

fn ensure_positive(amount: Amount) -> Result<(), LedgerError> {
    if amount.is_zero() {
        return Err(LedgerError::InvalidAmount(AmountError::NotPositive));
    }
    Ok(())
}

pub struct MemoryLedgerStore {
    inner: RwLock<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn deposit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;
        if state.deposit_hashes.contains(tx_hash) {
            return Err(LedgerError::DuplicateDeposit(tx_hash.to_string()));
        }

        let mut balance = state.balance(addr);
        balance.add_available(amount)?;
        balance.add_total_in(amount)?;
        // Outstanding credit is repaid before the deposit reaches available
        let repay = amount.min(balance.credit_used);
        if !repay.is_zero() {
            balance.repay_credit(repay)?;
        }
        balance.touch();

        state.deposit_hashes.insert(tx_hash.to_string());
        state.append(addr, EntryType::Deposit, amount, tx_hash, "deposit", None);
        if !repay.is_zero() {
            state.append(
                addr,
                EntryType::CreditRepay,
                repay,
                tx_hash,
                "auto repay on deposit",
                None,
            );
        }
        state.commit(balance.clone());
        trace!("deposit {} to {}", amount, addr);
        Ok(balance)
    }

    async fn withdraw(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        balance.sub_available(amount)?;
        balance.add_total_out(amount)?;
        balance.touch();

        state.append(
            addr,
            EntryType::Withdrawal,
            amount,
            tx_hash,
            "withdrawal",
            None,
        );
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn spend(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        let gap = amount.saturating_sub(balance.available);
        if !gap.is_zero() && gap > balance.available_credit() {
            return Err(LedgerError::InsufficientBalance {
                need: amount,
                have: balance.spendable(),
            });
        }
        if !gap.is_zero() {
            balance.draw_credit(gap)?;
        }
        balance.sub_available(amount)?;
        balance.add_total_out(amount)?;
        balance.touch();

        if !gap.is_zero() {
            state.append(
                addr,
                EntryType::CreditDraw,
                gap,
                reference,
                "credit draw for spend",
                None,
            );
        }
        state.append(addr, EntryType::Spend, amount, reference, "spend", None);
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn refund(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;
        if state.refund_refs.contains(reference) {
            return Err(LedgerError::DuplicateRefund(reference.to_string()));
        }

        let mut balance = state.balance(addr);
        balance.add_available(amount)?;
        balance.sub_total_out_clamped(amount);
        balance.touch();

        state.refund_refs.insert(reference.to_string());
        state.append(addr, EntryType::Refund, amount, reference, "refund", None);
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        let gap = amount.saturating_sub(balance.available);
        if !gap.is_zero() && gap > balance.available_credit() {
            return Err(LedgerError::InsufficientBalance {
                need: amount,
                have: balance.spendable(),
            });
        }
        if !gap.is_zero() {
            balance.draw_credit(gap)?;
        }
        balance.sub_available(amount)?;
        balance.add_pending(amount)?;
        balance.touch();

        if !gap.is_zero() {
            state.append(
                addr,
                EntryType::CreditDrawHold,
                gap,
                reference,
                "credit draw for hold",
                None,
            );
            state.shadows.insert(shadow_key(addr, reference), gap);
        }
        state.append(addr, EntryType::Hold, amount, reference, "hold", None);
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn confirm_hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        balance.sub_pending(amount)?;
        balance.add_total_out(amount)?;
        balance.touch();

        // Credit stays drawn after confirmation
        state.shadows.remove(&shadow_key(addr, reference));
        state.append(
            addr,
            EntryType::Spend,
            amount,
            reference,
            "hold confirmed",
            None,
        );
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn release_hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        balance.sub_pending(amount)?;
        balance.add_available(amount)?;

        let key = shadow_key(addr, reference);
        let drawn = state.shadows.get(&key).copied().unwrap_or(Amount::ZERO);
        let reversed = drawn.min(amount);
        if !reversed.is_zero() {
            balance.reverse_credit(reversed)?;
        }
        balance.touch();

        state.append(addr, EntryType::Release, amount, reference, "hold released", None);
        if !reversed.is_zero() {
            state.append(
                addr,
                EntryType::CreditReverse,
                reversed,
                reference,
                "credit reversed on release",
                None,
            );
            let remaining = drawn.saturating_sub(reversed);
            if remaining.is_zero() {
                state.shadows.remove(&key);
            } else {
                state.shadows.insert(key, remaining);
            }
        }
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn escrow_lock(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        balance.sub_available(amount)?;
        balance.add_escrowed(amount)?;
        balance.touch();

        state.append(
            addr,
            EntryType::EscrowLock,
            amount,
            reference,
            "escrow locked",
            None,
        );
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn release_escrow(
        &self,
        ctx: &CallContext,
        from: &AgentAddr,
        to: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut from_balance = state.balance(from);
        from_balance.sub_escrowed(amount)?;
        from_balance.add_total_out(amount)?;
        from_balance.touch();

        // Receiver row is created on first credit
        let mut to_balance = state.balance(to);
        to_balance.add_available(amount)?;
        to_balance.add_total_in(amount)?;
        to_balance.touch();

        state.append(
            from,
            EntryType::EscrowRelease,
            amount,
            reference,
            "escrow released to counterparty",
            None,
        );
        state.append(
            to,
            EntryType::EscrowReceive,
            amount,
            reference,
            "escrow received",
            None,
        );
        state.commit(from_balance);
        state.commit(to_balance);
        Ok(())
    }

    async fn refund_escrow(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        balance.sub_escrowed(amount)?;
        balance.add_available(amount)?;
        balance.touch();

        state.append(
            addr,
            EntryType::EscrowRefund,
            amount,
            reference,
            "escrow refunded",
            None,
        );
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn settle_hold_with_fee(
        &self,
        ctx: &CallContext,
        buyer: &AgentAddr,
        seller: &AgentAddr,
        seller_amount: Amount,
        platform: &AgentAddr,
        fee: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let total = seller_amount
            .checked_add(fee)
            .ok_or(LedgerError::Overflow)?;
        ensure_positive(total)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut buyer_balance = state.balance(buyer);
        buyer_balance.sub_pending(total)?;
        buyer_balance.add_total_out(total)?;
        buyer_balance.touch();

        let mut seller_balance = state.balance(seller);
        seller_balance.add_available(seller_amount)?;
        seller_balance.add_total_in(seller_amount)?;
        seller_balance.touch();

        state.shadows.remove(&shadow_key(buyer, reference));
        state.append(buyer, EntryType::Spend, total, reference, "hold settled", None);
        state.append(
            seller,
            EntryType::EscrowReceive,
            seller_amount,
            reference,
            "settlement",
            None,
        );
        state.commit(buyer_balance);
        state.commit(seller_balance);

        if !fee.is_zero() {
            let mut platform_balance = state.balance(platform);
            platform_balance.add_available(fee)?;
            platform_balance.add_total_in(fee)?;
            platform_balance.touch();
            state.append(
                platform,
                EntryType::EscrowReceive,
                fee,
                reference,
                "platform fee",
                None,
            );
            state.commit(platform_balance);
        }
        Ok(())
    }

    async fn set_credit_limit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        limit: Amount,
    ) -> Result<AgentBalance, LedgerError> {
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        if limit < balance.credit_used {
            return Err(LedgerError::CreditLimitBelowUsed {
                limit,
                used: balance.credit_used,
            });
        }
        balance.credit_limit = limit;
        balance.touch();

        state.append(
            addr,
            EntryType::CreditLimitSet,
            limit,
            "credit_limit",
            "credit limit set",
            None,
        );
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn use_credit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        balance.draw_credit(amount)?;
        balance.touch();

        state.append(
            addr,
            EntryType::CreditDraw,
            amount,
            reference,
            "explicit credit draw",
            None,
        );
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn repay_credit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let mut balance = state.balance(addr);
        let repay = amount.min(balance.credit_used);
        if repay.is_zero() {
            return Ok(balance);
        }
        balance.repay_credit(repay)?;
        balance.touch();

        state.append(
            addr,
            EntryType::CreditRepay,
            repay,
            reference,
            "credit repaid",
            None,
        );
        state.commit(balance.clone());
        Ok(balance)
    }

    async fn reverse(
        &self,
        ctx: &CallContext,
        entry_id: EntryId,
        reason: &str,
        admin: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;

        let original = state
            .entries
            .iter()
            .find(|entry| entry.id == entry_id)
            .cloned()
            .ok_or(LedgerError::EntryNotFound(entry_id))?;
        if state
            .entries
            .iter()
            .any(|entry| entry.reversal_of == Some(entry_id))
        {
            return Err(LedgerError::AlreadyReversed(entry_id));
        }
        let reversal_type = original
            .entry_type
            .reversal()
            .ok_or(LedgerError::NotReversible(original.entry_type))?;

        let addr = original.agent_addr.clone();
        let amount = original.amount;
        let mut balance = state.balance(&addr);
        match reversal_type {
            EntryType::ReversalDeposit => {
                balance.sub_available(amount)?;
                balance.sub_total_in_clamped(amount);
            }
            EntryType::ReversalWithdrawal | EntryType::ReversalSpend => {
                balance.add_available(amount)?;
                balance.sub_total_out_clamped(amount);
            }
            EntryType::ReversalRefund => {
                balance.sub_available(amount)?;
                balance.add_total_out(amount)?;
            }
            EntryType::ReversalHold => {
                balance.sub_pending(amount)?;
                balance.add_available(amount)?;
            }
            EntryType::ReversalRelease => {
                balance.sub_available(amount)?;
                balance.add_pending(amount)?;
            }
            EntryType::ReversalEscrowLock => {
                balance.sub_escrowed(amount)?;
                balance.add_available(amount)?;
            }
            EntryType::ReversalEscrowRefund => {
                balance.sub_available(amount)?;
                balance.add_escrowed(amount)?;
            }
            _ => return Err(LedgerError::NotReversible(original.entry_type)),
        }
        balance.touch();

        let description = format!("reversal of entry {} by {}: {}", entry_id, admin, reason);
        let id = state.append(
            &addr,
            reversal_type,
            amount,
            &original.reference,
            &description,
            Some(entry_id),
        );
        state.commit(balance);
        state
            .entries
            .iter()
            .rev()
            .find(|entry| entry.id == id)
            .cloned()
            .ok_or_else(|| {
                LedgerError::Storage(StorageError::Backend(
                    "reversal entry missing after append".to_string(),
                ))
            })
    }

    async fn get_balance(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<AgentBalance, LedgerError> {
        let state = self.inner.read().await;
        Ok(state.balance(addr))
    }

    async fn get_credit_info(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<CreditInfo, LedgerError> {
        let state = self.inner.read().await;
        let balance = state.balance(addr);
        Ok(CreditInfo {
            credit_limit: balance.credit_limit,
            credit_used: balance.credit_used,
            available_credit: balance.available_credit(),
        })
    }

    async fn get_history(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.inner.read().await;
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|entry| &entry.agent_addr == addr)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn entries_by_reference(
        &self,
        _ctx: &CallContext,
        reference: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.inner.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.reference == reference)
            .cloned()
            .collect())
    }

    async fn has_deposit(&self, _ctx: &CallContext, tx_hash: &str) -> Result<bool, LedgerError> {
        let state = self.inner.read().await;
        Ok(state.deposit_hashes.contains(tx_hash))
    }

    async fn get_entry(
        &self,
        _ctx: &CallContext,
        entry_id: EntryId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let state = self.inner.read().await;
        Ok(state.entries.iter().find(|entry| entry.id == entry_id).cloned())
    }

    async fn events_for(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let state = self.inner.read().await;
        Ok(state
            .events
            .iter()
            .filter(|event| &event.agent_addr == addr)
            .cloned()
            .collect())
    }
}
