//! Per-agent partitioned balance
//!
//! # Fund conservation
//! At every quiescent point `total_in - total_out = available + pending +
//! escrowed`. Credit draws keep the equation balanced by counting the drawn
//! amount as an inflow while it is outstanding; the reverse/repay entries
//! remove it again.

use pact_common::{now_millis, AgentAddr, Amount, TimestampMillis};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBalance {
    pub agent_addr: AgentAddr,
    /// Spendable partition
    pub available: Amount,
    /// Two-phase holds awaiting confirm or release
    pub pending: Amount,
    /// Locked for conditional release to a counterparty
    pub escrowed: Amount,
    pub credit_limit: Amount,
    pub credit_used: Amount,
    pub total_in: Amount,
    pub total_out: Amount,
    pub updated_at: TimestampMillis,
}

impl AgentBalance {
    pub fn zeroed(agent_addr: AgentAddr) -> Self {
        Self {
            agent_addr,
            available: Amount::ZERO,
            pending: Amount::ZERO,
            escrowed: Amount::ZERO,
            credit_limit: Amount::ZERO,
            credit_used: Amount::ZERO,
            total_in: Amount::ZERO,
            total_out: Amount::ZERO,
            updated_at: now_millis(),
        }
    }

    /// Credit headroom still drawable
    pub fn available_credit(&self) -> Amount {
        self.credit_limit.saturating_sub(self.credit_used)
    }

    /// Funds a spend or hold may consume: available plus credit headroom
    pub fn spendable(&self) -> Amount {
        // Saturating: the sum cannot realistically overflow but a custody
        // guard must never panic.
        Amount::from_micros(
            self.available
                .micros()
                .saturating_add(self.available_credit().micros()),
        )
    }

    /// `total_in - total_out = available + pending + escrowed`
    pub fn is_conserved(&self) -> bool {
        let net = self.total_in.micros() as i128 - self.total_out.micros() as i128;
        let partitions = self.available.micros() as i128
            + self.pending.micros() as i128
            + self.escrowed.micros() as i128;
        net == partitions
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    // Guarded partition mutations. Subtraction checks the partition holds
    // enough; addition checks for overflow.

    pub(crate) fn sub_available(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.available = self.available.checked_sub(amount).ok_or_else(|| {
            LedgerError::InsufficientBalance {
                need: amount,
                have: self.available,
            }
        })?;
        Ok(())
    }

    pub(crate) fn sub_pending(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.pending = self.pending.checked_sub(amount).ok_or_else(|| {
            LedgerError::InsufficientBalance {
                need: amount,
                have: self.pending,
            }
        })?;
        Ok(())
    }

    pub(crate) fn sub_escrowed(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.escrowed = self.escrowed.checked_sub(amount).ok_or_else(|| {
            LedgerError::InsufficientBalance {
                need: amount,
                have: self.escrowed,
            }
        })?;
        Ok(())
    }

    pub(crate) fn add_available(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.available = self
            .available
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    pub(crate) fn add_pending(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.pending = self
            .pending
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    pub(crate) fn add_escrowed(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.escrowed = self
            .escrowed
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    pub(crate) fn add_total_in(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.total_in = self
            .total_in
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    pub(crate) fn add_total_out(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.total_out = self
            .total_out
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    /// `total_out -= min(amount, total_out)`; refunds clamp at zero
    pub(crate) fn sub_total_out_clamped(&mut self, amount: Amount) {
        self.total_out = self.total_out.saturating_sub(amount);
    }

    pub(crate) fn sub_total_in_clamped(&mut self, amount: Amount) {
        self.total_in = self.total_in.saturating_sub(amount);
    }

    /// Draw `amount` of credit into the available partition.
    ///
    /// The draw counts as an inflow so conservation keeps holding while
    /// the credit is outstanding.
    pub(crate) fn draw_credit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        let headroom = self.available_credit();
        if amount > headroom {
            return Err(LedgerError::CreditExhausted {
                need: amount,
                available: headroom,
            });
        }
        self.credit_used = self
            .credit_used
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        self.add_total_in(amount)?;
        self.add_available(amount)
    }

    /// Undo an outstanding draw: the inverse of [`Self::draw_credit`].
    pub(crate) fn reverse_credit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.sub_available(amount)?;
        self.credit_used = self.credit_used.saturating_sub(amount);
        self.sub_total_in_clamped(amount);
        Ok(())
    }

    /// Repay drawn credit out of the available partition.
    pub(crate) fn repay_credit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.sub_available(amount)?;
        self.credit_used = self.credit_used.saturating_sub(amount);
        self.sub_total_in_clamped(amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance() -> AgentBalance {
        AgentBalance::zeroed(AgentAddr::new("0xagent").unwrap())
    }

    fn amt(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    #[test]
    fn test_zeroed_is_conserved() {
        assert!(balance().is_conserved());
    }

    #[test]
    fn test_sub_available_guard() {
        let mut b = balance();
        b.add_available(amt("1")).unwrap();
        let err = b.sub_available(amt("2")).unwrap_err();
        match err {
            LedgerError::InsufficientBalance { need, have } => {
                assert_eq!(need, amt("2"));
                assert_eq!(have, amt("1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Guard failure leaves the partition untouched
        assert_eq!(b.available, amt("1"));
    }

    #[test]
    fn test_credit_draw_keeps_conservation() {
        let mut b = balance();
        b.credit_limit = amt("10");
        b.add_available(amt("3")).unwrap();
        b.add_total_in(amt("3")).unwrap();

        b.draw_credit(amt("2")).unwrap();
        assert_eq!(b.available, amt("5"));
        assert_eq!(b.credit_used, amt("2"));
        assert!(b.is_conserved());

        b.reverse_credit(amt("2")).unwrap();
        assert_eq!(b.available, amt("3"));
        assert_eq!(b.credit_used, Amount::ZERO);
        assert!(b.is_conserved());
    }

    #[test]
    fn test_credit_draw_respects_limit() {
        let mut b = balance();
        b.credit_limit = amt("1");
        assert!(matches!(
            b.draw_credit(amt("2")),
            Err(LedgerError::CreditExhausted { .. })
        ));
        assert_eq!(b.credit_used, Amount::ZERO);
    }

    #[test]
    fn test_spendable_includes_headroom() {
        let mut b = balance();
        b.credit_limit = amt("10");
        b.credit_used = amt("4");
        b.available = amt("3");
        assert_eq!(b.spendable(), amt("9"));
    }
}
