//! Append-only ledger history
//!
//! One entry per mutation; entries are never updated or deleted. A
//! reversal appends a compensating `reversal_*` entry carrying
//! `reversal_of` instead of touching the original.

use pact_common::{AgentAddr, Amount, TimestampMillis};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type EntryId = i64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntryType {
    Deposit,
    Withdrawal,
    Spend,
    Refund,
    Hold,
    Release,
    CreditDraw,
    CreditDrawHold,
    CreditReverse,
    CreditLimitSet,
    CreditRepay,
    EscrowLock,
    EscrowRelease,
    EscrowReceive,
    EscrowRefund,
    ReversalDeposit,
    ReversalWithdrawal,
    ReversalSpend,
    ReversalRefund,
    ReversalHold,
    ReversalRelease,
    ReversalEscrowLock,
    ReversalEscrowRefund,
}

impl EntryType {
    /// The compensating type appended when this entry is reversed, or
    /// `None` when no single-agent inverse exists (credit bookkeeping and
    /// two-party moves are not reversible through this path).
    pub fn reversal(self) -> Option<EntryType> {
        match self {
            EntryType::Deposit => Some(EntryType::ReversalDeposit),
            EntryType::Withdrawal => Some(EntryType::ReversalWithdrawal),
            EntryType::Spend => Some(EntryType::ReversalSpend),
            EntryType::Refund => Some(EntryType::ReversalRefund),
            EntryType::Hold => Some(EntryType::ReversalHold),
            EntryType::Release => Some(EntryType::ReversalRelease),
            EntryType::EscrowLock => Some(EntryType::ReversalEscrowLock),
            EntryType::EscrowRefund => Some(EntryType::ReversalEscrowRefund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: EntryId,
    pub agent_addr: AgentAddr,
    pub entry_type: EntryType,
    pub amount: Amount,
    /// Transaction hash for deposits/withdrawals, caller reference otherwise
    pub reference: String,
    pub description: String,
    /// Set on compensating entries only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversal_of: Option<EntryId>,
    pub created_at: TimestampMillis,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_entry_type_wire_names() {
        assert_eq!(EntryType::CreditDrawHold.to_string(), "credit_draw_hold");
        assert_eq!(EntryType::EscrowLock.to_string(), "escrow_lock");
        assert_eq!(
            EntryType::ReversalEscrowLock.to_string(),
            "reversal_escrow_lock"
        );
        assert_eq!(
            EntryType::from_str("credit_limit_set").unwrap(),
            EntryType::CreditLimitSet
        );
    }

    #[test]
    fn test_reversal_mapping() {
        assert_eq!(
            EntryType::Deposit.reversal(),
            Some(EntryType::ReversalDeposit)
        );
        assert_eq!(EntryType::Hold.reversal(), Some(EntryType::ReversalHold));
        assert_eq!(EntryType::CreditDraw.reversal(), None);
        assert_eq!(EntryType::EscrowRelease.reversal(), None);
        assert_eq!(EntryType::ReversalDeposit.reversal(), None);
    }

    #[test]
    fn test_entry_serde_roundtrip() {
        let entry = LedgerEntry {
            id: 42,
            agent_addr: AgentAddr::new("0xAgent").unwrap(),
            entry_type: EntryType::Deposit,
            amount: Amount::parse("3.25").unwrap(),
            reference: "tx-1".to_string(),
            description: "deposit".to_string(),
            reversal_of: None,
            created_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"entryType\":\"deposit\""));
        let back: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
