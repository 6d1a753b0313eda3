//! Verification data model

use pact_common::{now_millis, AgentAddr, Amount, TimestampMillis};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationStatus {
    Active,
    Suspended,
    Revoked,
    Forfeited,
}

impl VerificationStatus {
    /// Revoked and forfeited verifications are closed for good; an agent
    /// may hold at most one non-terminal verification.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VerificationStatus::Revoked | VerificationStatus::Forfeited
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    /// `vr_` + 32 lowercase hex
    pub id: String,
    pub agent_addr: AgentAddr,
    pub status: VerificationStatus,
    /// Remaining bond; strictly decreased by partial forfeiture
    pub bond_amount: Amount,
    /// Ledger hold reference, `vbond_` + 12 hex
    pub bond_reference: String,
    /// Percent success rate the agent guarantees
    pub guaranteed_success_rate: f64,
    pub sla_window_size: u32,
    pub guarantee_premium_rate: f64,
    /// Reputation snapshot taken at apply/review time
    pub reputation_score: f64,
    pub reputation_tier: String,
    pub total_calls_monitored: u64,
    pub violation_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_violation_at: Option<TimestampMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_review_at: Option<TimestampMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<TimestampMillis>,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
}

impl Verification {
    pub(crate) fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}
