//! Contract data model

use pact_common::duration::parse_duration;
use pact_common::{id, now_millis, AgentAddr, Amount, TimestampMillis};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ContractError;

/// Propose-time defaults
pub const DEFAULT_MIN_VOLUME: u64 = 1;
pub const DEFAULT_MAX_LATENCY_MS: u64 = 10_000;
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 95.0;
pub const DEFAULT_SLA_WINDOW_SIZE: u32 = 20;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContractStatus {
    Proposed,
    Accepted,
    Active,
    Completed,
    Terminated,
    Violated,
    Rejected,
}

impl ContractStatus {
    /// Terminal statuses are irrevocable
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContractStatus::Completed
                | ContractStatus::Terminated
                | ContractStatus::Violated
                | ContractStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationDetails {
    pub window_rate: f64,
    pub threshold: f64,
    pub window_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    /// `ct_` + 32 lowercase hex
    pub id: String,
    pub buyer_addr: AgentAddr,
    pub seller_addr: AgentAddr,
    pub service_type: String,
    pub price_per_call: Amount,
    pub buyer_budget: Amount,
    pub seller_penalty: Amount,
    pub min_volume: u64,
    pub max_latency_ms: u64,
    /// Percent threshold for the rolling window
    pub min_success_rate: f64,
    pub sla_window_size: u32,
    /// Original duration string, e.g. "7d"
    pub duration: String,
    pub status: ContractStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<TimestampMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<TimestampMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<TimestampMillis>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_latency_ms: u64,
    pub budget_spent: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_by: Option<AgentAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_details: Option<ViolationDetails>,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
}

impl Contract {
    /// Unspent part of the buyer's escrowed budget
    pub fn remaining_budget(&self) -> Amount {
        self.buyer_budget.saturating_sub(self.budget_spent)
    }

    pub fn lifetime_success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 100.0;
        }
        100.0 * self.successful_calls as f64 / self.total_calls as f64
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

/// Input to `ContractEngine::propose`; unset optionals take the documented
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractProposal {
    pub buyer_addr: String,
    pub seller_addr: String,
    pub service_type: String,
    pub price_per_call: Amount,
    pub buyer_budget: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seller_penalty: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_window_size: Option<u32>,
    pub duration: String,
}

impl ContractProposal {
    /// Validate and materialize a `proposed` contract
    pub fn into_contract(self) -> Result<Contract, ContractError> {
        let buyer_addr = AgentAddr::new(&self.buyer_addr)?;
        let seller_addr = AgentAddr::new(&self.seller_addr)?;
        if buyer_addr == seller_addr {
            return Err(ContractError::SameParty);
        }
        // Parsed here only to reject bad input; the accept path re-parses
        // when it stamps the expiry.
        parse_duration(&self.duration)?;

        let now = now_millis();
        Ok(Contract {
            id: id::contract_id(),
            buyer_addr,
            seller_addr,
            service_type: self.service_type,
            price_per_call: self.price_per_call,
            buyer_budget: self.buyer_budget,
            seller_penalty: self.seller_penalty.unwrap_or(Amount::ZERO),
            min_volume: self.min_volume.unwrap_or(DEFAULT_MIN_VOLUME),
            max_latency_ms: self.max_latency_ms.unwrap_or(DEFAULT_MAX_LATENCY_MS),
            min_success_rate: self.min_success_rate.unwrap_or(DEFAULT_MIN_SUCCESS_RATE),
            sla_window_size: self.sla_window_size.unwrap_or(DEFAULT_SLA_WINDOW_SIZE),
            duration: self.duration,
            status: ContractStatus::Proposed,
            starts_at: None,
            expires_at: None,
            resolved_at: None,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            total_latency_ms: 0,
            budget_spent: Amount::ZERO,
            terminated_by: None,
            terminated_reason: None,
            violation_details: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractCall {
    /// `cc_` + 32 lowercase hex
    pub id: String,
    pub contract_id: String,
    pub status: CallStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    pub amount: Amount,
    pub created_at: TimestampMillis,
}
