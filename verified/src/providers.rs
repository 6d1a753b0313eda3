//! External collaborator seams
//!
//! Reputation scoring, agent metrics and the contract-call read feed are
//! owned by the surrounding platform; the engine consumes them through
//! these traits.

use async_trait::async_trait;
use pact_common::CallContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationSnapshot {
    pub score: f64,
    pub tier: String,
}

#[async_trait]
pub trait ReputationProvider: Send + Sync {
    async fn reputation(
        &self,
        ctx: &CallContext,
        agent: &str,
    ) -> Result<ReputationSnapshot, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub total_transactions: u64,
    pub success_rate: f64,
    pub days_on_network: u32,
    pub total_volume_usd: f64,
}

#[async_trait]
pub trait AgentMetricsProvider: Send + Sync {
    async fn metrics(&self, ctx: &CallContext, agent: &str) -> Result<AgentMetrics, ProviderError>;
}

/// Success/total counts over the newest calls where the agent is seller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    pub successful: u64,
    pub total: u64,
}

#[async_trait]
pub trait ContractCallProvider: Send + Sync {
    /// Newest calls for contracts where `agent` is seller, capped at
    /// `window`.
    async fn seller_call_stats(
        &self,
        ctx: &CallContext,
        agent: &str,
        window: u32,
    ) -> Result<CallStats, ProviderError>;
}
