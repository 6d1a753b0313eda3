//! Contract storage backends

mod memory;
mod postgres;

pub use memory::MemoryContractStore;
pub use postgres::PostgresContractStore;

use async_trait::async_trait;
use pact_common::{AgentAddr, CallContext, TimestampMillis};

use crate::contract::{Contract, ContractCall};
use crate::error::ContractError;

#[async_trait]
pub trait ContractStore: Send + Sync + 'static {
    async fn insert(&self, ctx: &CallContext, contract: &Contract) -> Result<(), ContractError>;

    async fn update(&self, ctx: &CallContext, contract: &Contract) -> Result<(), ContractError>;

    async fn get(&self, ctx: &CallContext, id: &str) -> Result<Option<Contract>, ContractError>;

    async fn insert_call(&self, ctx: &CallContext, call: &ContractCall)
        -> Result<(), ContractError>;

    /// Most recent calls of a contract, newest first, capped at `limit`
    async fn recent_calls(
        &self,
        ctx: &CallContext,
        contract_id: &str,
        limit: u32,
    ) -> Result<Vec<ContractCall>, ContractError>;

    /// Contracts where the agent is buyer or seller
    async fn list_by_agent(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<Vec<Contract>, ContractError>;

    /// Active contracts whose expiry has passed
    async fn list_expired_active(
        &self,
        ctx: &CallContext,
        now: TimestampMillis,
    ) -> Result<Vec<Contract>, ContractError>;

    /// `(successful, total)` over the newest calls where the agent is
    /// seller, across all of its contracts, capped at `window`
    async fn seller_call_stats(
        &self,
        ctx: &CallContext,
        seller: &AgentAddr,
        window: u32,
    ) -> Result<(u64, u64), ContractError>;
}
