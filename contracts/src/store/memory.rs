//! In-memory contract store for demo and test use

use std::collections::HashMap;

use async_trait::async_trait;
use pact_common::{AgentAddr, CallContext, TimestampMillis};
use tokio::sync::RwLock;

use crate::contract::{CallStatus, Contract, ContractCall, ContractStatus};
use crate::error::ContractError;
use crate::store::ContractStore;

#[derive(Default)]
struct MemoryState {
    contracts: HashMap<String, Contract>,
    /// Calls in insertion order (oldest first)
    calls: Vec<ContractCall>,
}

pub struct MemoryContractStore {
    inner: RwLock<MemoryState>,
}

impl MemoryContractStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryContractStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn insert(&self, ctx: &CallContext, contract: &Contract) -> Result<(), ContractError> {
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;
        state.contracts.insert(contract.id.clone(), contract.clone());
        Ok(())
    }

    async fn update(&self, ctx: &CallContext, contract: &Contract) -> Result<(), ContractError> {
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;
        if !state.contracts.contains_key(&contract.id) {
            return Err(ContractError::ContractNotFound(contract.id.clone()));
        }
        state.contracts.insert(contract.id.clone(), contract.clone());
        Ok(())
    }

    async fn get(&self, _ctx: &CallContext, id: &str) -> Result<Option<Contract>, ContractError> {
        let state = self.inner.read().await;
        Ok(state.contracts.get(id).cloned())
    }

    async fn insert_call(
        &self,
        ctx: &CallContext,
        call: &ContractCall,
    ) -> Result<(), ContractError> {
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;
        state.calls.push(call.clone());
        Ok(())
    }

    async fn recent_calls(
        &self,
        _ctx: &CallContext,
        contract_id: &str,
        limit: u32,
    ) -> Result<Vec<ContractCall>, ContractError> {
        let state = self.inner.read().await;
        Ok(state
            .calls
            .iter()
            .rev()
            .filter(|call| call.contract_id == contract_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_by_agent(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<Vec<Contract>, ContractError> {
        let state = self.inner.read().await;
        Ok(state
            .contracts
            .values()
            .filter(|contract| &contract.buyer_addr == addr || &contract.seller_addr == addr)
            .cloned()
            .collect())
    }

    async fn list_expired_active(
        &self,
        _ctx: &CallContext,
        now: TimestampMillis,
    ) -> Result<Vec<Contract>, ContractError> {
        let state = self.inner.read().await;
        Ok(state
            .contracts
            .values()
            .filter(|contract| {
                contract.status == ContractStatus::Active
                    && contract.expires_at.map(|at| at < now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn seller_call_stats(
        &self,
        _ctx: &CallContext,
        seller: &AgentAddr,
        window: u32,
    ) -> Result<(u64, u64), ContractError> {
        let state = self.inner.read().await;
        let seller_contracts: Vec<&str> = state
            .contracts
            .values()
            .filter(|contract| &contract.seller_addr == seller)
            .map(|contract| contract.id.as_str())
            .collect();

        let mut successful = 0u64;
        let mut total = 0u64;
        for call in state
            .calls
            .iter()
            .rev()
            .filter(|call| seller_contracts.contains(&call.contract_id.as_str()))
            .take(window as usize)
        {
            total += 1;
            if call.status == CallStatus::Success {
                successful += 1;
            }
        }
        Ok((successful, total))
    }
}
