//! In-memory verification store for demo and test use

use std::collections::HashMap;

use async_trait::async_trait;
use pact_common::{AgentAddr, CallContext};
use tokio::sync::RwLock;

use crate::error::VerificationError;
use crate::store::VerificationStore;
use crate::verification::{Verification, VerificationStatus};

#[derive(Default)]
struct MemoryState {
    by_id: HashMap<String, Verification>,
    /// Agent -> id of its single non-terminal verification
    open_by_agent: HashMap<AgentAddr, String>,
}

pub struct MemoryVerificationStore {
    inner: RwLock<MemoryState>,
}

impl MemoryVerificationStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryVerificationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerificationStore for MemoryVerificationStore {
    async fn insert(
        &self,
        ctx: &CallContext,
        verification: &Verification,
    ) -> Result<(), VerificationError> {
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;
        if state.open_by_agent.contains_key(&verification.agent_addr) {
            return Err(VerificationError::AlreadyVerified(
                verification.agent_addr.to_string(),
            ));
        }
        if !verification.status.is_terminal() {
            state
                .open_by_agent
                .insert(verification.agent_addr.clone(), verification.id.clone());
        }
        state
            .by_id
            .insert(verification.id.clone(), verification.clone());
        Ok(())
    }

    async fn update(
        &self,
        ctx: &CallContext,
        verification: &Verification,
    ) -> Result<(), VerificationError> {
        let mut state = self.inner.write().await;
        ctx.check_cancelled()?;
        if !state.by_id.contains_key(&verification.id) {
            return Err(VerificationError::VerificationNotFound(
                verification.id.clone(),
            ));
        }
        if verification.status.is_terminal() {
            // Closing the verification frees the agent's slot
            if state
                .open_by_agent
                .get(&verification.agent_addr)
                .map(|id| id == &verification.id)
                .unwrap_or(false)
            {
                state.open_by_agent.remove(&verification.agent_addr);
            }
        }
        state
            .by_id
            .insert(verification.id.clone(), verification.clone());
        Ok(())
    }

    async fn get(
        &self,
        _ctx: &CallContext,
        id: &str,
    ) -> Result<Option<Verification>, VerificationError> {
        let state = self.inner.read().await;
        Ok(state.by_id.get(id).cloned())
    }

    async fn get_open_for_agent(
        &self,
        _ctx: &CallContext,
        agent: &AgentAddr,
    ) -> Result<Option<Verification>, VerificationError> {
        let state = self.inner.read().await;
        Ok(state
            .open_by_agent
            .get(agent)
            .and_then(|id| state.by_id.get(id))
            .cloned())
    }

    async fn list_active(
        &self,
        _ctx: &CallContext,
        limit: usize,
    ) -> Result<Vec<Verification>, VerificationError> {
        let state = self.inner.read().await;
        Ok(state
            .by_id
            .values()
            .filter(|verification| verification.status == VerificationStatus::Active)
            .take(limit)
            .cloned()
            .collect())
    }
}
