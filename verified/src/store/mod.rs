//! Verification storage backends

mod memory;
mod postgres;

pub use memory::MemoryVerificationStore;
pub use postgres::PostgresVerificationStore;

use async_trait::async_trait;
use pact_common::{AgentAddr, CallContext};

use crate::error::VerificationError;
use crate::verification::Verification;

#[async_trait]
pub trait VerificationStore: Send + Sync + 'static {
    /// Persist a new verification. Fails `AlreadyVerified` when the agent
    /// already holds a non-terminal one; the at-most-one invariant is
    /// enforced inside the store's serialization scope.
    async fn insert(
        &self,
        ctx: &CallContext,
        verification: &Verification,
    ) -> Result<(), VerificationError>;

    async fn update(
        &self,
        ctx: &CallContext,
        verification: &Verification,
    ) -> Result<(), VerificationError>;

    async fn get(
        &self,
        ctx: &CallContext,
        id: &str,
    ) -> Result<Option<Verification>, VerificationError>;

    /// The agent's non-terminal verification, if any
    async fn get_open_for_agent(
        &self,
        ctx: &CallContext,
        agent: &AgentAddr,
    ) -> Result<Option<Verification>, VerificationError>;

    /// Bounded page of active verifications for the enforcer
    async fn list_active(
        &self,
        ctx: &CallContext,
        limit: usize,
    ) -> Result<Vec<Verification>, VerificationError>;
}
