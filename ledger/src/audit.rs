//! Audit decoration
//!
//! An optional sink receiving actor-attributed before/after balance
//! snapshots for every custody mutation. Audit appends are side effects:
//! they never alter partition semantics, and a failing sink is reported
//! distinctly (`LedgerError::PostCommit`) without re-applying or undoing
//! the committed mutation.

use async_trait::async_trait;
use pact_common::{Actor, AgentAddr, Amount, StorageError, TimestampMillis};
use serde::{Deserialize, Serialize};

use crate::balance::AgentBalance;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    /// Operation name, e.g. "deposit", "release_escrow"
    pub operation: String,
    pub agent_addr: AgentAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<AgentAddr>,
    pub amount: Amount,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<AgentBalance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<AgentBalance>,
    pub created_at: TimestampMillis,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), StorageError>;
}

/// Collects records in memory, for demos and tests
#[derive(Default)]
pub struct MemoryAuditSink {
    records: tokio::sync::Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), StorageError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}
