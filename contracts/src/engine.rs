//! Contract state machine
//!
//! Operations on one contract are strictly linearized by a per-contract
//! mutex (lazily created, kept for the process lifetime); different
//! contracts proceed in parallel. Once a contract reaches a terminal
//! status, that status is the source of truth: a ledger failure after the
//! terminal write is logged at CRITICAL and reconciled out of band, never
//! reverted.

use std::sync::Arc;

use dashmap::DashMap;
use log::{error, warn};
use pact_common::duration::parse_duration;
use pact_common::{id, now_millis, AgentAddr, CallContext};
use pact_ledger::{LedgerError, LedgerService};
use tokio::sync::Mutex;

use crate::contract::{
    CallStatus, Contract, ContractCall, ContractProposal, ContractStatus, ViolationDetails,
};
use crate::error::ContractError;
use crate::store::ContractStore;

/// One recorded service call
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub success: bool,
    pub latency_ms: u64,
    pub error_msg: Option<String>,
}

impl CallOutcome {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            error_msg: None,
        }
    }

    pub fn failed(latency_ms: u64, error_msg: &str) -> Self {
        Self {
            success: false,
            latency_ms,
            error_msg: Some(error_msg.to_string()),
        }
    }
}

/// Treat a ledger call whose mutation committed (audit-only failure) as
/// applied, surfacing everything else.
fn ledger_ok(result: Result<(), LedgerError>) -> Result<(), LedgerError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_applied() => {
            warn!("ledger side effect incomplete after commit: {err}");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// After a terminal transition the contract status wins; a failed move is
/// logged for out-of-band reconciliation.
fn settle_after_terminal(result: Result<(), LedgerError>, contract_id: &str, what: &str) {
    match ledger_ok(result) {
        Ok(()) => {}
        Err(err) => error!(
            "CRITICAL: {what} failed for resolved contract {contract_id}: {err}; \
             ledger must be reconciled manually"
        ),
    }
}

pub struct ContractEngine<S: ContractStore> {
    store: Arc<S>,
    ledger: Arc<dyn LedgerService>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: ContractStore> ContractEngine<S> {
    pub fn new(store: Arc<S>, ledger: Arc<dyn LedgerService>) -> Self {
        Self {
            store,
            ledger,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn lock_for(&self, contract_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(contract_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn must_get(&self, ctx: &CallContext, id: &str) -> Result<Contract, ContractError> {
        self.store
            .get(ctx, id)
            .await?
            .ok_or_else(|| ContractError::ContractNotFound(id.to_string()))
    }

    fn ensure_not_terminal(contract: &Contract) -> Result<(), ContractError> {
        if contract.status.is_terminal() {
            return Err(ContractError::AlreadyResolved {
                id: contract.id.clone(),
                status: contract.status,
            });
        }
        Ok(())
    }

    fn ensure_active(contract: &Contract) -> Result<(), ContractError> {
        Self::ensure_not_terminal(contract)?;
        if contract.status != ContractStatus::Active {
            return Err(ContractError::InvalidStatus {
                expected: "active",
                actual: contract.status,
            });
        }
        Ok(())
    }

    /// Validate and persist a proposal. No ledger activity happens until
    /// the seller accepts.
    pub async fn propose(
        &self,
        ctx: &CallContext,
        proposal: ContractProposal,
    ) -> Result<Contract, ContractError> {
        let contract = proposal.into_contract()?;
        ctx.check_cancelled()?;
        self.store.insert(ctx, &contract).await?;
        Ok(contract)
    }

    /// Seller accepts: escrow the buyer budget (and penalty, if any), then
    /// activate. Failures compensate earlier locks and surface the original
    /// error.
    pub async fn accept(
        &self,
        ctx: &CallContext,
        contract_id: &str,
        caller: &str,
    ) -> Result<Contract, ContractError> {
        let lock = self.lock_for(contract_id);
        let _guard = lock.lock().await;

        let mut contract = self.must_get(ctx, contract_id).await?;
        Self::ensure_not_terminal(&contract)?;
        if contract.status != ContractStatus::Proposed {
            return Err(ContractError::InvalidStatus {
                expected: "proposed",
                actual: contract.status,
            });
        }
        let caller = AgentAddr::new(caller)?;
        if caller != contract.seller_addr {
            return Err(ContractError::Unauthorized(
                "only the seller can accept".to_string(),
            ));
        }
        let term = parse_duration(&contract.duration)?;
        ctx.check_cancelled()?;

        ledger_ok(
            self.ledger
                .escrow_lock(
                    ctx,
                    contract.buyer_addr.as_str(),
                    contract.buyer_budget,
                    &contract.id,
                )
                .await,
        )?;

        let penalty_ref = format!("{}_pen", contract.id);
        if !contract.seller_penalty.is_zero() {
            if let Err(err) = ledger_ok(
                self.ledger
                    .escrow_lock(
                        ctx,
                        contract.seller_addr.as_str(),
                        contract.seller_penalty,
                        &penalty_ref,
                    )
                    .await,
            ) {
                if let Err(comp) = ledger_ok(
                    self.ledger
                        .refund_escrow(
                            ctx,
                            contract.buyer_addr.as_str(),
                            contract.buyer_budget,
                            &contract.id,
                        )
                        .await,
                ) {
                    error!(
                        "CRITICAL: failed to compensate buyer escrow for {}: {}",
                        contract.id, comp
                    );
                }
                return Err(err.into());
            }
        }

        let now = now_millis();
        contract.status = ContractStatus::Active;
        contract.starts_at = Some(now);
        contract.expires_at = Some(now + term.as_millis() as u64);
        contract.touch();
        if let Err(err) = self.store.update(ctx, &contract).await {
            if let Err(comp) = ledger_ok(
                self.ledger
                    .refund_escrow(
                        ctx,
                        contract.buyer_addr.as_str(),
                        contract.buyer_budget,
                        &contract.id,
                    )
                    .await,
            ) {
                error!(
                    "CRITICAL: failed to compensate buyer escrow for {}: {}",
                    contract.id, comp
                );
            }
            if !contract.seller_penalty.is_zero() {
                if let Err(comp) = ledger_ok(
                    self.ledger
                        .refund_escrow(
                            ctx,
                            contract.seller_addr.as_str(),
                            contract.seller_penalty,
                            &penalty_ref,
                        )
                        .await,
                ) {
                    error!(
                        "CRITICAL: failed to compensate seller penalty for {}: {}",
                        contract.id, comp
                    );
                }
            }
            return Err(err);
        }
        Ok(contract)
    }

    /// Seller declines a proposal. No ledger activity.
    pub async fn reject(
        &self,
        ctx: &CallContext,
        contract_id: &str,
        caller: &str,
    ) -> Result<Contract, ContractError> {
        let lock = self.lock_for(contract_id);
        let _guard = lock.lock().await;

        let mut contract = self.must_get(ctx, contract_id).await?;
        Self::ensure_not_terminal(&contract)?;
        if contract.status != ContractStatus::Proposed {
            return Err(ContractError::InvalidStatus {
                expected: "proposed",
                actual: contract.status,
            });
        }
        let caller = AgentAddr::new(caller)?;
        if caller != contract.seller_addr {
            return Err(ContractError::Unauthorized(
                "only the seller can reject".to_string(),
            ));
        }
        ctx.check_cancelled()?;

        contract.status = ContractStatus::Rejected;
        contract.resolved_at = Some(now_millis());
        contract.touch();
        self.store.update(ctx, &contract).await?;
        Ok(contract)
    }

    /// Record one service call, release the per-call payment on success,
    /// then evaluate the SLA window and the completion condition in order.
    pub async fn record_call(
        &self,
        ctx: &CallContext,
        contract_id: &str,
        caller: &str,
        outcome: CallOutcome,
    ) -> Result<Contract, ContractError> {
        let lock = self.lock_for(contract_id);
        let _guard = lock.lock().await;

        let mut contract = self.must_get(ctx, contract_id).await?;
        Self::ensure_active(&contract)?;
        let caller = AgentAddr::new(caller)?;
        if caller != contract.buyer_addr && caller != contract.seller_addr {
            return Err(ContractError::Unauthorized(
                "only a contract party can record calls".to_string(),
            ));
        }
        let remaining = contract.remaining_budget();
        if remaining < contract.price_per_call {
            return Err(ContractError::BudgetExhausted {
                remaining,
                price: contract.price_per_call,
            });
        }
        ctx.check_cancelled()?;

        let call = ContractCall {
            id: id::call_id(),
            contract_id: contract.id.clone(),
            status: if outcome.success {
                CallStatus::Success
            } else {
                CallStatus::Failed
            },
            latency_ms: outcome.latency_ms,
            error_msg: outcome.error_msg,
            amount: contract.price_per_call,
            created_at: now_millis(),
        };
        self.store.insert_call(ctx, &call).await?;

        contract.total_calls += 1;
        contract.total_latency_ms += call.latency_ms;
        if outcome.success {
            contract.successful_calls += 1;
        } else {
            contract.failed_calls += 1;
        }

        if outcome.success {
            // Micro-release: one payment per successful call
            if let Err(err) = ledger_ok(
                self.ledger
                    .release_escrow(
                        ctx,
                        contract.buyer_addr.as_str(),
                        contract.seller_addr.as_str(),
                        contract.price_per_call,
                        &call.id,
                    )
                    .await,
            ) {
                contract.touch();
                if let Err(persist) = self.store.update(ctx, &contract).await {
                    error!(
                        "failed to persist call counters for {} after ledger error: {}",
                        contract.id, persist
                    );
                }
                return Err(err.into());
            }
            contract.budget_spent = contract
                .budget_spent
                .checked_add(contract.price_per_call)
                .ok_or(ContractError::Ledger(LedgerError::Overflow))?;
        }
        contract.touch();
        self.store.update(ctx, &contract).await?;

        // SLA first: the rolling window decides alone, and only when full
        let recent = self
            .store
            .recent_calls(ctx, &contract.id, contract.sla_window_size)
            .await?;
        if recent.len() as u32 == contract.sla_window_size {
            let successes = recent
                .iter()
                .filter(|call| call.status == CallStatus::Success)
                .count();
            let rate = 100.0 * successes as f64 / contract.sla_window_size as f64;
            if rate < contract.min_success_rate {
                self.violate_locked(ctx, &mut contract, rate).await?;
                return Ok(contract);
            }
        }

        // Completion: budget cannot fund another call and the volume floor
        // is met. The dust residue is refunded by the completion branch.
        if contract.remaining_budget() < contract.price_per_call
            && contract.total_calls >= contract.min_volume
        {
            self.complete_locked(ctx, &mut contract).await?;
        }
        Ok(contract)
    }

    /// Either party walks away from an active contract.
    pub async fn terminate(
        &self,
        ctx: &CallContext,
        contract_id: &str,
        caller: &str,
        reason: &str,
    ) -> Result<Contract, ContractError> {
        let lock = self.lock_for(contract_id);
        let _guard = lock.lock().await;

        let mut contract = self.must_get(ctx, contract_id).await?;
        Self::ensure_active(&contract)?;
        let caller = AgentAddr::new(caller)?;
        if caller != contract.buyer_addr && caller != contract.seller_addr {
            return Err(ContractError::Unauthorized(
                "only a contract party can terminate".to_string(),
            ));
        }
        ctx.check_cancelled()?;

        contract.status = ContractStatus::Terminated;
        contract.terminated_by = Some(caller.clone());
        contract.terminated_reason = Some(reason.to_string());
        contract.resolved_at = Some(now_millis());
        contract.touch();
        self.store.update(ctx, &contract).await?;

        let remaining = contract.remaining_budget();
        let penalty_ref = format!("{}_pen", contract.id);
        if caller == contract.buyer_addr {
            // Buyer walks: remaining budget compensates the seller, the
            // penalty goes home.
            if !remaining.is_zero() {
                settle_after_terminal(
                    self.ledger
                        .release_escrow(
                            ctx,
                            contract.buyer_addr.as_str(),
                            contract.seller_addr.as_str(),
                            remaining,
                            &format!("{}_term", contract.id),
                        )
                        .await,
                    &contract.id,
                    "termination compensation",
                );
            }
            if !contract.seller_penalty.is_zero() {
                settle_after_terminal(
                    self.ledger
                        .refund_escrow(
                            ctx,
                            contract.seller_addr.as_str(),
                            contract.seller_penalty,
                            &penalty_ref,
                        )
                        .await,
                    &contract.id,
                    "penalty refund",
                );
            }
        } else {
            // Seller walks: the penalty compensates the buyer, the unspent
            // budget goes home.
            if !contract.seller_penalty.is_zero() {
                settle_after_terminal(
                    self.ledger
                        .release_escrow(
                            ctx,
                            contract.seller_addr.as_str(),
                            contract.buyer_addr.as_str(),
                            contract.seller_penalty,
                            &penalty_ref,
                        )
                        .await,
                    &contract.id,
                    "penalty forfeiture",
                );
            }
            if !remaining.is_zero() {
                settle_after_terminal(
                    self.ledger
                        .refund_escrow(
                            ctx,
                            contract.buyer_addr.as_str(),
                            remaining,
                            &format!("{}_refund", contract.id),
                        )
                        .await,
                    &contract.id,
                    "budget refund",
                );
            }
        }
        Ok(contract)
    }

    /// One expiration sweep over active contracts past their expiry.
    /// Per-item failures are logged and the sweep continues.
    pub async fn check_expired(&self, ctx: &CallContext) -> Result<usize, ContractError> {
        let expired = self.store.list_expired_active(ctx, now_millis()).await?;
        let mut resolved = 0usize;
        for candidate in expired {
            if ctx.is_cancelled() {
                break;
            }
            match self.expire_one(ctx, &candidate.id).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!("expiration pass failed for contract {}: {}", candidate.id, err)
                }
            }
        }
        Ok(resolved)
    }

    async fn expire_one(&self, ctx: &CallContext, contract_id: &str) -> Result<bool, ContractError> {
        let lock = self.lock_for(contract_id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a racing operation may have resolved it
        let Some(mut contract) = self.store.get(ctx, contract_id).await? else {
            return Ok(false);
        };
        if contract.status != ContractStatus::Active {
            return Ok(false);
        }
        let Some(expires_at) = contract.expires_at else {
            return Ok(false);
        };
        if expires_at >= now_millis() {
            return Ok(false);
        }
        ctx.check_cancelled()?;

        if contract.total_calls >= contract.min_volume {
            self.complete_locked(ctx, &mut contract).await?;
            return Ok(true);
        }

        contract.status = ContractStatus::Terminated;
        contract.terminated_reason = Some("expired".to_string());
        contract.resolved_at = Some(now_millis());
        contract.touch();
        self.store.update(ctx, &contract).await?;

        let remaining = contract.remaining_budget();
        if !remaining.is_zero() {
            settle_after_terminal(
                self.ledger
                    .refund_escrow(
                        ctx,
                        contract.buyer_addr.as_str(),
                        remaining,
                        &format!("{}_refund", contract.id),
                    )
                    .await,
                &contract.id,
                "expiry budget refund",
            );
        }
        if !contract.seller_penalty.is_zero() {
            settle_after_terminal(
                self.ledger
                    .refund_escrow(
                        ctx,
                        contract.seller_addr.as_str(),
                        contract.seller_penalty,
                        &format!("{}_pen", contract.id),
                    )
                    .await,
                &contract.id,
                "expiry penalty refund",
            );
        }
        Ok(true)
    }

    async fn complete_locked(
        &self,
        ctx: &CallContext,
        contract: &mut Contract,
    ) -> Result<(), ContractError> {
        contract.status = ContractStatus::Completed;
        contract.resolved_at = Some(now_millis());
        contract.touch();
        self.store.update(ctx, contract).await?;

        let remaining = contract.remaining_budget();
        if !remaining.is_zero() {
            settle_after_terminal(
                self.ledger
                    .refund_escrow(
                        ctx,
                        contract.buyer_addr.as_str(),
                        remaining,
                        &format!("{}_refund", contract.id),
                    )
                    .await,
                &contract.id,
                "completion budget refund",
            );
        }
        if !contract.seller_penalty.is_zero() {
            settle_after_terminal(
                self.ledger
                    .refund_escrow(
                        ctx,
                        contract.seller_addr.as_str(),
                        contract.seller_penalty,
                        &format!("{}_pen", contract.id),
                    )
                    .await,
                &contract.id,
                "completion penalty refund",
            );
        }
        Ok(())
    }

    async fn violate_locked(
        &self,
        ctx: &CallContext,
        contract: &mut Contract,
        window_rate: f64,
    ) -> Result<(), ContractError> {
        warn!(
            "sla violation on contract {}: window rate {:.2}% below {:.2}%",
            contract.id, window_rate, contract.min_success_rate
        );
        contract.status = ContractStatus::Violated;
        contract.resolved_at = Some(now_millis());
        contract.violation_details = Some(ViolationDetails {
            window_rate,
            threshold: contract.min_success_rate,
            window_size: contract.sla_window_size,
        });
        contract.touch();
        self.store.update(ctx, contract).await?;

        if !contract.seller_penalty.is_zero() {
            settle_after_terminal(
                self.ledger
                    .release_escrow(
                        ctx,
                        contract.seller_addr.as_str(),
                        contract.buyer_addr.as_str(),
                        contract.seller_penalty,
                        &format!("{}_pen", contract.id),
                    )
                    .await,
                &contract.id,
                "penalty forfeiture",
            );
        }
        let remaining = contract.remaining_budget();
        if !remaining.is_zero() {
            settle_after_terminal(
                self.ledger
                    .refund_escrow(
                        ctx,
                        contract.buyer_addr.as_str(),
                        remaining,
                        &format!("{}_refund", contract.id),
                    )
                    .await,
                &contract.id,
                "violation budget refund",
            );
        }
        Ok(())
    }

    pub async fn get(&self, ctx: &CallContext, contract_id: &str) -> Result<Contract, ContractError> {
        self.must_get(ctx, contract_id).await
    }

    pub async fn list_by_agent(
        &self,
        ctx: &CallContext,
        addr: &str,
    ) -> Result<Vec<Contract>, ContractError> {
        let addr = AgentAddr::new(addr)?;
        self.store.list_by_agent(ctx, &addr).await
    }

    /// Read-side feed for the verification enforcer: `(successful, total)`
    /// over the newest calls where the agent is seller.
    pub async fn seller_call_stats(
        &self,
        ctx: &CallContext,
        seller: &str,
        window: u32,
    ) -> Result<(u64, u64), ContractError> {
        let seller = AgentAddr::new(seller)?;
        self.store.seller_call_stats(ctx, &seller, window).await
    }
}
