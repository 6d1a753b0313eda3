//! Verification state machine
//!
//! The bond is a two-phase hold against the agent's own balance: revoking
//! releases it, a guarantee breach confirms (burns) the forfeited share.
//! Terminal transitions follow the same precedence rule as contracts: the
//! verification status wins over a trailing ledger failure, which is
//! logged at CRITICAL for out-of-band reconciliation.

use std::sync::Arc;

use log::{error, warn};
use pact_common::{id, now_millis, AgentAddr, Amount, CallContext};
use pact_ledger::{LedgerError, LedgerService};

use crate::error::VerificationError;
use crate::policy::{EvaluationInput, EvaluationResult, Scorer};
use crate::providers::{AgentMetricsProvider, ReputationProvider};
use crate::store::VerificationStore;
use crate::verification::{Verification, VerificationStatus};

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

pub struct VerifiedEngine<S: VerificationStore> {
    store: Arc<S>,
    ledger: Arc<dyn LedgerService>,
    scorer: Scorer,
    reputation: Arc<dyn ReputationProvider>,
    metrics: Arc<dyn AgentMetricsProvider>,
}

impl<S: VerificationStore> VerifiedEngine<S> {
    pub fn new(
        store: Arc<S>,
        ledger: Arc<dyn LedgerService>,
        reputation: Arc<dyn ReputationProvider>,
        metrics: Arc<dyn AgentMetricsProvider>,
    ) -> Self {
        Self {
            store,
            ledger,
            scorer: Scorer::default(),
            reputation,
            metrics,
        }
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn evaluate_agent(
        &self,
        ctx: &CallContext,
        agent: &AgentAddr,
    ) -> Result<(EvaluationResult, EvaluationInput), VerificationError> {
        let reputation = self.reputation.reputation(ctx, agent.as_str()).await?;
        let metrics = self.metrics.metrics(ctx, agent.as_str()).await?;
        let input = EvaluationInput {
            score: reputation.score,
            tier: reputation.tier,
            total_transactions: metrics.total_transactions,
            success_rate: metrics.success_rate,
            days_on_network: metrics.days_on_network,
            total_volume_usd: metrics.total_volume_usd,
        };
        Ok((self.scorer.evaluate(&input), input))
    }

    /// Stake a bond and open a verification. The bond is clamped to the
    /// volume-scaled tier maximum; offering less than the minimum fails.
    pub async fn apply(
        &self,
        ctx: &CallContext,
        agent: &str,
        bond_amount: Amount,
    ) -> Result<Verification, VerificationError> {
        let agent = AgentAddr::new(agent)?;
        if self.store.get_open_for_agent(ctx, &agent).await?.is_some() {
            return Err(VerificationError::AlreadyVerified(agent.to_string()));
        }

        let (evaluation, input) = self.evaluate_agent(ctx, &agent).await?;
        if !evaluation.eligible {
            let reason = evaluation
                .reason
                .clone()
                .unwrap_or_else(|| "not eligible".to_string());
            return Err(VerificationError::NotEligible { reason, evaluation });
        }
        if bond_amount < evaluation.min_bond_amount {
            return Err(VerificationError::BondTooLow {
                minimum: evaluation.min_bond_amount,
                offered: bond_amount,
            });
        }
        let bond_amount = bond_amount.min(evaluation.max_bond_amount);
        ctx.check_cancelled()?;

        let bond_reference = id::bond_reference();
        ledger_ok(
            self.ledger
                .hold(ctx, agent.as_str(), bond_amount, &bond_reference)
                .await,
        )?;

        let now = now_millis();
        let verification = Verification {
            id: id::verification_id(),
            agent_addr: agent.clone(),
            status: VerificationStatus::Active,
            bond_amount,
            bond_reference: bond_reference.clone(),
            guaranteed_success_rate: evaluation.guaranteed_success_rate,
            sla_window_size: evaluation.sla_window_size,
            guarantee_premium_rate: evaluation.guarantee_premium_rate,
            reputation_score: input.score,
            reputation_tier: input.tier,
            total_calls_monitored: 0,
            violation_count: 0,
            last_violation_at: None,
            last_review_at: None,
            revoked_at: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(err) = self.store.insert(ctx, &verification).await {
            if let Err(comp) = ledger_ok(
                self.ledger
                    .release_hold(ctx, agent.as_str(), bond_amount, &bond_reference)
                    .await,
            ) {
                error!(
                    "CRITICAL: failed to release bond hold {} after persist failure: {}",
                    bond_reference, comp
                );
            }
            return Err(err);
        }
        Ok(verification)
    }

    /// Close an open verification and return the remaining bond.
    pub async fn revoke(
        &self,
        ctx: &CallContext,
        agent: &str,
    ) -> Result<Verification, VerificationError> {
        let agent = AgentAddr::new(agent)?;
        let mut verification = self
            .store
            .get_open_for_agent(ctx, &agent)
            .await?
            .ok_or_else(|| VerificationError::NotVerified(agent.to_string()))?;
        ctx.check_cancelled()?;

        verification.status = VerificationStatus::Revoked;
        verification.revoked_at = Some(now_millis());
        verification.touch();
        self.store.update(ctx, &verification).await?;

        if !verification.bond_amount.is_zero() {
            if let Err(err) = ledger_ok(
                self.ledger
                    .release_hold(
                        ctx,
                        agent.as_str(),
                        verification.bond_amount,
                        &verification.bond_reference,
                    )
                    .await,
            ) {
                error!(
                    "CRITICAL: bond release failed for revoked verification {}: {}",
                    verification.id, err
                );
            }
        }
        Ok(verification)
    }

    /// Re-evaluate a suspended agent; eligibility restores `active`.
    pub async fn reinstate(
        &self,
        ctx: &CallContext,
        agent: &str,
    ) -> Result<Verification, VerificationError> {
        let agent = AgentAddr::new(agent)?;
        let mut verification = self
            .store
            .get_open_for_agent(ctx, &agent)
            .await?
            .ok_or_else(|| VerificationError::NotVerified(agent.to_string()))?;
        if verification.status != VerificationStatus::Suspended {
            return Err(VerificationError::InvalidStatus {
                expected: "suspended",
                actual: verification.status,
            });
        }

        let (evaluation, input) = self.evaluate_agent(ctx, &agent).await?;
        if !evaluation.eligible {
            let reason = evaluation
                .reason
                .clone()
                .unwrap_or_else(|| "not eligible".to_string());
            return Err(VerificationError::NotEligible { reason, evaluation });
        }
        ctx.check_cancelled()?;

        verification.status = VerificationStatus::Active;
        verification.reputation_score = input.score;
        verification.reputation_tier = input.tier;
        verification.last_review_at = Some(now_millis());
        verification.touch();
        self.store.update(ctx, &verification).await?;
        Ok(verification)
    }

    /// Periodic eligibility review: active agents that fell below policy
    /// are suspended, suspended agents that recovered are reactivated.
    pub async fn review(
        &self,
        ctx: &CallContext,
        agent: &str,
    ) -> Result<Verification, VerificationError> {
        let agent = AgentAddr::new(agent)?;
        let mut verification = self
            .store
            .get_open_for_agent(ctx, &agent)
            .await?
            .ok_or_else(|| VerificationError::NotVerified(agent.to_string()))?;

        let (evaluation, input) = self.evaluate_agent(ctx, &agent).await?;
        ctx.check_cancelled()?;

        match (verification.status, evaluation.eligible) {
            (VerificationStatus::Active, false) => {
                verification.status = VerificationStatus::Suspended;
            }
            (VerificationStatus::Suspended, true) => {
                verification.status = VerificationStatus::Active;
            }
            _ => {}
        }
        verification.reputation_score = input.score;
        verification.reputation_tier = input.tier;
        verification.last_review_at = Some(now_millis());
        verification.touch();
        self.store.update(ctx, &verification).await?;
        Ok(verification)
    }

    /// Forfeit a bond share proportional to the guarantee shortfall.
    ///
    /// `shortfall = clamp((guaranteed - observed) / guaranteed, 0.01, 1)`;
    /// the forfeited amount is burned out of the bond hold and, when a
    /// fund address is configured, re-deposited there.
    pub async fn record_violation(
        &self,
        ctx: &CallContext,
        agent: &str,
        window_success_rate: f64,
        fund_addr: &str,
    ) -> Result<Verification, VerificationError> {
        let agent = AgentAddr::new(agent)?;
        let mut verification = self
            .store
            .get_open_for_agent(ctx, &agent)
            .await?
            .ok_or_else(|| VerificationError::NotVerified(agent.to_string()))?;
        if verification.status != VerificationStatus::Active {
            return Err(VerificationError::InvalidStatus {
                expected: "active",
                actual: verification.status,
            });
        }
        ctx.check_cancelled()?;

        let guaranteed = verification.guaranteed_success_rate;
        let shortfall = ((guaranteed - window_success_rate) / guaranteed).clamp(0.01, 1.0);
        let forfeit = verification.bond_amount.mul_ratio_trunc(shortfall);

        if !forfeit.is_zero() {
            ledger_ok(
                self.ledger
                    .confirm_hold(ctx, agent.as_str(), forfeit, &verification.bond_reference)
                    .await,
            )?;
            if !fund_addr.is_empty() {
                // The deposit reference stays unique across repeated
                // violations of the same verification.
                let deposit_ref = if verification.violation_count == 0 {
                    format!("vforfeit_{}", verification.id)
                } else {
                    format!(
                        "vforfeit_{}_{}",
                        verification.id,
                        verification.violation_count + 1
                    )
                };
                if let Err(err) = ledger_ok(
                    self.ledger
                        .deposit(ctx, fund_addr, forfeit, &deposit_ref)
                        .await,
                ) {
                    // The hold portion is already burned; the fund credit
                    // is reconciled out of band.
                    error!(
                        "CRITICAL: forfeiture deposit {} to fund {} failed: {}",
                        deposit_ref, fund_addr, err
                    );
                }
            }
        }

        verification.bond_amount = verification.bond_amount.saturating_sub(forfeit);
        verification.violation_count += 1;
        verification.last_violation_at = Some(now_millis());
        verification.status = if verification.bond_amount.is_zero() {
            VerificationStatus::Forfeited
        } else {
            VerificationStatus::Suspended
        };
        verification.touch();
        self.store.update(ctx, &verification).await?;

        warn!(
            "verification {} forfeited {} ({}% window vs {}% guaranteed), now {}",
            verification.id,
            forfeit,
            window_success_rate,
            guaranteed,
            verification.status
        );
        Ok(verification)
    }

    pub async fn get(
        &self,
        ctx: &CallContext,
        agent: &str,
    ) -> Result<Verification, VerificationError> {
        let agent = AgentAddr::new(agent)?;
        self.store
            .get_open_for_agent(ctx, &agent)
            .await?
            .ok_or_else(|| VerificationError::NotVerified(agent.to_string()))
    }

    pub async fn get_by_id(
        &self,
        ctx: &CallContext,
        id: &str,
    ) -> Result<Verification, VerificationError> {
        self.store
            .get(ctx, id)
            .await?
            .ok_or_else(|| VerificationError::VerificationNotFound(id.to_string()))
    }
}
