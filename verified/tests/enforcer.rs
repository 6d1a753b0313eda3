//! Enforcer fed by the real contract engine read side

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pact_common::{Amount, CallContext};
use pact_contracts::{
    CallOutcome, ContractEngine, ContractProposal, MemoryContractStore,
};
use pact_ledger::{Ledger, LedgerService, MemoryLedgerStore};
use pact_verified::{
    AgentMetrics, AgentMetricsProvider, CallStats, ContractCallProvider, Enforcer,
    EnforcerConfig, MemoryVerificationStore, ProviderError, ReputationProvider,
    ReputationSnapshot, Scorer, TierPolicy, VerificationStatus, VerifiedEngine,
};

struct StaticReputation(ReputationSnapshot);

#[async_trait]
impl ReputationProvider for StaticReputation {
    async fn reputation(
        &self,
        _ctx: &CallContext,
        _agent: &str,
    ) -> Result<ReputationSnapshot, ProviderError> {
        Ok(self.0.clone())
    }
}

struct StaticMetrics(AgentMetrics);

#[async_trait]
impl AgentMetricsProvider for StaticMetrics {
    async fn metrics(
        &self,
        _ctx: &CallContext,
        _agent: &str,
    ) -> Result<AgentMetrics, ProviderError> {
        Ok(self.0.clone())
    }
}

/// Feeds the enforcer from the contract engine's call history
struct ContractCallFeed(Arc<ContractEngine<MemoryContractStore>>);

#[async_trait]
impl ContractCallProvider for ContractCallFeed {
    async fn seller_call_stats(
        &self,
        ctx: &CallContext,
        agent: &str,
        window: u32,
    ) -> Result<CallStats, ProviderError> {
        self.0
            .seller_call_stats(ctx, agent, window)
            .await
            .map(|(successful, total)| CallStats { successful, total })
            .map_err(|err| ProviderError::Backend(err.to_string()))
    }
}

struct FailingFeed;

#[async_trait]
impl ContractCallProvider for FailingFeed {
    async fn seller_call_stats(
        &self,
        _ctx: &CallContext,
        _agent: &str,
        _window: u32,
    ) -> Result<CallStats, ProviderError> {
        Err(ProviderError::Unavailable("feed down".to_string()))
    }
}

fn amt(s: &str) -> Amount {
    Amount::parse(s).unwrap()
}

fn ctx() -> CallContext {
    CallContext::new()
}

fn lenient_scorer(window: u32, guaranteed: f64) -> Scorer {
    let mut policies = HashMap::new();
    policies.insert(
        "standard".to_string(),
        TierPolicy {
            min_reputation_score: 0.0,
            min_days_on_network: 0,
            min_transactions: 0,
            min_success_rate: 0.0,
            min_bond_amount: amt("1"),
            max_bond_amount: amt("100"),
            guaranteed_success_rate: guaranteed,
            sla_window_size: window,
            guarantee_premium_rate: 0.05,
        },
    );
    Scorer::new(policies)
}

struct Stack {
    ledger: Arc<Ledger<MemoryLedgerStore>>,
    contracts: Arc<ContractEngine<MemoryContractStore>>,
    verified: Arc<VerifiedEngine<MemoryVerificationStore>>,
}

fn stack(window: u32, guaranteed: f64) -> Stack {
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new())));
    let service: Arc<dyn LedgerService> = ledger.clone();
    let contracts = Arc::new(ContractEngine::new(
        Arc::new(MemoryContractStore::new()),
        service.clone(),
    ));
    let reputation = Arc::new(StaticReputation(ReputationSnapshot {
        score: 80.0,
        tier: "standard".to_string(),
    }));
    let metrics = Arc::new(StaticMetrics(AgentMetrics {
        total_transactions: 1_000,
        success_rate: 99.0,
        days_on_network: 120,
        total_volume_usd: 50_000.0,
    }));
    let verified = Arc::new(
        VerifiedEngine::new(
            Arc::new(MemoryVerificationStore::new()),
            service,
            reputation,
            metrics,
        )
        .with_scorer(lenient_scorer(window, guaranteed)),
    );
    Stack {
        ledger,
        contracts,
        verified,
    }
}

async fn active_contract(stack: &Stack) -> String {
    stack
        .ledger
        .deposit(&ctx(), "0xbuyer", amt("100"), "fund_buyer")
        .await
        .unwrap();
    let contract = stack
        .contracts
        .propose(
            &ctx(),
            ContractProposal {
                buyer_addr: "0xbuyer".to_string(),
                seller_addr: "0xseller".to_string(),
                service_type: "inference".to_string(),
                price_per_call: amt("0.01"),
                buyer_budget: amt("10"),
                seller_penalty: None,
                min_volume: Some(1),
                max_latency_ms: None,
                // Keep the contract's own SLA out of the way
                min_success_rate: Some(1.0),
                sla_window_size: Some(100),
                duration: "7d".to_string(),
            },
        )
        .await
        .unwrap();
    stack
        .contracts
        .accept(&ctx(), &contract.id, "0xseller")
        .await
        .unwrap();
    contract.id
}

#[tokio::test]
async fn test_sweep_records_violation_from_contract_feed() {
    let stack = stack(4, 75.0);
    let ctx = ctx();

    stack
        .ledger
        .deposit(&ctx, "0xseller", amt("50"), "fund_seller")
        .await
        .unwrap();
    stack.verified.apply(&ctx, "0xseller", amt("20")).await.unwrap();

    let contract_id = active_contract(&stack).await;
    // Window of 4: two failures out of four = 50% < 75%
    for outcome in [
        CallOutcome::success(10),
        CallOutcome::failed(10, "timeout"),
        CallOutcome::success(10),
        CallOutcome::failed(10, "timeout"),
    ] {
        stack
            .contracts
            .record_call(&ctx, &contract_id, "0xbuyer", outcome)
            .await
            .unwrap();
    }

    let feed = ContractCallFeed(stack.contracts.clone());
    let violations = stack
        .verified
        .enforce_guarantees(&ctx, &feed, "0xfund")
        .await
        .unwrap();
    assert_eq!(violations, 1);

    let verification = stack
        .verified
        .get(&ctx, "0xseller")
        .await
        .unwrap();
    assert_eq!(verification.status, VerificationStatus::Suspended);
    assert!(verification.bond_amount < amt("20"));
    assert_eq!(verification.total_calls_monitored, 4);

    // shortfall = (75 - 50) / 75 = 1/3, forfeit = 20/3
    assert_eq!(verification.bond_amount, amt("13.333334"));
    let fund = stack.ledger.get_balance(&ctx, "0xfund").await.unwrap();
    assert_eq!(fund.available, amt("6.666666"));
}

#[tokio::test]
async fn test_sweep_skips_partial_window() {
    let stack = stack(4, 75.0);
    let ctx = ctx();

    stack
        .ledger
        .deposit(&ctx, "0xseller", amt("50"), "fund_seller")
        .await
        .unwrap();
    stack.verified.apply(&ctx, "0xseller", amt("20")).await.unwrap();

    let contract_id = active_contract(&stack).await;
    // Only three calls: the window is not full, nothing may be decided
    for outcome in [
        CallOutcome::failed(10, "x"),
        CallOutcome::failed(10, "x"),
        CallOutcome::failed(10, "x"),
    ] {
        stack
            .contracts
            .record_call(&ctx, &contract_id, "0xbuyer", outcome)
            .await
            .unwrap();
    }

    let feed = ContractCallFeed(stack.contracts.clone());
    let violations = stack
        .verified
        .enforce_guarantees(&ctx, &feed, "0xfund")
        .await
        .unwrap();
    assert_eq!(violations, 0);

    let verification = stack.verified.get(&ctx, "0xseller").await.unwrap();
    assert_eq!(verification.status, VerificationStatus::Active);
    assert_eq!(verification.bond_amount, amt("20"));
    // Monitoring counters still moved
    assert_eq!(verification.total_calls_monitored, 3);
}

#[tokio::test]
async fn test_sweep_survives_provider_failure() {
    let stack = stack(4, 75.0);
    let ctx = ctx();

    stack
        .ledger
        .deposit(&ctx, "0xseller", amt("50"), "fund_seller")
        .await
        .unwrap();
    stack.verified.apply(&ctx, "0xseller", amt("20")).await.unwrap();

    let violations = stack
        .verified
        .enforce_guarantees(&ctx, &FailingFeed, "0xfund")
        .await
        .unwrap();
    assert_eq!(violations, 0);

    // The agent is untouched
    let verification = stack.verified.get(&ctx, "0xseller").await.unwrap();
    assert_eq!(verification.status, VerificationStatus::Active);
}

#[tokio::test]
async fn test_background_enforcer_start_stop() {
    let stack = stack(4, 75.0);
    let feed: Arc<dyn ContractCallProvider> = Arc::new(ContractCallFeed(stack.contracts.clone()));
    let enforcer = Enforcer::spawn(
        stack.verified.clone(),
        feed,
        EnforcerConfig {
            interval: Duration::from_millis(10),
            fund_addr: "0xfund".to_string(),
        },
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    enforcer.stop().await;
    // Second stop is a no-op
    enforcer.stop().await;
}
