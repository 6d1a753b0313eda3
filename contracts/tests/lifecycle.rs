//! Contract lifecycle scenarios over the in-memory backends

use std::sync::Arc;
use std::time::Duration;

use pact_common::{Amount, CallContext};
use pact_contracts::{
    CallOutcome, ContractEngine, ContractError, ContractProposal, ContractStatus,
    MemoryContractStore,
};
use pact_ledger::{Ledger, LedgerService, MemoryLedgerStore};

struct Harness {
    ledger: Arc<Ledger<MemoryLedgerStore>>,
    engine: ContractEngine<MemoryContractStore>,
}

fn harness() -> Harness {
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new())));
    let service: Arc<dyn LedgerService> = ledger.clone();
    let engine = ContractEngine::new(Arc::new(MemoryContractStore::new()), service);
    Harness { ledger, engine }
}

fn amt(s: &str) -> Amount {
    Amount::parse(s).unwrap()
}

fn ctx() -> CallContext {
    CallContext::new()
}

fn proposal() -> ContractProposal {
    ContractProposal {
        buyer_addr: "0xbuyer".to_string(),
        seller_addr: "0xseller".to_string(),
        service_type: "inference".to_string(),
        price_per_call: amt("0.005"),
        buyer_budget: amt("0.025"),
        seller_penalty: None,
        min_volume: Some(3),
        max_latency_ms: None,
        min_success_rate: None,
        sla_window_size: None,
        duration: "7d".to_string(),
    }
}

async fn fund_buyer(h: &Harness, amount: &str) {
    h.ledger
        .deposit(&ctx(), "0xbuyer", amt(amount), "funding_buyer")
        .await
        .unwrap();
}

async fn fund_seller(h: &Harness, amount: &str) {
    h.ledger
        .deposit(&ctx(), "0xseller", amt(amount), "funding_seller")
        .await
        .unwrap();
}

// Scenario S1: happy path. Five successful calls complete the contract
// with five separate escrow releases.
#[tokio::test]
async fn test_happy_path_completes_after_budget_spent() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let contract = h.engine.propose(&ctx, proposal()).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xSELLER").await.unwrap();

    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    assert_eq!(buyer.escrowed, amt("0.025"));

    let mut latest = None;
    for _ in 0..5 {
        latest = Some(
            h.engine
                .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(100))
                .await
                .unwrap(),
        );
    }
    let resolved = latest.unwrap();
    assert_eq!(resolved.status, ContractStatus::Completed);
    assert_eq!(resolved.total_calls, 5);
    assert_eq!(resolved.successful_calls, 5);
    assert!(resolved.resolved_at.is_some());

    // Five separate per-call releases landed with the seller
    let seller = h.ledger.get_balance(&ctx, "0xseller").await.unwrap();
    assert_eq!(seller.available, amt("0.025"));
    let seller_history = h.ledger.get_history(&ctx, "0xseller", 20, 0).await.unwrap();
    let receives = seller_history
        .iter()
        .filter(|entry| entry.entry_type.to_string() == "escrow_receive")
        .count();
    assert_eq!(receives, 5);

    // Buyer escrow fully unwound
    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert!(buyer.is_conserved());
}

// Scenario S2: rolling-window violation despite a healthy lifetime rate.
#[tokio::test]
async fn test_window_violation_dominates_lifetime_rate() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "20").await;
    fund_seller(&h, "1").await;

    let mut p = proposal();
    p.min_success_rate = Some(50.0);
    p.sla_window_size = Some(4);
    p.seller_penalty = Some(amt("0.50"));
    p.buyer_budget = amt("10.00");
    p.price_per_call = amt("0.001");
    p.min_volume = Some(1);
    let contract = h.engine.propose(&ctx, p).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();

    for _ in 0..10 {
        let updated = h
            .engine
            .record_call(&ctx, &contract.id, "0xseller", CallOutcome::success(80))
            .await
            .unwrap();
        assert_eq!(updated.status, ContractStatus::Active);
    }
    for _ in 0..2 {
        let updated = h
            .engine
            .record_call(&ctx, &contract.id, "0xseller", CallOutcome::failed(80, "timeout"))
            .await
            .unwrap();
        assert_eq!(updated.status, ContractStatus::Active);
    }

    // 13th call: window [failed, failed, failed, success] = 25% < 50%,
    // lifetime 10/13 ≈ 77% is irrelevant.
    let resolved = h
        .engine
        .record_call(&ctx, &contract.id, "0xseller", CallOutcome::failed(80, "timeout"))
        .await
        .unwrap();
    assert_eq!(resolved.status, ContractStatus::Violated);
    assert!(resolved.lifetime_success_rate() >= 50.0);
    let details = resolved.violation_details.unwrap();
    assert!(details.window_rate < 50.0);
    assert_eq!(details.window_size, 4);

    // Penalty forfeited to the buyer, remaining budget refunded
    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    // 20 funded - 0.010 spent on 10 successful calls + 0.50 penalty
    assert_eq!(buyer.available, amt("20.49"));
    assert_eq!(buyer.escrowed, Amount::ZERO);

    let seller = h.ledger.get_balance(&ctx, "0xseller").await.unwrap();
    assert_eq!(seller.escrowed, Amount::ZERO);
    assert_eq!(seller.available, amt("0.51"));
    assert!(buyer.is_conserved());
    assert!(seller.is_conserved());
}

// Scenario S3: expiry before minVolume terminates with reason "expired".
#[tokio::test]
async fn test_expiration_without_min_volume_terminates() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let mut p = proposal();
    p.duration = "1ms".to_string();
    p.min_volume = Some(10);
    let contract = h.engine.propose(&ctx, p).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();

    for _ in 0..2 {
        h.engine
            .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(50))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    let resolved = h.engine.check_expired(&ctx).await.unwrap();
    assert_eq!(resolved, 1);

    let contract = h.engine.get(&ctx, &contract.id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Terminated);
    assert_eq!(contract.terminated_reason.as_deref(), Some("expired"));

    // Remaining budget went home
    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert!(buyer.is_conserved());
}

#[tokio::test]
async fn test_expired_contract_with_min_volume_completes() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let mut p = proposal();
    p.duration = "1ms".to_string();
    p.min_volume = Some(2);
    let contract = h.engine.propose(&ctx, p).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();
    for _ in 0..2 {
        h.engine
            .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(50))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.engine.check_expired(&ctx).await.unwrap();
    let contract = h.engine.get(&ctx, &contract.id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Completed);
}

#[tokio::test]
async fn test_accept_requires_seller() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let contract = h.engine.propose(&ctx, proposal()).await.unwrap();
    let err = h.engine.accept(&ctx, &contract.id, "0xbuyer").await.unwrap_err();
    assert!(matches!(err, ContractError::Unauthorized(_)));

    let err = h
        .engine
        .record_call(&ctx, &contract.id, "0xintruder", CallOutcome::success(10))
        .await
        .unwrap_err();
    // Not active yet
    assert!(matches!(err, ContractError::InvalidStatus { .. }));
}

#[tokio::test]
async fn test_record_call_requires_party() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let contract = h.engine.propose(&ctx, proposal()).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();
    let err = h
        .engine
        .record_call(&ctx, &contract.id, "0xintruder", CallOutcome::success(10))
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::Unauthorized(_)));
}

#[tokio::test]
async fn test_accept_compensates_buyer_when_penalty_lock_fails() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;
    // Seller has no funds for the penalty

    let mut p = proposal();
    p.seller_penalty = Some(amt("0.50"));
    let contract = h.engine.propose(&ctx, p).await.unwrap();

    let err = h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap_err();
    assert!(matches!(
        err,
        ContractError::Ledger(pact_ledger::LedgerError::InsufficientBalance { .. })
    ));

    // Buyer escrow was compensated, contract still proposed
    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert_eq!(buyer.available, amt("1"));
    let contract = h.engine.get(&ctx, &contract.id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Proposed);
}

#[tokio::test]
async fn test_reject_is_terminal_and_seller_only() {
    let h = harness();
    let ctx = ctx();

    let contract = h.engine.propose(&ctx, proposal()).await.unwrap();
    let err = h.engine.reject(&ctx, &contract.id, "0xbuyer").await.unwrap_err();
    assert!(matches!(err, ContractError::Unauthorized(_)));

    let rejected = h.engine.reject(&ctx, &contract.id, "0xseller").await.unwrap();
    assert_eq!(rejected.status, ContractStatus::Rejected);

    let err = h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap_err();
    assert!(matches!(err, ContractError::AlreadyResolved { .. }));
}

#[tokio::test]
async fn test_terminal_status_is_irrevocable() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let contract = h.engine.propose(&ctx, proposal()).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();
    for _ in 0..5 {
        h.engine
            .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(10))
            .await
            .unwrap();
    }
    let contract = h.engine.get(&ctx, &contract.id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Completed);

    let err = h
        .engine
        .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(10))
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::AlreadyResolved { .. }));
    let err = h
        .engine
        .terminate(&ctx, &contract.id, "0xbuyer", "done")
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::AlreadyResolved { .. }));
}

#[tokio::test]
async fn test_budget_exhausted_precondition() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let mut p = proposal();
    // Budget covers a single call; minVolume keeps it from completing
    p.buyer_budget = amt("0.005");
    p.min_volume = Some(10);
    let contract = h.engine.propose(&ctx, p).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();

    h.engine
        .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(10))
        .await
        .unwrap();
    let err = h
        .engine
        .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::failed(10, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::BudgetExhausted { .. }));
}

#[tokio::test]
async fn test_buyer_termination_compensates_seller() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;
    fund_seller(&h, "1").await;

    let mut p = proposal();
    p.seller_penalty = Some(amt("0.10"));
    let contract = h.engine.propose(&ctx, p).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();
    h.engine
        .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(10))
        .await
        .unwrap();

    let resolved = h
        .engine
        .terminate(&ctx, &contract.id, "0xbuyer", "changed my mind")
        .await
        .unwrap();
    assert_eq!(resolved.status, ContractStatus::Terminated);
    assert_eq!(
        resolved.terminated_by.as_ref().map(|a| a.as_str()),
        Some("0xbuyer")
    );

    // Remaining budget 0.020 went to the seller, penalty returned
    let seller = h.ledger.get_balance(&ctx, "0xseller").await.unwrap();
    assert_eq!(seller.available, amt("1.025"));
    assert_eq!(seller.escrowed, Amount::ZERO);

    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert_eq!(buyer.available, amt("0.975"));
}

#[tokio::test]
async fn test_seller_termination_forfeits_penalty() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;
    fund_seller(&h, "1").await;

    let mut p = proposal();
    p.seller_penalty = Some(amt("0.10"));
    let contract = h.engine.propose(&ctx, p).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();

    h.engine
        .terminate(&ctx, &contract.id, "0xseller", "capacity")
        .await
        .unwrap();

    // Penalty to the buyer, full budget refunded
    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    assert_eq!(buyer.available, amt("1.10"));
    assert_eq!(buyer.escrowed, Amount::ZERO);

    let seller = h.ledger.get_balance(&ctx, "0xseller").await.unwrap();
    assert_eq!(seller.available, amt("0.90"));
    assert_eq!(seller.escrowed, Amount::ZERO);
}

// The completion dust residue is refunded, never dropped or spent.
#[tokio::test]
async fn test_completion_refunds_dust_residue() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let mut p = proposal();
    p.buyer_budget = amt("0.012");
    p.price_per_call = amt("0.005");
    p.min_volume = Some(2);
    let contract = h.engine.propose(&ctx, p).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();

    for _ in 0..2 {
        h.engine
            .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(10))
            .await
            .unwrap();
    }
    let contract = h.engine.get(&ctx, &contract.id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Completed);
    assert_eq!(contract.budget_spent, amt("0.010"));

    // The 0.002 residue is back in the buyer's available partition
    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    assert_eq!(buyer.available, amt("0.992"));
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert!(buyer.is_conserved());
}

// Property 6: across a lifetime, released + refunded = buyerBudget.
#[tokio::test]
async fn test_escrow_discipline_accounting() {
    let h = harness();
    let ctx = ctx();
    fund_buyer(&h, "1").await;

    let contract = h.engine.propose(&ctx, proposal()).await.unwrap();
    h.engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();
    for _ in 0..3 {
        h.engine
            .record_call(&ctx, &contract.id, "0xbuyer", CallOutcome::success(10))
            .await
            .unwrap();
    }
    h.engine
        .terminate(&ctx, &contract.id, "0xseller", "done early")
        .await
        .unwrap();

    let seller = h.ledger.get_balance(&ctx, "0xseller").await.unwrap();
    let buyer = h.ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    // 3 × 0.005 released + 0.010 refunded = the full 0.025 budget
    assert_eq!(seller.available, amt("0.015"));
    assert_eq!(buyer.available, amt("0.985"));
    assert_eq!(buyer.escrowed, Amount::ZERO);
}

#[tokio::test]
async fn test_contract_not_found() {
    let h = harness();
    let err = h.engine.get(&ctx(), "ct_missing").await.unwrap_err();
    assert!(matches!(err, ContractError::ContractNotFound(_)));
}
