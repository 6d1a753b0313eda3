//! Per-contract linearization under concurrent parties

use std::sync::Arc;

use pact_common::{Amount, CallContext};
use pact_contracts::{
    CallOutcome, ContractEngine, ContractError, ContractProposal, ContractStatus,
    MemoryContractStore,
};
use pact_ledger::{Ledger, LedgerService, MemoryLedgerStore};

fn amt(s: &str) -> Amount {
    Amount::parse(s).unwrap()
}

async fn active_contract(
    ledger: &Ledger<MemoryLedgerStore>,
    engine: &ContractEngine<MemoryContractStore>,
    budget: &str,
    min_volume: u64,
) -> String {
    let ctx = CallContext::new();
    ledger
        .deposit(&ctx, "0xbuyer", amt("100"), "fund_buyer")
        .await
        .unwrap();
    let contract = engine
        .propose(
            &ctx,
            ContractProposal {
                buyer_addr: "0xbuyer".to_string(),
                seller_addr: "0xseller".to_string(),
                service_type: "inference".to_string(),
                price_per_call: amt("0.01"),
                buyer_budget: amt(budget),
                seller_penalty: None,
                min_volume: Some(min_volume),
                max_latency_ms: None,
                min_success_rate: Some(1.0),
                sla_window_size: Some(1000),
                duration: "1d".to_string(),
            },
        )
        .await
        .unwrap();
    engine.accept(&ctx, &contract.id, "0xseller").await.unwrap();
    contract.id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_are_linearized() {
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new())));
    let service: Arc<dyn LedgerService> = ledger.clone();
    let engine = Arc::new(ContractEngine::new(Arc::new(MemoryContractStore::new()), service));

    let contract_id = active_contract(&ledger, &engine, "10", 1).await;

    let mut handles = Vec::new();
    for n in 0..20 {
        let engine = engine.clone();
        let contract_id = contract_id.clone();
        // Both parties may record; alternate the caller
        let caller = if n % 2 == 0 { "0xbuyer" } else { "0xseller" };
        handles.push(tokio::spawn(async move {
            let ctx = CallContext::new();
            engine
                .record_call(&ctx, &contract_id, caller, CallOutcome::success(25))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let ctx = CallContext::new();
    let contract = engine.get(&ctx, &contract_id).await.unwrap();
    assert_eq!(contract.total_calls, 20);
    assert_eq!(contract.successful_calls, 20);
    assert_eq!(contract.budget_spent, amt("0.20"));
    assert_eq!(contract.status, ContractStatus::Active);

    // Exactly one release per call landed with the seller
    let seller = ledger.get_balance(&ctx, "0xseller").await.unwrap();
    assert_eq!(seller.available, amt("0.20"));
    assert!(seller.is_conserved());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_terminal_transition_under_races() {
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new())));
    let service: Arc<dyn LedgerService> = ledger.clone();
    let engine = Arc::new(ContractEngine::new(Arc::new(MemoryContractStore::new()), service));

    // Budget covers exactly four calls
    let contract_id = active_contract(&ledger, &engine, "0.04", 1).await;

    let mut handles = Vec::new();
    for _ in 0..12 {
        let engine = engine.clone();
        let contract_id = contract_id.clone();
        handles.push(tokio::spawn(async move {
            let ctx = CallContext::new();
            engine
                .record_call(&ctx, &contract_id, "0xbuyer", CallOutcome::success(10))
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(ContractError::AlreadyResolved { .. })
            | Err(ContractError::BudgetExhausted { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(succeeded, 4);

    let ctx = CallContext::new();
    let contract = engine.get(&ctx, &contract_id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Completed);
    assert_eq!(contract.budget_spent, amt("0.04"));

    // Terminal exactly once: budget fully released, no double refunds
    let buyer = ledger.get_balance(&ctx, "0xbuyer").await.unwrap();
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert_eq!(buyer.available, amt("99.96"));
    assert!(buyer.is_conserved());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_racing_calls_resolves_once() {
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new())));
    let service: Arc<dyn LedgerService> = ledger.clone();
    let engine = Arc::new(ContractEngine::new(Arc::new(MemoryContractStore::new()), service));

    let contract_id = active_contract(&ledger, &engine, "10", 1).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        let contract_id = contract_id.clone();
        handles.push(tokio::spawn(async move {
            let ctx = CallContext::new();
            engine
                .terminate(&ctx, &contract_id, "0xbuyer", "races")
                .await
        }));
    }

    let mut terminated = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => terminated += 1,
            Err(ContractError::AlreadyResolved { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(terminated, 1);

    // The remaining budget moved to the seller exactly once
    let ctx = CallContext::new();
    let seller = ledger.get_balance(&ctx, "0xseller").await.unwrap();
    assert_eq!(seller.available, amt("10"));
}
