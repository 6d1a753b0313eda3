//! Postgres contract store conformance
//!
//! Requires a reachable database:
//!   PACT_TEST_DATABASE_URL=postgres://... cargo test -p pact_contracts -- --ignored

use pact_common::{AgentAddr, Amount, CallContext};
use pact_contracts::{ContractProposal, ContractStore, PostgresContractStore};
use sqlx::postgres::PgPoolOptions;

async fn store() -> PostgresContractStore {
    let url = std::env::var("PACT_TEST_DATABASE_URL")
        .expect("PACT_TEST_DATABASE_URL must point at a test database");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to test database");
    let store = PostgresContractStore::new(pool);
    store.init_schema().await.expect("apply schema");
    store
}

fn amt(s: &str) -> Amount {
    Amount::parse(s).unwrap()
}

#[tokio::test]
#[ignore]
async fn test_pg_contract_roundtrip() {
    let store = store().await;
    let ctx = CallContext::new();
    let suffix = pact_common::now_millis();

    let contract = ContractProposal {
        buyer_addr: format!("0xpg_buyer_{suffix}"),
        seller_addr: format!("0xpg_seller_{suffix}"),
        service_type: "inference".to_string(),
        price_per_call: amt("0.005"),
        buyer_budget: amt("0.025"),
        seller_penalty: Some(amt("0.50")),
        min_volume: Some(3),
        max_latency_ms: None,
        min_success_rate: None,
        sla_window_size: None,
        duration: "7d".to_string(),
    }
    .into_contract()
    .unwrap();

    store.insert(&ctx, &contract).await.unwrap();
    let loaded = store.get(&ctx, &contract.id).await.unwrap().unwrap();
    assert_eq!(loaded.buyer_addr, contract.buyer_addr);
    assert_eq!(loaded.price_per_call, contract.price_per_call);
    assert_eq!(loaded.seller_penalty, amt("0.50"));
    assert_eq!(loaded.status, contract.status);

    let seller = AgentAddr::new(&format!("0xpg_seller_{suffix}")).unwrap();
    let listed = store.list_by_agent(&ctx, &seller).await.unwrap();
    assert_eq!(listed.len(), 1);
}
