//! Postgres backend conformance
//!
//! Requires a reachable database:
//!   PACT_TEST_DATABASE_URL=postgres://... cargo test -p pact_ledger -- --ignored

use std::sync::Arc;

use pact_common::{Amount, CallContext};
use pact_ledger::{Ledger, LedgerError, PostgresLedgerStore};
use sqlx::postgres::PgPoolOptions;

async fn ledger() -> Ledger<PostgresLedgerStore> {
    let url = std::env::var("PACT_TEST_DATABASE_URL")
        .expect("PACT_TEST_DATABASE_URL must point at a test database");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to test database");
    let store = PostgresLedgerStore::new(pool);
    store.init_schema().await.expect("apply schema");
    Ledger::new(Arc::new(store))
}

fn amt(s: &str) -> Amount {
    Amount::parse(s).unwrap()
}

fn unique_agent(tag: &str) -> String {
    format!("0xpg_{}_{}", tag, pact_common::now_millis())
}

#[tokio::test]
#[ignore]
async fn test_pg_deposit_hold_credit_cycle() {
    let ledger = ledger().await;
    let ctx = CallContext::new();
    let agent = unique_agent("cycle");

    ledger
        .deposit(&ctx, &agent, amt("3"), &format!("{agent}_tx1"))
        .await
        .unwrap();
    ledger.set_credit_limit(&ctx, &agent, amt("10")).await.unwrap();
    let balance = ledger.hold(&ctx, &agent, amt("5"), "h1").await.unwrap();
    assert_eq!(balance.available, Amount::ZERO);
    assert_eq!(balance.pending, amt("5"));
    assert_eq!(balance.credit_used, amt("2"));

    let balance = ledger.release_hold(&ctx, &agent, amt("5"), "h1").await.unwrap();
    assert_eq!(balance.available, amt("3"));
    assert_eq!(balance.credit_used, Amount::ZERO);
    assert!(balance.is_conserved());

    let report = ledger.reconcile_agent(&ctx, &agent).await.unwrap();
    assert!(report.matches, "mismatches: {:?}", report.mismatches());
}

#[tokio::test]
#[ignore]
async fn test_pg_conditional_guard_rejects_overdraft() {
    let ledger = ledger().await;
    let ctx = CallContext::new();
    let agent = unique_agent("guard");

    ledger
        .deposit(&ctx, &agent, amt("1"), &format!("{agent}_tx1"))
        .await
        .unwrap();
    let err = ledger
        .withdraw(&ctx, &agent, amt("2"), &format!("{agent}_tx2"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

    let balance = ledger.get_balance(&ctx, &agent).await.unwrap();
    assert_eq!(balance.available, amt("1"));
}

#[tokio::test]
#[ignore]
async fn test_pg_duplicate_deposit_rejected() {
    let ledger = ledger().await;
    let ctx = CallContext::new();
    let agent = unique_agent("dup");
    let tx = format!("{agent}_tx");

    ledger.deposit(&ctx, &agent, amt("5"), &tx).await.unwrap();
    let err = ledger.deposit(&ctx, &agent, amt("5"), &tx).await.unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateDeposit(_)));
}
