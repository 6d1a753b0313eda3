//! Postgres verification store conformance
//!
//! Requires a reachable database:
//!   PACT_TEST_DATABASE_URL=postgres://... cargo test -p pact_verified -- --ignored

use pact_common::{id, now_millis, AgentAddr, Amount, CallContext};
use pact_verified::{
    PostgresVerificationStore, Verification, VerificationError, VerificationStatus,
    VerificationStore,
};
use sqlx::postgres::PgPoolOptions;

async fn store() -> PostgresVerificationStore {
    let url = std::env::var("PACT_TEST_DATABASE_URL")
        .expect("PACT_TEST_DATABASE_URL must point at a test database");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to test database");
    let store = PostgresVerificationStore::new(pool);
    store.init_schema().await.expect("apply schema");
    store
}

fn verification(agent: &AgentAddr) -> Verification {
    let now = now_millis();
    Verification {
        id: id::verification_id(),
        agent_addr: agent.clone(),
        status: VerificationStatus::Active,
        bond_amount: Amount::parse("100").unwrap(),
        bond_reference: id::bond_reference(),
        guaranteed_success_rate: 97.0,
        sla_window_size: 20,
        guarantee_premium_rate: 0.02,
        reputation_score: 92.0,
        reputation_tier: "elite".to_string(),
        total_calls_monitored: 0,
        violation_count: 0,
        last_violation_at: None,
        last_review_at: None,
        revoked_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
#[ignore]
async fn test_pg_single_open_verification_per_agent() {
    let store = store().await;
    let ctx = CallContext::new();
    let agent = AgentAddr::new(&format!("0xpg_verified_{}", now_millis())).unwrap();

    store.insert(&ctx, &verification(&agent)).await.unwrap();

    // The partial unique index rejects a second open row
    let err = store.insert(&ctx, &verification(&agent)).await.unwrap_err();
    assert!(matches!(err, VerificationError::AlreadyVerified(_)));

    // Closing the first frees the slot
    let mut open = store.get_open_for_agent(&ctx, &agent).await.unwrap().unwrap();
    open.status = VerificationStatus::Revoked;
    open.revoked_at = Some(now_millis());
    store.update(&ctx, &open).await.unwrap();

    store.insert(&ctx, &verification(&agent)).await.unwrap();
}
