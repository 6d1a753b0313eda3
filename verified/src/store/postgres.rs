//! Postgres verification store
//!
//! The at-most-one-open-verification invariant is a partial unique index
//! over non-terminal statuses; a concurrent insert surfaces as a
//! constraint violation and is mapped to `AlreadyVerified`.

use async_trait::async_trait;
use pact_common::{AgentAddr, Amount, CallContext, StorageError, TimestampMillis};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::VerificationError;
use crate::store::VerificationStore;
use crate::verification::Verification;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS verifications (
    id                      TEXT PRIMARY KEY,
    agent_addr              TEXT NOT NULL,
    status                  TEXT NOT NULL,
    bond_amount             NUMERIC(30,6) NOT NULL CHECK (bond_amount >= 0),
    bond_reference          TEXT NOT NULL,
    guaranteed_success_rate DOUBLE PRECISION NOT NULL,
    sla_window_size         INTEGER NOT NULL,
    guarantee_premium_rate  DOUBLE PRECISION NOT NULL,
    reputation_score        DOUBLE PRECISION NOT NULL,
    reputation_tier         TEXT NOT NULL,
    total_calls_monitored   BIGINT NOT NULL DEFAULT 0,
    violation_count         INTEGER NOT NULL DEFAULT 0,
    last_violation_at       BIGINT,
    last_review_at          BIGINT,
    revoked_at              BIGINT,
    created_at              BIGINT NOT NULL,
    updated_at              BIGINT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS verifications_open_agent_idx
    ON verifications (agent_addr) WHERE status IN ('active', 'suspended');
CREATE INDEX IF NOT EXISTS verifications_status_idx ON verifications (status);
"#;

const SELECT_VERIFICATION: &str = "SELECT id, agent_addr, status, \
     bond_amount::text AS bond_amount, bond_reference, guaranteed_success_rate, \
     sla_window_size, guarantee_premium_rate, reputation_score, reputation_tier, \
     total_calls_monitored, violation_count, last_violation_at, last_review_at, \
     revoked_at, created_at, updated_at FROM verifications";

fn opt_millis(raw: Option<i64>) -> Option<TimestampMillis> {
    raw.map(|v| v as TimestampMillis)
}

fn row_to_verification(row: &PgRow) -> Result<Verification, VerificationError> {
    let agent: String = row.try_get("agent_addr").map_err(StorageError::from)?;
    let status: String = row.try_get("status").map_err(StorageError::from)?;
    Ok(Verification {
        id: row.try_get("id").map_err(StorageError::from)?,
        agent_addr: AgentAddr::new(&agent)?,
        status: status.parse().map_err(|_| {
            StorageError::Backend(format!("unknown verification status '{status}'"))
        })?,
        bond_amount: Amount::parse(
            &row.try_get::<String, _>("bond_amount").map_err(StorageError::from)?,
        )
        .map_err(VerificationError::InvalidAmount)?,
        bond_reference: row.try_get("bond_reference").map_err(StorageError::from)?,
        guaranteed_success_rate: row
            .try_get("guaranteed_success_rate")
            .map_err(StorageError::from)?,
        sla_window_size: row.try_get::<i32, _>("sla_window_size").map_err(StorageError::from)?
            as u32,
        guarantee_premium_rate: row
            .try_get("guarantee_premium_rate")
            .map_err(StorageError::from)?,
        reputation_score: row.try_get("reputation_score").map_err(StorageError::from)?,
        reputation_tier: row.try_get("reputation_tier").map_err(StorageError::from)?,
        total_calls_monitored: row
            .try_get::<i64, _>("total_calls_monitored")
            .map_err(StorageError::from)? as u64,
        violation_count: row.try_get::<i32, _>("violation_count").map_err(StorageError::from)?
            as u32,
        last_violation_at: opt_millis(row.try_get("last_violation_at").map_err(StorageError::from)?),
        last_review_at: opt_millis(row.try_get("last_review_at").map_err(StorageError::from)?),
        revoked_at: opt_millis(row.try_get("revoked_at").map_err(StorageError::from)?),
        created_at: row.try_get::<i64, _>("created_at").map_err(StorageError::from)? as u64,
        updated_at: row.try_get::<i64, _>("updated_at").map_err(StorageError::from)? as u64,
    })
}

pub struct PostgresVerificationStore {
    pool: PgPool,
}

impl PostgresVerificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), VerificationError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }
}

#[async_trait]
impl VerificationStore for PostgresVerificationStore {
    async fn insert(
        &self,
        ctx: &CallContext,
        verification: &Verification,
    ) -> Result<(), VerificationError> {
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "INSERT INTO verifications (id, agent_addr, status, bond_amount, bond_reference, \
             guaranteed_success_rate, sla_window_size, guarantee_premium_rate, \
             reputation_score, reputation_tier, total_calls_monitored, violation_count, \
             last_violation_at, last_review_at, revoked_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4::numeric, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
             $15, $16, $17)",
        )
        .bind(&verification.id)
        .bind(verification.agent_addr.as_str())
        .bind(verification.status.to_string())
        .bind(verification.bond_amount.to_string())
        .bind(&verification.bond_reference)
        .bind(verification.guaranteed_success_rate)
        .bind(verification.sla_window_size as i32)
        .bind(verification.guarantee_premium_rate)
        .bind(verification.reputation_score)
        .bind(&verification.reputation_tier)
        .bind(verification.total_calls_monitored as i64)
        .bind(verification.violation_count as i32)
        .bind(verification.last_violation_at.map(|v| v as i64))
        .bind(verification.last_review_at.map(|v| v as i64))
        .bind(verification.revoked_at.map(|v| v as i64))
        .bind(verification.created_at as i64)
        .bind(verification.updated_at as i64)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => match StorageError::from(err) {
                StorageError::Constraint(_) => Err(VerificationError::AlreadyVerified(
                    verification.agent_addr.to_string(),
                )),
                other => Err(other.into()),
            },
        }
    }

    async fn update(
        &self,
        ctx: &CallContext,
        verification: &Verification,
    ) -> Result<(), VerificationError> {
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE verifications SET status = $2, bond_amount = $3::numeric, \
             guaranteed_success_rate = $4, sla_window_size = $5, guarantee_premium_rate = $6, \
             reputation_score = $7, reputation_tier = $8, total_calls_monitored = $9, \
             violation_count = $10, last_violation_at = $11, last_review_at = $12, \
             revoked_at = $13, updated_at = $14 \
             WHERE id = $1",
        )
        .bind(&verification.id)
        .bind(verification.status.to_string())
        .bind(verification.bond_amount.to_string())
        .bind(verification.guaranteed_success_rate)
        .bind(verification.sla_window_size as i32)
        .bind(verification.guarantee_premium_rate)
        .bind(verification.reputation_score)
        .bind(&verification.reputation_tier)
        .bind(verification.total_calls_monitored as i64)
        .bind(verification.violation_count as i32)
        .bind(verification.last_violation_at.map(|v| v as i64))
        .bind(verification.last_review_at.map(|v| v as i64))
        .bind(verification.revoked_at.map(|v| v as i64))
        .bind(verification.updated_at as i64)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            return Err(VerificationError::VerificationNotFound(
                verification.id.clone(),
            ));
        }
        Ok(())
    }

    async fn get(
        &self,
        _ctx: &CallContext,
        id: &str,
    ) -> Result<Option<Verification>, VerificationError> {
        sqlx::query(&format!("{SELECT_VERIFICATION} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?
            .map(|row| row_to_verification(&row))
            .transpose()
    }

    async fn get_open_for_agent(
        &self,
        _ctx: &CallContext,
        agent: &AgentAddr,
    ) -> Result<Option<Verification>, VerificationError> {
        sqlx::query(&format!(
            "{SELECT_VERIFICATION} WHERE agent_addr = $1 AND status IN ('active', 'suspended')"
        ))
        .bind(agent.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?
        .map(|row| row_to_verification(&row))
        .transpose()
    }

    async fn list_active(
        &self,
        _ctx: &CallContext,
        limit: usize,
    ) -> Result<Vec<Verification>, VerificationError> {
        let rows = sqlx::query(&format!(
            "{SELECT_VERIFICATION} WHERE status = 'active' ORDER BY created_at LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(row_to_verification).collect()
    }
}
