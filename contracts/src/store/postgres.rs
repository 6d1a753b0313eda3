//! Postgres contract store

use async_trait::async_trait;
use pact_common::{AgentAddr, Amount, CallContext, StorageError, TimestampMillis};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::contract::{Contract, ContractCall, ViolationDetails};
use crate::error::ContractError;
use crate::store::ContractStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contracts (
    id                    TEXT PRIMARY KEY,
    buyer_addr            TEXT NOT NULL,
    seller_addr           TEXT NOT NULL,
    service_type          TEXT NOT NULL,
    price_per_call        NUMERIC(30,6) NOT NULL,
    buyer_budget          NUMERIC(30,6) NOT NULL,
    seller_penalty        NUMERIC(30,6) NOT NULL DEFAULT 0,
    min_volume            BIGINT NOT NULL,
    max_latency_ms        BIGINT NOT NULL,
    min_success_rate      DOUBLE PRECISION NOT NULL,
    sla_window_size       INTEGER NOT NULL,
    duration              TEXT NOT NULL,
    status                TEXT NOT NULL,
    starts_at             BIGINT,
    expires_at            BIGINT,
    resolved_at           BIGINT,
    total_calls           BIGINT NOT NULL DEFAULT 0,
    successful_calls      BIGINT NOT NULL DEFAULT 0,
    failed_calls          BIGINT NOT NULL DEFAULT 0,
    total_latency_ms      BIGINT NOT NULL DEFAULT 0,
    budget_spent          NUMERIC(30,6) NOT NULL DEFAULT 0,
    terminated_by         TEXT,
    terminated_reason     TEXT,
    violation_window_rate DOUBLE PRECISION,
    violation_threshold   DOUBLE PRECISION,
    violation_window_size INTEGER,
    created_at            BIGINT NOT NULL,
    updated_at            BIGINT NOT NULL,
    CHECK (budget_spent <= buyer_budget)
);

CREATE INDEX IF NOT EXISTS contracts_buyer_idx ON contracts (buyer_addr);
CREATE INDEX IF NOT EXISTS contracts_seller_idx ON contracts (seller_addr);
CREATE INDEX IF NOT EXISTS contracts_status_expiry_idx ON contracts (status, expires_at);

CREATE TABLE IF NOT EXISTS contract_calls (
    id          TEXT PRIMARY KEY,
    contract_id TEXT NOT NULL REFERENCES contracts (id),
    status      TEXT NOT NULL,
    latency_ms  BIGINT NOT NULL,
    error_msg   TEXT,
    amount      NUMERIC(30,6) NOT NULL,
    created_at  BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS contract_calls_contract_idx
    ON contract_calls (contract_id, created_at DESC);
"#;

const SELECT_CONTRACT: &str = "SELECT id, buyer_addr, seller_addr, service_type, \
     price_per_call::text AS price_per_call, buyer_budget::text AS buyer_budget, \
     seller_penalty::text AS seller_penalty, min_volume, max_latency_ms, \
     min_success_rate, sla_window_size, duration, status, starts_at, expires_at, \
     resolved_at, total_calls, successful_calls, failed_calls, total_latency_ms, \
     budget_spent::text AS budget_spent, terminated_by, terminated_reason, \
     violation_window_rate, violation_threshold, violation_window_size, \
     created_at, updated_at FROM contracts";

fn parse_amount(raw: &str) -> Result<Amount, ContractError> {
    Ok(Amount::parse(raw)?)
}

fn opt_millis(raw: Option<i64>) -> Option<TimestampMillis> {
    raw.map(|v| v as TimestampMillis)
}

fn row_to_contract(row: &PgRow) -> Result<Contract, ContractError> {
    let buyer: String = row.try_get("buyer_addr").map_err(StorageError::from)?;
    let seller: String = row.try_get("seller_addr").map_err(StorageError::from)?;
    let status: String = row.try_get("status").map_err(StorageError::from)?;
    let terminated_by: Option<String> =
        row.try_get("terminated_by").map_err(StorageError::from)?;
    let violation_window_rate: Option<f64> =
        row.try_get("violation_window_rate").map_err(StorageError::from)?;
    let violation_details = match violation_window_rate {
        Some(window_rate) => Some(ViolationDetails {
            window_rate,
            threshold: row
                .try_get::<Option<f64>, _>("violation_threshold")
                .map_err(StorageError::from)?
                .unwrap_or_default(),
            window_size: row
                .try_get::<Option<i32>, _>("violation_window_size")
                .map_err(StorageError::from)?
                .unwrap_or_default() as u32,
        }),
        None => None,
    };

    Ok(Contract {
        id: row.try_get("id").map_err(StorageError::from)?,
        buyer_addr: AgentAddr::new(&buyer)?,
        seller_addr: AgentAddr::new(&seller)?,
        service_type: row.try_get("service_type").map_err(StorageError::from)?,
        price_per_call: parse_amount(
            &row.try_get::<String, _>("price_per_call").map_err(StorageError::from)?,
        )?,
        buyer_budget: parse_amount(
            &row.try_get::<String, _>("buyer_budget").map_err(StorageError::from)?,
        )?,
        seller_penalty: parse_amount(
            &row.try_get::<String, _>("seller_penalty").map_err(StorageError::from)?,
        )?,
        min_volume: row.try_get::<i64, _>("min_volume").map_err(StorageError::from)? as u64,
        max_latency_ms: row.try_get::<i64, _>("max_latency_ms").map_err(StorageError::from)?
            as u64,
        min_success_rate: row.try_get("min_success_rate").map_err(StorageError::from)?,
        sla_window_size: row.try_get::<i32, _>("sla_window_size").map_err(StorageError::from)?
            as u32,
        duration: row.try_get("duration").map_err(StorageError::from)?,
        status: status
            .parse()
            .map_err(|_| StorageError::Backend(format!("unknown contract status '{status}'")))?,
        starts_at: opt_millis(row.try_get("starts_at").map_err(StorageError::from)?),
        expires_at: opt_millis(row.try_get("expires_at").map_err(StorageError::from)?),
        resolved_at: opt_millis(row.try_get("resolved_at").map_err(StorageError::from)?),
        total_calls: row.try_get::<i64, _>("total_calls").map_err(StorageError::from)? as u64,
        successful_calls: row
            .try_get::<i64, _>("successful_calls")
            .map_err(StorageError::from)? as u64,
        failed_calls: row.try_get::<i64, _>("failed_calls").map_err(StorageError::from)? as u64,
        total_latency_ms: row
            .try_get::<i64, _>("total_latency_ms")
            .map_err(StorageError::from)? as u64,
        budget_spent: parse_amount(
            &row.try_get::<String, _>("budget_spent").map_err(StorageError::from)?,
        )?,
        terminated_by: terminated_by.as_deref().map(AgentAddr::new).transpose()?,
        terminated_reason: row.try_get("terminated_reason").map_err(StorageError::from)?,
        violation_details,
        created_at: row.try_get::<i64, _>("created_at").map_err(StorageError::from)? as u64,
        updated_at: row.try_get::<i64, _>("updated_at").map_err(StorageError::from)? as u64,
    })
}

fn row_to_call(row: &PgRow) -> Result<ContractCall, ContractError> {
    let status: String = row.try_get("status").map_err(StorageError::from)?;
    Ok(ContractCall {
        id: row.try_get("id").map_err(StorageError::from)?,
        contract_id: row.try_get("contract_id").map_err(StorageError::from)?,
        status: status
            .parse()
            .map_err(|_| StorageError::Backend(format!("unknown call status '{status}'")))?,
        latency_ms: row.try_get::<i64, _>("latency_ms").map_err(StorageError::from)? as u64,
        error_msg: row.try_get("error_msg").map_err(StorageError::from)?,
        amount: parse_amount(&row.try_get::<String, _>("amount").map_err(StorageError::from)?)?,
        created_at: row.try_get::<i64, _>("created_at").map_err(StorageError::from)? as u64,
    })
}

pub struct PostgresContractStore {
    pool: PgPool,
}

impl PostgresContractStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), ContractError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }
}

#[async_trait]
impl ContractStore for PostgresContractStore {
    async fn insert(&self, ctx: &CallContext, contract: &Contract) -> Result<(), ContractError> {
        ctx.check_cancelled()?;
        sqlx::query(
            "INSERT INTO contracts (id, buyer_addr, seller_addr, service_type, \
             price_per_call, buyer_budget, seller_penalty, min_volume, max_latency_ms, \
             min_success_rate, sla_window_size, duration, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5::numeric, $6::numeric, $7::numeric, $8, $9, $10, \
             $11, $12, $13, $14, $15)",
        )
        .bind(&contract.id)
        .bind(contract.buyer_addr.as_str())
        .bind(contract.seller_addr.as_str())
        .bind(&contract.service_type)
        .bind(contract.price_per_call.to_string())
        .bind(contract.buyer_budget.to_string())
        .bind(contract.seller_penalty.to_string())
        .bind(contract.min_volume as i64)
        .bind(contract.max_latency_ms as i64)
        .bind(contract.min_success_rate)
        .bind(contract.sla_window_size as i32)
        .bind(&contract.duration)
        .bind(contract.status.to_string())
        .bind(contract.created_at as i64)
        .bind(contract.updated_at as i64)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn update(&self, ctx: &CallContext, contract: &Contract) -> Result<(), ContractError> {
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE contracts SET status = $2, starts_at = $3, expires_at = $4, \
             resolved_at = $5, total_calls = $6, successful_calls = $7, failed_calls = $8, \
             total_latency_ms = $9, budget_spent = $10::numeric, terminated_by = $11, \
             terminated_reason = $12, violation_window_rate = $13, violation_threshold = $14, \
             violation_window_size = $15, updated_at = $16 \
             WHERE id = $1",
        )
        .bind(&contract.id)
        .bind(contract.status.to_string())
        .bind(contract.starts_at.map(|v| v as i64))
        .bind(contract.expires_at.map(|v| v as i64))
        .bind(contract.resolved_at.map(|v| v as i64))
        .bind(contract.total_calls as i64)
        .bind(contract.successful_calls as i64)
        .bind(contract.failed_calls as i64)
        .bind(contract.total_latency_ms as i64)
        .bind(contract.budget_spent.to_string())
        .bind(contract.terminated_by.as_ref().map(|a| a.as_str().to_string()))
        .bind(&contract.terminated_reason)
        .bind(contract.violation_details.as_ref().map(|v| v.window_rate))
        .bind(contract.violation_details.as_ref().map(|v| v.threshold))
        .bind(contract.violation_details.as_ref().map(|v| v.window_size as i32))
        .bind(contract.updated_at as i64)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            return Err(ContractError::ContractNotFound(contract.id.clone()));
        }
        Ok(())
    }

    async fn get(&self, _ctx: &CallContext, id: &str) -> Result<Option<Contract>, ContractError> {
        sqlx::query(&format!("{SELECT_CONTRACT} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?
            .map(|row| row_to_contract(&row))
            .transpose()
    }

    async fn insert_call(
        &self,
        ctx: &CallContext,
        call: &ContractCall,
    ) -> Result<(), ContractError> {
        ctx.check_cancelled()?;
        sqlx::query(
            "INSERT INTO contract_calls (id, contract_id, status, latency_ms, error_msg, \
             amount, created_at) VALUES ($1, $2, $3, $4, $5, $6::numeric, $7)",
        )
        .bind(&call.id)
        .bind(&call.contract_id)
        .bind(call.status.to_string())
        .bind(call.latency_ms as i64)
        .bind(&call.error_msg)
        .bind(call.amount.to_string())
        .bind(call.created_at as i64)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn recent_calls(
        &self,
        _ctx: &CallContext,
        contract_id: &str,
        limit: u32,
    ) -> Result<Vec<ContractCall>, ContractError> {
        let rows = sqlx::query(
            "SELECT id, contract_id, status, latency_ms, error_msg, amount::text AS amount, \
             created_at FROM contract_calls WHERE contract_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(contract_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(row_to_call).collect()
    }

    async fn list_by_agent(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<Vec<Contract>, ContractError> {
        let rows = sqlx::query(&format!(
            "{SELECT_CONTRACT} WHERE buyer_addr = $1 OR seller_addr = $1 ORDER BY created_at DESC"
        ))
        .bind(addr.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(row_to_contract).collect()
    }

    async fn list_expired_active(
        &self,
        _ctx: &CallContext,
        now: TimestampMillis,
    ) -> Result<Vec<Contract>, ContractError> {
        let rows = sqlx::query(&format!(
            "{SELECT_CONTRACT} WHERE status = 'active' AND expires_at IS NOT NULL \
             AND expires_at < $1"
        ))
        .bind(now as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(row_to_contract).collect()
    }

    async fn seller_call_stats(
        &self,
        _ctx: &CallContext,
        seller: &AgentAddr,
        window: u32,
    ) -> Result<(u64, u64), ContractError> {
        let rows = sqlx::query(
            "SELECT cc.status FROM contract_calls cc \
             JOIN contracts c ON cc.contract_id = c.id \
             WHERE c.seller_addr = $1 \
             ORDER BY cc.created_at DESC, cc.id DESC LIMIT $2",
        )
        .bind(seller.as_str())
        .bind(window as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;

        let total = rows.len() as u64;
        let mut successful = 0u64;
        for row in &rows {
            let status: String = row.try_get("status").map_err(StorageError::from)?;
            if status == "success" {
                successful += 1;
            }
        }
        Ok((successful, total))
    }
}
