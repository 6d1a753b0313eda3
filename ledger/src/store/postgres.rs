//! Postgres ledger backend
//!
//! Money lives in `NUMERIC(30,6)` columns with row-level CHECK constraints
//! mirroring the partition invariants. Every operation runs one
//! SERIALIZABLE transaction; partition-reducing statements carry a
//! conditional guard (`WHERE partition >= amount`) so zero rows affected
//! means `InsufficientBalance` with no side effect. Serialization conflicts
//! (SQLSTATE 40001) are retried with jittered exponential backoff.

use async_trait::async_trait;
use pact_common::backoff::{retry_with_backoff, RetryError, RetryPolicy};
use pact_common::{now_millis, AgentAddr, Amount, AmountError, CallContext, StorageError};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::balance::AgentBalance;
use crate::entry::{EntryId, EntryType, LedgerEntry};
use crate::error::LedgerError;
use crate::event::LedgerEvent;
use crate::store::{CreditInfo, LedgerStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_balances (
    agent_addr   TEXT PRIMARY KEY,
    available    NUMERIC(30,6) NOT NULL DEFAULT 0 CHECK (available >= 0),
    pending      NUMERIC(30,6) NOT NULL DEFAULT 0 CHECK (pending >= 0),
    escrowed     NUMERIC(30,6) NOT NULL DEFAULT 0 CHECK (escrowed >= 0),
    credit_limit NUMERIC(30,6) NOT NULL DEFAULT 0 CHECK (credit_limit >= 0),
    credit_used  NUMERIC(30,6) NOT NULL DEFAULT 0 CHECK (credit_used >= 0),
    total_in     NUMERIC(30,6) NOT NULL DEFAULT 0,
    total_out    NUMERIC(30,6) NOT NULL DEFAULT 0,
    updated_at   BIGINT NOT NULL,
    CHECK (credit_used <= credit_limit)
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id          BIGSERIAL PRIMARY KEY,
    agent_addr  TEXT NOT NULL,
    entry_type  TEXT NOT NULL,
    amount      NUMERIC(30,6) NOT NULL,
    reference   TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    reversal_of BIGINT,
    created_at  BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS ledger_entries_agent_idx
    ON ledger_entries (agent_addr, id DESC);
CREATE INDEX IF NOT EXISTS ledger_entries_reference_idx
    ON ledger_entries (reference);
CREATE UNIQUE INDEX IF NOT EXISTS ledger_entries_deposit_tx_idx
    ON ledger_entries (reference) WHERE entry_type = 'deposit';
CREATE UNIQUE INDEX IF NOT EXISTS ledger_entries_refund_ref_idx
    ON ledger_entries (reference) WHERE entry_type = 'refund';
CREATE UNIQUE INDEX IF NOT EXISTS ledger_entries_reversal_idx
    ON ledger_entries (reversal_of) WHERE reversal_of IS NOT NULL;

CREATE TABLE IF NOT EXISTS ledger_events (
    seq        BIGSERIAL PRIMARY KEY,
    agent_addr TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    amount     NUMERIC(30,6) NOT NULL,
    reference  TEXT NOT NULL,
    created_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS ledger_events_agent_idx
    ON ledger_events (agent_addr, seq);

CREATE TABLE IF NOT EXISTS credit_shadows (
    shadow_key TEXT PRIMARY KEY,
    agent_addr TEXT NOT NULL,
    reference  TEXT NOT NULL,
    amount     NUMERIC(30,6) NOT NULL CHECK (amount >= 0)
);
"#;

fn classify(err: LedgerError) -> RetryError<LedgerError> {
    let retryable = matches!(&err, LedgerError::Storage(storage) if storage.is_retryable());
    if retryable {
        RetryError::Transient(err)
    } else {
        RetryError::Permanent(err)
    }
}

fn ensure_positive(amount: Amount) -> Result<(), LedgerError> {
    if amount.is_zero() {
        return Err(LedgerError::InvalidAmount(AmountError::NotPositive));
    }
    Ok(())
}

fn shadow_key(addr: &AgentAddr, reference: &str) -> String {
    format!("{}:{}", addr, reference)
}

fn parse_amount(raw: &str) -> Result<Amount, LedgerError> {
    Amount::parse(raw).map_err(LedgerError::InvalidAmount)
}

fn row_to_balance(row: &PgRow) -> Result<AgentBalance, LedgerError> {
    let addr: String = row.try_get("agent_addr").map_err(StorageError::from)?;
    Ok(AgentBalance {
        agent_addr: AgentAddr::new(&addr)?,
        available: parse_amount(&row.try_get::<String, _>("available").map_err(StorageError::from)?)?,
        pending: parse_amount(&row.try_get::<String, _>("pending").map_err(StorageError::from)?)?,
        escrowed: parse_amount(&row.try_get::<String, _>("escrowed").map_err(StorageError::from)?)?,
        credit_limit: parse_amount(
            &row.try_get::<String, _>("credit_limit").map_err(StorageError::from)?,
        )?,
        credit_used: parse_amount(
            &row.try_get::<String, _>("credit_used").map_err(StorageError::from)?,
        )?,
        total_in: parse_amount(&row.try_get::<String, _>("total_in").map_err(StorageError::from)?)?,
        total_out: parse_amount(&row.try_get::<String, _>("total_out").map_err(StorageError::from)?)?,
        updated_at: row.try_get::<i64, _>("updated_at").map_err(StorageError::from)? as u64,
    })
}

fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    let addr: String = row.try_get("agent_addr").map_err(StorageError::from)?;
    let entry_type: String = row.try_get("entry_type").map_err(StorageError::from)?;
    Ok(LedgerEntry {
        id: row.try_get::<i64, _>("id").map_err(StorageError::from)?,
        agent_addr: AgentAddr::new(&addr)?,
        entry_type: entry_type
            .parse()
            .map_err(|_| StorageError::Backend(format!("unknown entry type '{entry_type}'")))?,
        amount: parse_amount(&row.try_get::<String, _>("amount").map_err(StorageError::from)?)?,
        reference: row.try_get("reference").map_err(StorageError::from)?,
        description: row.try_get("description").map_err(StorageError::from)?,
        reversal_of: row.try_get("reversal_of").map_err(StorageError::from)?,
        created_at: row.try_get::<i64, _>("created_at").map_err(StorageError::from)? as u64,
    })
}

const SELECT_BALANCE: &str = "SELECT agent_addr, available::text AS available, \
     pending::text AS pending, escrowed::text AS escrowed, \
     credit_limit::text AS credit_limit, credit_used::text AS credit_used, \
     total_in::text AS total_in, total_out::text AS total_out, updated_at \
     FROM ledger_balances WHERE agent_addr = $1";

const SELECT_ENTRY: &str = "SELECT id, agent_addr, entry_type, amount::text AS amount, \
     reference, description, reversal_of, created_at FROM ledger_entries";

pub struct PostgresLedgerStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Apply the schema DDL; safe to call repeatedly
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        Ok(tx)
    }

    /// Materialize the balance row on first write
    async fn ensure_row(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        addr: &AgentAddr,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO ledger_balances (agent_addr, updated_at) VALUES ($1, $2) \
             ON CONFLICT (agent_addr) DO NOTHING",
        )
        .bind(addr.as_str())
        .bind(now_millis() as i64)
        .execute(&mut **tx)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn balance_for_update(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        addr: &AgentAddr,
    ) -> Result<AgentBalance, LedgerError> {
        let row = sqlx::query(&format!("{SELECT_BALANCE} FOR UPDATE"))
            .bind(addr.as_str())
            .fetch_one(&mut **tx)
            .await
            .map_err(StorageError::from)?;
        row_to_balance(&row)
    }

    async fn balance_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        addr: &AgentAddr,
    ) -> Result<AgentBalance, LedgerError> {
        let row = sqlx::query(SELECT_BALANCE)
            .bind(addr.as_str())
            .fetch_one(&mut **tx)
            .await
            .map_err(StorageError::from)?;
        row_to_balance(&row)
    }

    #[allow(clippy::too_many_arguments)]
    async fn append(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        addr: &AgentAddr,
        entry_type: EntryType,
        amount: Amount,
        reference: &str,
        description: &str,
        reversal_of: Option<EntryId>,
    ) -> Result<EntryId, LedgerError> {
        let created_at = now_millis() as i64;
        let row = sqlx::query(
            "INSERT INTO ledger_entries \
             (agent_addr, entry_type, amount, reference, description, reversal_of, created_at) \
             VALUES ($1, $2, $3::numeric, $4, $5, $6, $7) RETURNING id",
        )
        .bind(addr.as_str())
        .bind(entry_type.to_string())
        .bind(amount.to_string())
        .bind(reference)
        .bind(description)
        .bind(reversal_of)
        .bind(created_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(StorageError::from)?;

        sqlx::query(
            "INSERT INTO ledger_events (agent_addr, entry_type, amount, reference, created_at) \
             VALUES ($1, $2, $3::numeric, $4, $5)",
        )
        .bind(addr.as_str())
        .bind(entry_type.to_string())
        .bind(amount.to_string())
        .bind(reference)
        .bind(created_at)
        .execute(&mut **tx)
        .await
        .map_err(StorageError::from)?;

        Ok(row.try_get::<i64, _>("id").map_err(StorageError::from)?)
    }

    async fn deposit_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        let duplicate = sqlx::query(
            "SELECT 1 FROM ledger_entries WHERE entry_type = 'deposit' AND reference = $1 LIMIT 1",
        )
        .bind(tx_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if duplicate.is_some() {
            return Err(LedgerError::DuplicateDeposit(tx_hash.to_string()));
        }

        self.ensure_row(&mut tx, addr).await?;
        let balance = self.balance_for_update(&mut tx, addr).await?;
        let repay = amount.min(balance.credit_used);

        ctx.check_cancelled()?;
        sqlx::query(
            "UPDATE ledger_balances SET \
             available = available + $2::numeric - $3::numeric, \
             total_in = total_in + $2::numeric - $3::numeric, \
             credit_used = credit_used - $3::numeric, \
             updated_at = $4 \
             WHERE agent_addr = $1",
        )
        .bind(addr.as_str())
        .bind(amount.to_string())
        .bind(repay.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        self.append(&mut tx, addr, EntryType::Deposit, amount, tx_hash, "deposit", None)
            .await?;
        if !repay.is_zero() {
            self.append(
                &mut tx,
                addr,
                EntryType::CreditRepay,
                repay,
                tx_hash,
                "auto repay on deposit",
                None,
            )
            .await?;
        }

        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn withdraw_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        self.ensure_row(&mut tx, addr).await?;
        ctx.check_cancelled()?;

        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             available = available - $2::numeric, \
             total_out = total_out + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1 AND available >= $2::numeric",
        )
        .bind(addr.as_str())
        .bind(amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let balance = self.balance_in_tx(&mut tx, addr).await?;
            return Err(LedgerError::InsufficientBalance {
                need: amount,
                have: balance.available,
            });
        }

        self.append(
            &mut tx,
            addr,
            EntryType::Withdrawal,
            amount,
            tx_hash,
            "withdrawal",
            None,
        )
        .await?;
        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn spend_like_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
        into_pending: bool,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        self.ensure_row(&mut tx, addr).await?;
        let balance = self.balance_for_update(&mut tx, addr).await?;

        let gap = amount.saturating_sub(balance.available);
        if !gap.is_zero() && gap > balance.available_credit() {
            return Err(LedgerError::InsufficientBalance {
                need: amount,
                have: balance.spendable(),
            });
        }

        ctx.check_cancelled()?;
        // The drawn gap lands in available first, then the full amount
        // leaves it; the guard re-checks both legs.
        let statement = if into_pending {
            "UPDATE ledger_balances SET \
             available = available + $2::numeric - $3::numeric, \
             pending = pending + $3::numeric, \
             credit_used = credit_used + $2::numeric, \
             total_in = total_in + $2::numeric, \
             updated_at = $4 \
             WHERE agent_addr = $1 \
               AND available + $2::numeric >= $3::numeric \
               AND credit_used + $2::numeric <= credit_limit"
        } else {
            "UPDATE ledger_balances SET \
             available = available + $2::numeric - $3::numeric, \
             credit_used = credit_used + $2::numeric, \
             total_in = total_in + $2::numeric, \
             total_out = total_out + $3::numeric, \
             updated_at = $4 \
             WHERE agent_addr = $1 \
               AND available + $2::numeric >= $3::numeric \
               AND credit_used + $2::numeric <= credit_limit"
        };
        let result = sqlx::query(statement)
            .bind(addr.as_str())
            .bind(gap.to_string())
            .bind(amount.to_string())
            .bind(now_millis() as i64)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::InsufficientBalance {
                need: amount,
                have: balance.spendable(),
            });
        }

        if !gap.is_zero() {
            if into_pending {
                self.append(
                    &mut tx,
                    addr,
                    EntryType::CreditDrawHold,
                    gap,
                    reference,
                    "credit draw for hold",
                    None,
                )
                .await?;
                sqlx::query(
                    "INSERT INTO credit_shadows (shadow_key, agent_addr, reference, amount) \
                     VALUES ($1, $2, $3, $4::numeric) \
                     ON CONFLICT (shadow_key) DO UPDATE \
                     SET amount = credit_shadows.amount + EXCLUDED.amount",
                )
                .bind(shadow_key(addr, reference))
                .bind(addr.as_str())
                .bind(reference)
                .bind(gap.to_string())
                .execute(&mut *tx)
                .await
                .map_err(StorageError::from)?;
            } else {
                self.append(
                    &mut tx,
                    addr,
                    EntryType::CreditDraw,
                    gap,
                    reference,
                    "credit draw for spend",
                    None,
                )
                .await?;
            }
        }
        let entry_type = if into_pending {
            EntryType::Hold
        } else {
            EntryType::Spend
        };
        let description = if into_pending { "hold" } else { "spend" };
        self.append(&mut tx, addr, entry_type, amount, reference, description, None)
            .await?;

        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn refund_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        let duplicate = sqlx::query(
            "SELECT 1 FROM ledger_entries WHERE entry_type = 'refund' AND reference = $1 LIMIT 1",
        )
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if duplicate.is_some() {
            return Err(LedgerError::DuplicateRefund(reference.to_string()));
        }

        self.ensure_row(&mut tx, addr).await?;
        ctx.check_cancelled()?;
        sqlx::query(
            "UPDATE ledger_balances SET \
             available = available + $2::numeric, \
             total_out = total_out - LEAST($2::numeric, total_out), \
             updated_at = $3 \
             WHERE agent_addr = $1",
        )
        .bind(addr.as_str())
        .bind(amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        self.append(&mut tx, addr, EntryType::Refund, amount, reference, "refund", None)
            .await?;
        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn confirm_hold_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             pending = pending - $2::numeric, \
             total_out = total_out + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1 AND pending >= $2::numeric",
        )
        .bind(addr.as_str())
        .bind(amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let have = self
                .balance_in_tx(&mut tx, addr)
                .await
                .map(|b| b.pending)
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::InsufficientBalance { need: amount, have });
        }

        // Credit stays drawn after confirmation
        sqlx::query("DELETE FROM credit_shadows WHERE shadow_key = $1")
            .bind(shadow_key(addr, reference))
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        self.append(
            &mut tx,
            addr,
            EntryType::Spend,
            amount,
            reference,
            "hold confirmed",
            None,
        )
        .await?;
        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn release_hold_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        let key = shadow_key(addr, reference);
        let shadow_row = sqlx::query("SELECT amount::text AS amount FROM credit_shadows WHERE shadow_key = $1 FOR UPDATE")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        let drawn = match &shadow_row {
            Some(row) => parse_amount(&row.try_get::<String, _>("amount").map_err(StorageError::from)?)?,
            None => Amount::ZERO,
        };
        let reversed = drawn.min(amount);

        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             pending = pending - $2::numeric, \
             available = available + $2::numeric - $3::numeric, \
             credit_used = credit_used - $3::numeric, \
             total_in = total_in - $3::numeric, \
             updated_at = $4 \
             WHERE agent_addr = $1 AND pending >= $2::numeric",
        )
        .bind(addr.as_str())
        .bind(amount.to_string())
        .bind(reversed.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let have = self
                .balance_in_tx(&mut tx, addr)
                .await
                .map(|b| b.pending)
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::InsufficientBalance { need: amount, have });
        }

        self.append(
            &mut tx,
            addr,
            EntryType::Release,
            amount,
            reference,
            "hold released",
            None,
        )
        .await?;
        if !reversed.is_zero() {
            self.append(
                &mut tx,
                addr,
                EntryType::CreditReverse,
                reversed,
                reference,
                "credit reversed on release",
                None,
            )
            .await?;
            let remaining = drawn.saturating_sub(reversed);
            if remaining.is_zero() {
                sqlx::query("DELETE FROM credit_shadows WHERE shadow_key = $1")
                    .bind(&key)
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::from)?;
            } else {
                sqlx::query("UPDATE credit_shadows SET amount = $2::numeric WHERE shadow_key = $1")
                    .bind(&key)
                    .bind(remaining.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::from)?;
            }
        }

        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn escrow_lock_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        self.ensure_row(&mut tx, addr).await?;
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             available = available - $2::numeric, \
             escrowed = escrowed + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1 AND available >= $2::numeric",
        )
        .bind(addr.as_str())
        .bind(amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let have = self
                .balance_in_tx(&mut tx, addr)
                .await
                .map(|b| b.available)
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::InsufficientBalance { need: amount, have });
        }

        self.append(
            &mut tx,
            addr,
            EntryType::EscrowLock,
            amount,
            reference,
            "escrow locked",
            None,
        )
        .await?;
        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn release_escrow_once(
        &self,
        ctx: &CallContext,
        from: &AgentAddr,
        to: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let mut tx = self.begin().await?;
        self.ensure_row(&mut tx, to).await?;
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             escrowed = escrowed - $2::numeric, \
             total_out = total_out + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1 AND escrowed >= $2::numeric",
        )
        .bind(from.as_str())
        .bind(amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let have = sqlx::query(SELECT_BALANCE)
                .bind(from.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::from)?
                .map(|row| row_to_balance(&row))
                .transpose()?
                .map(|b| b.escrowed)
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::InsufficientBalance { need: amount, have });
        }

        sqlx::query(
            "UPDATE ledger_balances SET \
             available = available + $2::numeric, \
             total_in = total_in + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1",
        )
        .bind(to.as_str())
        .bind(amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        self.append(
            &mut tx,
            from,
            EntryType::EscrowRelease,
            amount,
            reference,
            "escrow released to counterparty",
            None,
        )
        .await?;
        self.append(
            &mut tx,
            to,
            EntryType::EscrowReceive,
            amount,
            reference,
            "escrow received",
            None,
        )
        .await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(())
    }

    async fn refund_escrow_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             escrowed = escrowed - $2::numeric, \
             available = available + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1 AND escrowed >= $2::numeric",
        )
        .bind(addr.as_str())
        .bind(amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let have = self
                .balance_in_tx(&mut tx, addr)
                .await
                .map(|b| b.escrowed)
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::InsufficientBalance { need: amount, have });
        }

        self.append(
            &mut tx,
            addr,
            EntryType::EscrowRefund,
            amount,
            reference,
            "escrow refunded",
            None,
        )
        .await?;
        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_once(
        &self,
        ctx: &CallContext,
        buyer: &AgentAddr,
        seller: &AgentAddr,
        seller_amount: Amount,
        platform: &AgentAddr,
        fee: Amount,
        reference: &str,
        total: Amount,
    ) -> Result<(), LedgerError> {
        let mut tx = self.begin().await?;
        self.ensure_row(&mut tx, seller).await?;
        if !fee.is_zero() {
            self.ensure_row(&mut tx, platform).await?;
        }
        ctx.check_cancelled()?;

        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             pending = pending - $2::numeric, \
             total_out = total_out + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1 AND pending >= $2::numeric",
        )
        .bind(buyer.as_str())
        .bind(total.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let have = sqlx::query(SELECT_BALANCE)
                .bind(buyer.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::from)?
                .map(|row| row_to_balance(&row))
                .transpose()?
                .map(|b| b.pending)
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::InsufficientBalance { need: total, have });
        }

        sqlx::query(
            "UPDATE ledger_balances SET \
             available = available + $2::numeric, \
             total_in = total_in + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1",
        )
        .bind(seller.as_str())
        .bind(seller_amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        sqlx::query("DELETE FROM credit_shadows WHERE shadow_key = $1")
            .bind(shadow_key(buyer, reference))
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;

        self.append(&mut tx, buyer, EntryType::Spend, total, reference, "hold settled", None)
            .await?;
        self.append(
            &mut tx,
            seller,
            EntryType::EscrowReceive,
            seller_amount,
            reference,
            "settlement",
            None,
        )
        .await?;

        if !fee.is_zero() {
            sqlx::query(
                "UPDATE ledger_balances SET \
                 available = available + $2::numeric, \
                 total_in = total_in + $2::numeric, \
                 updated_at = $3 \
                 WHERE agent_addr = $1",
            )
            .bind(platform.as_str())
            .bind(fee.to_string())
            .bind(now_millis() as i64)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
            self.append(
                &mut tx,
                platform,
                EntryType::EscrowReceive,
                fee,
                reference,
                "platform fee",
                None,
            )
            .await?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        Ok(())
    }

    async fn reverse_once(
        &self,
        ctx: &CallContext,
        entry_id: EntryId,
        reason: &str,
        admin: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut tx = self.begin().await?;
        let original = sqlx::query(&format!("{SELECT_ENTRY} WHERE id = $1"))
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::from)?
            .map(|row| row_to_entry(&row))
            .transpose()?
            .ok_or(LedgerError::EntryNotFound(entry_id))?;

        let reversed = sqlx::query("SELECT 1 FROM ledger_entries WHERE reversal_of = $1 LIMIT 1")
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        if reversed.is_some() {
            return Err(LedgerError::AlreadyReversed(entry_id));
        }
        let reversal_type = original
            .entry_type
            .reversal()
            .ok_or(LedgerError::NotReversible(original.entry_type))?;

        // Inverse partition move with its own conditional guard; a failed
        // guard leaves the original unmarked.
        let statement = match reversal_type {
            EntryType::ReversalDeposit => {
                "UPDATE ledger_balances SET \
                 available = available - $2::numeric, \
                 total_in = total_in - LEAST($2::numeric, total_in), updated_at = $3 \
                 WHERE agent_addr = $1 AND available >= $2::numeric"
            }
            EntryType::ReversalWithdrawal | EntryType::ReversalSpend => {
                "UPDATE ledger_balances SET \
                 available = available + $2::numeric, \
                 total_out = total_out - LEAST($2::numeric, total_out), updated_at = $3 \
                 WHERE agent_addr = $1"
            }
            EntryType::ReversalRefund => {
                "UPDATE ledger_balances SET \
                 available = available - $2::numeric, \
                 total_out = total_out + $2::numeric, updated_at = $3 \
                 WHERE agent_addr = $1 AND available >= $2::numeric"
            }
            EntryType::ReversalHold => {
                "UPDATE ledger_balances SET \
                 pending = pending - $2::numeric, \
                 available = available + $2::numeric, updated_at = $3 \
                 WHERE agent_addr = $1 AND pending >= $2::numeric"
            }
            EntryType::ReversalRelease => {
                "UPDATE ledger_balances SET \
                 available = available - $2::numeric, \
                 pending = pending + $2::numeric, updated_at = $3 \
                 WHERE agent_addr = $1 AND available >= $2::numeric"
            }
            EntryType::ReversalEscrowLock => {
                "UPDATE ledger_balances SET \
                 escrowed = escrowed - $2::numeric, \
                 available = available + $2::numeric, updated_at = $3 \
                 WHERE agent_addr = $1 AND escrowed >= $2::numeric"
            }
            EntryType::ReversalEscrowRefund => {
                "UPDATE ledger_balances SET \
                 available = available - $2::numeric, \
                 escrowed = escrowed + $2::numeric, updated_at = $3 \
                 WHERE agent_addr = $1 AND available >= $2::numeric"
            }
            _ => return Err(LedgerError::NotReversible(original.entry_type)),
        };

        ctx.check_cancelled()?;
        let result = sqlx::query(statement)
            .bind(original.agent_addr.as_str())
            .bind(original.amount.to_string())
            .bind(now_millis() as i64)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let have = self
                .balance_in_tx(&mut tx, &original.agent_addr)
                .await
                .map(|b| b.available)
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::InsufficientBalance {
                need: original.amount,
                have,
            });
        }

        let description = format!("reversal of entry {} by {}: {}", entry_id, admin, reason);
        let id = self
            .append(
                &mut tx,
                &original.agent_addr,
                reversal_type,
                original.amount,
                &original.reference,
                &description,
                Some(entry_id),
            )
            .await?;
        let entry = sqlx::query(&format!("{SELECT_ENTRY} WHERE id = $1"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(StorageError::from)
            .map_err(LedgerError::from)
            .and_then(|row| row_to_entry(&row))?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(entry)
    }

    async fn credit_limit_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        limit: Amount,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        self.ensure_row(&mut tx, addr).await?;
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE ledger_balances SET credit_limit = $2::numeric, updated_at = $3 \
             WHERE agent_addr = $1 AND credit_used <= $2::numeric",
        )
        .bind(addr.as_str())
        .bind(limit.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let used = self
                .balance_in_tx(&mut tx, addr)
                .await
                .map(|b| b.credit_used)
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::CreditLimitBelowUsed { limit, used });
        }

        self.append(
            &mut tx,
            addr,
            EntryType::CreditLimitSet,
            limit,
            "credit_limit",
            "credit limit set",
            None,
        )
        .await?;
        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn use_credit_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        self.ensure_row(&mut tx, addr).await?;
        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             credit_used = credit_used + $2::numeric, \
             available = available + $2::numeric, \
             total_in = total_in + $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1 AND credit_used + $2::numeric <= credit_limit",
        )
        .bind(addr.as_str())
        .bind(amount.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            let headroom = self
                .balance_in_tx(&mut tx, addr)
                .await
                .map(|b| b.available_credit())
                .unwrap_or(Amount::ZERO);
            return Err(LedgerError::CreditExhausted {
                need: amount,
                available: headroom,
            });
        }

        self.append(
            &mut tx,
            addr,
            EntryType::CreditDraw,
            amount,
            reference,
            "explicit credit draw",
            None,
        )
        .await?;
        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }

    async fn repay_credit_once(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        let mut tx = self.begin().await?;
        self.ensure_row(&mut tx, addr).await?;
        let balance = self.balance_for_update(&mut tx, addr).await?;
        let repay = amount.min(balance.credit_used);
        if repay.is_zero() {
            return Ok(balance);
        }

        ctx.check_cancelled()?;
        let result = sqlx::query(
            "UPDATE ledger_balances SET \
             available = available - $2::numeric, \
             credit_used = credit_used - $2::numeric, \
             total_in = total_in - $2::numeric, \
             updated_at = $3 \
             WHERE agent_addr = $1 AND available >= $2::numeric",
        )
        .bind(addr.as_str())
        .bind(repay.to_string())
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::InsufficientBalance {
                need: repay,
                have: balance.available,
            });
        }

        self.append(
            &mut tx,
            addr,
            EntryType::CreditRepay,
            repay,
            reference,
            "credit repaid",
            None,
        )
        .await?;
        let updated = self.balance_in_tx(&mut tx, addr).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(updated)
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn deposit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.deposit_once(ctx, addr, amount, tx_hash)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn withdraw(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.withdraw_once(ctx, addr, amount, tx_hash)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn spend(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.spend_like_once(ctx, addr, amount, reference, false)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn refund(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.refund_once(ctx, addr, amount, reference)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.spend_like_once(ctx, addr, amount, reference, true)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn confirm_hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.confirm_hold_once(ctx, addr, amount, reference)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn release_hold(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.release_hold_once(ctx, addr, amount, reference)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn escrow_lock(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.escrow_lock_once(ctx, addr, amount, reference)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn release_escrow(
        &self,
        ctx: &CallContext,
        from: &AgentAddr,
        to: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.release_escrow_once(ctx, from, to, amount, reference)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn refund_escrow(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.refund_escrow_once(ctx, addr, amount, reference)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn settle_hold_with_fee(
        &self,
        ctx: &CallContext,
        buyer: &AgentAddr,
        seller: &AgentAddr,
        seller_amount: Amount,
        platform: &AgentAddr,
        fee: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let total = seller_amount
            .checked_add(fee)
            .ok_or(LedgerError::Overflow)?;
        ensure_positive(total)?;
        retry_with_backoff(self.retry, move || async move {
            self.settle_once(ctx, buyer, seller, seller_amount, platform, fee, reference, total)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn set_credit_limit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        limit: Amount,
    ) -> Result<AgentBalance, LedgerError> {
        retry_with_backoff(self.retry, move || async move {
            self.credit_limit_once(ctx, addr, limit).await.map_err(classify)
        })
        .await
    }

    async fn use_credit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.use_credit_once(ctx, addr, amount, reference)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn repay_credit(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
        amount: Amount,
        reference: &str,
    ) -> Result<AgentBalance, LedgerError> {
        ensure_positive(amount)?;
        retry_with_backoff(self.retry, move || async move {
            self.repay_credit_once(ctx, addr, amount, reference)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn reverse(
        &self,
        ctx: &CallContext,
        entry_id: EntryId,
        reason: &str,
        admin: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        retry_with_backoff(self.retry, move || async move {
            self.reverse_once(ctx, entry_id, reason, admin)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn get_balance(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<AgentBalance, LedgerError> {
        let row = sqlx::query(SELECT_BALANCE)
            .bind(addr.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;
        match row {
            Some(row) => row_to_balance(&row),
            None => Ok(AgentBalance::zeroed(addr.clone())),
        }
    }

    async fn get_credit_info(
        &self,
        ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<CreditInfo, LedgerError> {
        let balance = self.get_balance(ctx, addr).await?;
        Ok(CreditInfo {
            credit_limit: balance.credit_limit,
            credit_used: balance.credit_used,
            available_credit: balance.available_credit(),
        })
    }

    async fn get_history(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_ENTRY} WHERE agent_addr = $1 ORDER BY id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(addr.as_str())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn entries_by_reference(
        &self,
        _ctx: &CallContext,
        reference: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_ENTRY} WHERE reference = $1 ORDER BY id"
        ))
        .bind(reference)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn has_deposit(&self, _ctx: &CallContext, tx_hash: &str) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            "SELECT 1 FROM ledger_entries WHERE entry_type = 'deposit' AND reference = $1 LIMIT 1",
        )
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(row.is_some())
    }

    async fn get_entry(
        &self,
        _ctx: &CallContext,
        entry_id: EntryId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        sqlx::query(&format!("{SELECT_ENTRY} WHERE id = $1"))
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?
            .map(|row| row_to_entry(&row))
            .transpose()
    }

    async fn events_for(
        &self,
        _ctx: &CallContext,
        addr: &AgentAddr,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let rows = sqlx::query(
            "SELECT seq, agent_addr, entry_type, amount::text AS amount, reference, created_at \
             FROM ledger_events WHERE agent_addr = $1 ORDER BY seq",
        )
        .bind(addr.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        rows.iter()
            .map(|row| {
                let addr: String = row.try_get("agent_addr").map_err(StorageError::from)?;
                let entry_type: String = row.try_get("entry_type").map_err(StorageError::from)?;
                Ok(LedgerEvent {
                    seq: row.try_get::<i64, _>("seq").map_err(StorageError::from)? as u64,
                    agent_addr: AgentAddr::new(&addr)?,
                    entry_type: entry_type.parse().map_err(|_| {
                        StorageError::Backend(format!("unknown entry type '{entry_type}'"))
                    })?,
                    amount: parse_amount(
                        &row.try_get::<String, _>("amount").map_err(StorageError::from)?,
                    )?,
                    reference: row.try_get("reference").map_err(StorageError::from)?,
                    created_at: row.try_get::<i64, _>("created_at").map_err(StorageError::from)?
                        as u64,
                })
            })
            .collect()
    }
}
