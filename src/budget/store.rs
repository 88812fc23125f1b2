use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{format_ts, parse_ts};
use crate::error::{AppError, Result};

/// Refill rate assumed until the first authoritative sync.
const DEFAULT_REFILL_RATE: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub tokens: f64,
    pub refill_rate: f64,
    pub recharge_started_at: Option<DateTime<Utc>>,
}

impl BudgetSnapshot {
    pub fn recharge_active(&self) -> bool {
        self.recharge_started_at.is_some()
    }
}

/// Shared backing store for the token budget. Every mutation except
/// `set_authoritative` is an atomic delta.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Atomically adds `delta` and returns the balance after the change.
    async fn incr(&self, delta: f64) -> Result<f64>;

    /// Overwrites balance (and rate, when known) with values reported by the catalog.
    async fn set_authoritative(&self, tokens: f64, refill_rate: Option<f64>) -> Result<()>;

    async fn snapshot(&self) -> Result<BudgetSnapshot>;

    /// `Some(t)` enters recharge mode started at `t`; `None` leaves it.
    async fn set_recharge(&self, started_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Claims the next authoritative sync if none happened within `min_interval`.
    /// At most one concurrent caller wins.
    async fn try_claim_sync(&self, now: DateTime<Utc>, min_interval: chrono::Duration) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-process store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryState {
    tokens: f64,
    refill_rate: f64,
    recharge_started_at: Option<DateTime<Utc>>,
    last_sync_at: Option<DateTime<Utc>>,
}

/// Budget held by this process only. Used with `BUDGET_STORE=memory` and in tests.
#[derive(Debug)]
pub struct MemoryBudgetStore {
    inner: Mutex<MemoryState>,
}

impl MemoryBudgetStore {
    pub fn new(tokens: f64, refill_rate: f64) -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                tokens,
                refill_rate,
                recharge_started_at: None,
                last_sync_at: None,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| AppError::Store("budget mutex poisoned".to_string()))
    }
}

impl Default for MemoryBudgetStore {
    fn default() -> Self {
        Self::new(0.0, DEFAULT_REFILL_RATE)
    }
}

#[async_trait]
impl BudgetStore for MemoryBudgetStore {
    async fn incr(&self, delta: f64) -> Result<f64> {
        let mut s = self.lock()?;
        s.tokens += delta;
        Ok(s.tokens)
    }

    async fn set_authoritative(&self, tokens: f64, refill_rate: Option<f64>) -> Result<()> {
        let mut s = self.lock()?;
        s.tokens = tokens;
        if let Some(rate) = refill_rate {
            s.refill_rate = rate;
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<BudgetSnapshot> {
        let s = self.lock()?;
        Ok(BudgetSnapshot {
            tokens: s.tokens,
            refill_rate: s.refill_rate,
            recharge_started_at: s.recharge_started_at,
        })
    }

    async fn set_recharge(&self, started_at: Option<DateTime<Utc>>) -> Result<()> {
        self.lock()?.recharge_started_at = started_at;
        Ok(())
    }

    async fn try_claim_sync(&self, now: DateTime<Utc>, min_interval: chrono::Duration) -> Result<bool> {
        let mut s = self.lock()?;
        match s.last_sync_at {
            Some(last) if now - last < min_interval => Ok(false),
            _ => {
                s.last_sync_at = Some(now);
                Ok(true)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SQLite-backed store (shared across worker processes)
// ---------------------------------------------------------------------------

pub struct SqliteBudgetStore {
    pool: sqlx::SqlitePool,
}

impl SqliteBudgetStore {
    /// Creates the singleton budget row if no process has done so yet.
    pub async fn open(pool: sqlx::SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO token_budget (id, tokens_remaining, refill_rate)
            VALUES (1, 0, ?)
            "#,
        )
        .bind(DEFAULT_REFILL_RATE)
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl BudgetStore for SqliteBudgetStore {
    async fn incr(&self, delta: f64) -> Result<f64> {
        let tokens: f64 = sqlx::query_scalar(
            r#"
            UPDATE token_budget SET tokens_remaining = tokens_remaining + ?
            WHERE id = 1
            RETURNING tokens_remaining
            "#,
        )
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn set_authoritative(&self, tokens: f64, refill_rate: Option<f64>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE token_budget
            SET tokens_remaining = ?, refill_rate = COALESCE(?, refill_rate)
            WHERE id = 1
            "#,
        )
        .bind(tokens)
        .bind(refill_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<BudgetSnapshot> {
        let (tokens, refill_rate, recharge): (f64, f64, Option<String>) = sqlx::query_as(
            "SELECT tokens_remaining, refill_rate, recharge_started_at FROM token_budget WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(BudgetSnapshot {
            tokens,
            refill_rate,
            recharge_started_at: recharge.as_deref().map(parse_ts).transpose()?,
        })
    }

    async fn set_recharge(&self, started_at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE token_budget SET recharge_started_at = ? WHERE id = 1")
            .bind(started_at.map(format_ts))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_claim_sync(&self, now: DateTime<Utc>, min_interval: chrono::Duration) -> Result<bool> {
        let cutoff = format_ts(now - min_interval);
        let res = sqlx::query(
            r#"
            UPDATE token_budget SET last_sync_at = ?
            WHERE id = 1 AND (last_sync_at IS NULL OR last_sync_at <= ?)
            "#,
        )
        .bind(format_ts(now))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
