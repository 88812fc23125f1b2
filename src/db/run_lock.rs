use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::db::format_ts;
use crate::error::Result;
use crate::types::Clock;

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Proof of a held lock. Release with the lock that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub holder: String,
}

impl LockToken {
    fn new(name: &str) -> Self {
        let seq = HOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            name: name.to_string(),
            holder: format!("{}-{seq}", std::process::id()),
        }
    }
}

/// Non-blocking, run-scoped mutex with an absolute expiry so a dead holder
/// cannot wedge the schedule forever.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// `None` when someone else holds an unexpired lock.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>>;

    async fn release(&self, token: &LockToken) -> Result<()>;
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
}

// ---------------------------------------------------------------------------
// SQLite (cross-process)
// ---------------------------------------------------------------------------

pub struct SqliteRunLock {
    pool: sqlx::SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteRunLock {
    pub fn new(pool: sqlx::SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl RunLock for SqliteRunLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = self.clock.now();

        sqlx::query("DELETE FROM run_locks WHERE name = ? AND expires_at <= ?")
            .bind(name)
            .bind(format_ts(now))
            .execute(&self.pool)
            .await?;

        let token = LockToken::new(name);
        let res = sqlx::query("INSERT OR IGNORE INTO run_locks (name, holder, expires_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(&token.holder)
            .bind(format_ts(expiry(now, ttl)))
            .execute(&self.pool)
            .await?;

        Ok((res.rows_affected() == 1).then_some(token))
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        sqlx::query("DELETE FROM run_locks WHERE name = ? AND holder = ?")
            .bind(&token.name)
            .bind(&token.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

pub struct MemoryRunLock {
    held: DashMap<String, (String, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl MemoryRunLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { held: DashMap::new(), clock }
    }
}

#[async_trait]
impl RunLock for MemoryRunLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = self.clock.now();
        let token = LockToken::new(name);

        match self.held.entry(name.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().1 > now {
                    return Ok(None);
                }
                e.insert((token.holder.clone(), expiry(now, ttl)));
            }
            Entry::Vacant(e) => {
                e.insert((token.holder.clone(), expiry(now, ttl)));
            }
        }
        Ok(Some(token))
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        self.held.remove_if(&token.name, |_, (holder, _)| *holder == token.holder);
        Ok(())
    }
}
