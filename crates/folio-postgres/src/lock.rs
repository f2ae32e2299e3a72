//! Session-level advisory locks.
//!
//! `pg_try_advisory_lock` belongs to the session that took it, so the pooled
//! connection that wins the lock is kept out of the pool until the lock is
//! released. Waiters borrow a connection only for the duration of each
//! attempt, so they never pin pool slots the holder needs. Lock names are
//! hashed to the 64-bit key space with `hashtextextended`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use folio_core::Lock;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::time::Instant;
use tracing::{debug, warn};

/// First retry delay while another session holds the lock.
const BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Default ceiling for the retry delay.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Advisory lock backed by PostgreSQL.
pub struct PgAdvisoryLock {
    pool: PgPool,
    held: DashMap<String, PoolConnection<Postgres>>,
    poll_interval: Duration,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: DashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Cap the delay between attempts while waiting for a held lock.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(BACKOFF_BASE);
        self
    }

    /// Number of locks this instance currently holds.
    pub fn held(&self) -> usize {
        self.held.len()
    }
}

#[async_trait]
impl Lock for PgAdvisoryLock {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_BASE;

        loop {
            let Ok(conn) = tokio::time::timeout_at(deadline, self.pool.acquire()).await else {
                debug!(name, ?timeout, "no connection before advisory lock deadline");
                return Ok(false);
            };
            let mut conn = conn?;
            let locked: bool =
                sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                    .bind(name)
                    .fetch_one(&mut *conn)
                    .await?;
            if locked {
                self.held.insert(name.to_string(), conn);
                debug!(name, "advisory lock acquired");
                return Ok(true);
            }
            drop(conn);

            let now = Instant::now();
            if now >= deadline {
                debug!(name, ?timeout, "advisory lock wait timed out");
                return Ok(false);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = backoff.saturating_mul(2).min(self.poll_interval);
        }
    }

    async fn release(&self, name: &str) -> Result<()> {
        let Some((_, mut conn)) = self.held.remove(name) else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>(
            "SELECT pg_advisory_unlock(hashtextextended($1, 0))",
        )
        .bind(name)
        .fetch_one(&mut *conn)
        .await;

        match unlocked {
            Ok(true) => {
                debug!(name, "advisory lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(name, "advisory lock was not held by its session");
                conn.close_on_drop();
                Ok(())
            }
            Err(error) => {
                // Closing the session is the only other way to drop the lock.
                conn.close_on_drop();
                Err(error.into())
            }
        }
    }
}
