//! PostgreSQL backends for Folio.
//!
//! This crate provides the production implementations of the `folio-core`
//! seams:
//!
//! - [`PgIdempotencyStore`]: idempotency records with a primary-key enforced
//!   claim (`INSERT ... ON CONFLICT`)
//! - [`PgAdvisoryLock`]: session-level advisory locks held on a pooled
//!   connection
//! - [`PgTransactionManager`]: sqlx transactions behind the pipeline's
//!   transaction middleware
//! - [`PgReferenceSource`]: content URLs still referenced by catalog rows,
//!   for orphan collection
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE idempotency_keys (
//!     idempotency_key TEXT PRIMARY KEY,
//!     status TEXT NOT NULL CHECK (status IN ('started', 'finished')),
//!
//!     -- Set once finished
//!     status_code INTEGER,
//!     response_body JSONB,
//!
//!     created_at TIMESTAMPTZ NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE INDEX idx_idempotency_keys_created_at ON idempotency_keys (created_at);
//! ```
//!
//! [`PgIdempotencyStore::create_table`] issues the same DDL.
//!
//! # Usage
//!
//! ```rust,ignore
//! use folio_core::{IdempotencyCoordinator, IdempotencyConfig, IdempotencyMiddleware};
//! use folio_postgres::{PgAdvisoryLock, PgIdempotencyStore};
//! use sqlx::PgPool;
//! use std::sync::Arc;
//!
//! let pool = PgPool::connect("postgres://localhost/catalog").await?;
//! let coordinator = IdempotencyCoordinator::new(
//!     Arc::new(PgIdempotencyStore::new(pool.clone())),
//!     Arc::new(PgAdvisoryLock::new(pool)),
//! );
//! let pipeline = pipeline.pipe(IdempotencyMiddleware::new(coordinator, IdempotencyConfig::default()));
//! ```

mod lock;
mod references;
mod transaction;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use folio_core::idempotency::{
    IdempotencyClaim, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
};
use folio_core::{IdempotencyError, ResponseBody};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

pub use lock::PgAdvisoryLock;
pub use references::PgReferenceSource;
pub use transaction::{PgTransaction, PgTransactionManager};

/// Table used when none is configured.
pub const DEFAULT_TABLE: &str = "idempotency_keys";

/// PostgreSQL idempotency store.
#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
    table: String,
}

impl PgIdempotencyStore {
    /// Create a store over the `idempotency_keys` table.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Create a store over a custom table.
    ///
    /// The name is interpolated into SQL, so it must be a plain identifier,
    /// optionally schema-qualified (`catalog.idempotency_keys`).
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_identifier(&table) {
            anyhow::bail!("invalid idempotency table name {table:?}");
        }
        Ok(Self { pool, table })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table and its index if they do not exist.
    pub async fn create_table(&self) -> Result<()> {
        let index = format!("idx_{}_created_at", self.table.replace('.', "_"));
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                idempotency_key TEXT PRIMARY KEY,
                status TEXT NOT NULL CHECK (status IN ('started', 'finished')),
                status_code INTEGER,
                response_body JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {index} ON {table} (created_at);
            "#,
            table = self.table,
        );
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let sql = format!(
            r#"
            SELECT idempotency_key, status, status_code, response_body, created_at, expires_at
            FROM {}
            WHERE idempotency_key = $1
            "#,
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    /// Claim the key.
    ///
    /// The primary key makes this atomic across processes. An existing row
    /// is overwritten only when it expired before this claim was made. The
    /// claim carries `created_at` as stored, at the column's microsecond
    /// precision.
    async fn insert_started(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<Option<IdempotencyClaim>> {
        let sql = format!(
            r#"
            INSERT INTO {table}
                (idempotency_key, status, status_code, response_body, created_at, expires_at)
            VALUES ($1, 'started', NULL, NULL, $2, $3)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET status = 'started',
                status_code = NULL,
                response_body = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE {table}.expires_at < EXCLUDED.created_at
            RETURNING created_at
            "#,
            table = self.table
        );
        let claimed_at: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
            .bind(&record.key)
            .bind(record.created_at)
            .bind(record.expires_at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(claimed_at.map(|claimed_at| IdempotencyClaim {
            key: record.key.clone(),
            claimed_at,
        }))
    }

    async fn mark_finished(
        &self,
        claim: &IdempotencyClaim,
        status_code: u16,
        body: &ResponseBody,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'finished',
                status_code = $2,
                response_body = $3,
                expires_at = $4
            WHERE idempotency_key = $1
              AND status = 'started'
              AND created_at = $5
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(&claim.key)
            .bind(i32::from(status_code))
            .bind(Json(body))
            .bind(expires_at)
            .bind(claim.claimed_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove_started(&self, claim: &IdempotencyClaim) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE idempotency_key = $1 AND status = 'started' AND created_at = $2",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(&claim.key)
            .bind(claim.claimed_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE created_at < $1", self.table);
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }
}

/// Utility functions for operators.
impl PgIdempotencyStore {
    /// Get statistics about the idempotency table.
    pub async fn stats(&self) -> Result<IdempotencyStats> {
        let sql = format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'started' AND expires_at >= NOW()) as started,
                COUNT(*) FILTER (WHERE status = 'finished' AND expires_at >= NOW()) as finished,
                COUNT(*) FILTER (WHERE expires_at < NOW()) as expired
            FROM {}
            "#,
            self.table
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;

        Ok(IdempotencyStats {
            started: row.get("started"),
            finished: row.get("finished"),
            expired: row.get("expired"),
        })
    }
}

/// Idempotency table statistics.
#[derive(Debug, Clone, Copy)]
pub struct IdempotencyStats {
    pub started: i64,
    pub finished: i64,
    /// Rows past `expires_at` that have not been swept yet.
    pub expired: i64,
}

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord> {
    let key: String = row.try_get("idempotency_key")?;
    let corrupt = |reason: String| IdempotencyError::CorruptRecord {
        key: key.clone(),
        reason,
    };

    let status: String = row.try_get("status")?;
    let status: IdempotencyStatus = status.parse().map_err(corrupt)?;

    let status_code = row
        .try_get::<Option<i32>, _>("status_code")?
        .map(|code| {
            u16::try_from(code).map_err(|_| corrupt(format!("status code {code} out of range")))
        })
        .transpose()?;

    let response_body = row
        .try_get::<Option<serde_json::Value>, _>("response_body")?
        .map(|body| {
            serde_json::from_value::<ResponseBody>(body)
                .map_err(|err| corrupt(format!("undecodable response body: {err}")))
        })
        .transpose()?;

    Ok(IdempotencyRecord {
        key,
        status,
        status_code,
        response_body,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn is_identifier(name: &str) -> bool {
    let mut parts = 0;
    for part in name.split('.') {
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        parts += 1;
    }
    parts <= 2
}
