use std::any::Any;

use anyhow::Result;
use async_trait::async_trait;
use folio_core::{Context, Transaction, TransactionManager};
use sqlx::{PgConnection, PgPool, Postgres};

/// Begins sqlx transactions for [`TransactionMiddleware`](folio_core::TransactionMiddleware).
#[derive(Clone)]
pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// An open PostgreSQL transaction.
///
/// Use cases run their writes on [`connection`](Self::connection):
///
/// ```rust,ignore
/// let tx = PgTransaction::from_context(ctx)?;
/// sqlx::query("INSERT INTO books (title) VALUES ($1)")
///     .bind(&cmd.title)
///     .execute(tx.connection())
///     .await?;
/// ```
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// The PostgreSQL transaction attached to the pipeline context.
    pub fn from_context(ctx: &mut Context) -> Result<&mut Self> {
        ctx.transaction()?
            .downcast_mut::<Self>()
            .ok_or_else(|| anyhow::anyhow!("context transaction is not a PostgreSQL transaction"))
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
