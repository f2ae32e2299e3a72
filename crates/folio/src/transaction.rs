//! Transaction boundary for use cases.
//!
//! The pipeline never looks up an ambient transaction. The
//! [`TransactionMiddleware`] begins one, attaches its [`TransactionHandle`] to
//! the [`Context`], and commits or rolls back when the inner chain returns.
//! Use cases reach the handle through [`Context::transaction`] and may
//! register callbacks that run only after a successful commit.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::command::Command;
use crate::pipeline::{Context, Middleware, Next};
use crate::response::Response;

/// A unit of work in the backing store.
#[async_trait]
pub trait Transaction: Send + 'static {
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;

    /// Access to the concrete transaction, for use cases that need to run
    /// queries on it.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens transactions.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>>;
}

type AfterCommit = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Error from [`TransactionHandle::commit`].
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The commit itself failed; nothing was written.
    #[error("transaction commit failed: {0:#}")]
    Commit(anyhow::Error),

    /// Data is committed but some after-commit callbacks failed.
    #[error("transaction committed but {failed} after-commit callback(s) failed: {first:#}")]
    AfterCommit { failed: usize, first: anyhow::Error },
}

impl CommitError {
    /// `true` when the data change is durable despite the error.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::AfterCommit { .. })
    }
}

/// An open transaction plus the callbacks to run once it commits.
pub struct TransactionHandle {
    inner: Box<dyn Transaction>,
    after_commit: Vec<AfterCommit>,
}

impl TransactionHandle {
    pub fn new(inner: Box<dyn Transaction>) -> Self {
        Self {
            inner,
            after_commit: Vec::new(),
        }
    }

    /// Register work to run after a successful commit, in registration order.
    /// Dropped without running if the transaction rolls back.
    pub fn after_commit<F, Fut>(&mut self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.after_commit.push(Box::new(move || callback().boxed()));
    }

    pub fn pending_callbacks(&self) -> usize {
        self.after_commit.len()
    }

    /// The concrete transaction, if it is a `T`.
    pub fn downcast_mut<T: Transaction>(&mut self) -> Option<&mut T> {
        self.inner.as_any_mut().downcast_mut::<T>()
    }

    /// Commit, then run every after-commit callback in order.
    ///
    /// A failing callback does not stop the ones after it and does not undo
    /// the commit; failures are reported through [`CommitError::AfterCommit`].
    pub async fn commit(self) -> Result<(), CommitError> {
        let Self {
            inner,
            after_commit,
        } = self;

        inner.commit().await.map_err(CommitError::Commit)?;

        let mut failures = Vec::new();
        for (index, callback) in after_commit.into_iter().enumerate() {
            if let Err(error) = callback().await {
                warn!(index, error = %format!("{error:#}"), "after-commit callback failed");
                failures.push(error);
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(CommitError::AfterCommit { failed, first }),
        }
    }

    /// Roll back and discard the after-commit callbacks.
    pub async fn rollback(self) -> anyhow::Result<()> {
        let discarded = self.after_commit.len();
        self.inner.rollback().await?;
        if discarded > 0 {
            debug!(discarded, "rolled back, discarded after-commit callbacks");
        }
        Ok(())
    }
}

/// Runs the rest of the chain inside a transaction.
///
/// If a transaction is already attached to the context the chain joins it
/// and this middleware does nothing.
pub struct TransactionMiddleware {
    manager: Arc<dyn TransactionManager>,
}

impl TransactionMiddleware {
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for TransactionMiddleware {
    async fn handle(
        &self,
        command: C,
        ctx: &mut Context,
        next: Next<'_, C>,
    ) -> anyhow::Result<Response> {
        if ctx.has_transaction() {
            return next.run(command, ctx).await;
        }

        let handle = TransactionHandle::new(self.manager.begin().await?);
        ctx.attach_transaction(handle);

        let result = next.run(command, ctx).await;

        let Some(handle) = ctx.detach_transaction() else {
            anyhow::bail!("transaction handle was removed from the context");
        };

        match result {
            Ok(response) => match handle.commit().await {
                Ok(()) => Ok(response),
                // The write is final; a missed notification must not turn it
                // into a failure the client would retry.
                Err(error) if error.is_committed() => {
                    warn!(error = %error, "post-commit delivery failed");
                    Ok(response)
                }
                Err(error) => Err(error.into()),
            },
            Err(error) => {
                if let Err(rollback_error) = handle.rollback().await {
                    warn!(error = %format!("{rollback_error:#}"), "rollback failed");
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeTransaction {
        log: Arc<Log>,
        fail_commit: bool,
    }

    #[async_trait]
    impl Transaction for FakeTransaction {
        async fn commit(self: Box<Self>) -> anyhow::Result<()> {
            if self.fail_commit {
                anyhow::bail!("serialization failure");
            }
            self.log.push("commit");
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
            self.log.push("rollback");
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn handle(log: &Arc<Log>, fail_commit: bool) -> TransactionHandle {
        TransactionHandle::new(Box::new(FakeTransaction {
            log: log.clone(),
            fail_commit,
        }))
    }

    fn record(log: &Arc<Log>, entry: &'static str, tx: &mut TransactionHandle) {
        let log = log.clone();
        tx.after_commit(move || async move {
            log.push(entry);
            Ok(())
        });
    }

    #[tokio::test]
    async fn callbacks_run_after_commit_in_order() {
        let log = Arc::new(Log::default());
        let mut tx = handle(&log, false);
        record(&log, "first", &mut tx);
        record(&log, "second", &mut tx);

        tx.commit().await.unwrap();

        assert_eq!(log.entries(), vec!["commit", "first", "second"]);
    }

    #[tokio::test]
    async fn rollback_discards_callbacks() {
        let log = Arc::new(Log::default());
        let mut tx = handle(&log, false);
        record(&log, "event", &mut tx);

        tx.rollback().await.unwrap();

        assert_eq!(log.entries(), vec!["rollback"]);
    }

    #[tokio::test]
    async fn failed_commit_runs_no_callbacks() {
        let log = Arc::new(Log::default());
        let mut tx = handle(&log, true);
        record(&log, "event", &mut tx);

        let err = tx.commit().await.unwrap_err();

        assert!(!err.is_committed());
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn callback_failure_is_reported_but_later_callbacks_still_run() {
        let log = Arc::new(Log::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tx = handle(&log, false);
        tx.after_commit(|| async { Err::<(), _>(anyhow::anyhow!("sink unavailable")) });
        let counter = calls.clone();
        tx.after_commit(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = tx.commit().await.unwrap_err();

        assert!(err.is_committed());
        assert!(matches!(err, CommitError::AfterCommit { failed: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.entries(), vec!["commit"]);
    }

    #[tokio::test]
    async fn downcast_reaches_concrete_transaction() {
        let log = Arc::new(Log::default());
        let mut tx = handle(&log, false);

        let concrete = tx.downcast_mut::<FakeTransaction>().unwrap();
        concrete.log.push("query");

        assert_eq!(log.entries(), vec!["query"]);
    }
}
