//! The command bus: middleware composed around a single use case.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::Command;
use crate::error::PipelineError;
use crate::response::Response;
use crate::transaction::TransactionHandle;

/// Per-execution state passed explicitly down the chain.
#[derive(Default)]
pub struct Context {
    transaction: Option<TransactionHandle>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transaction opened by [`TransactionMiddleware`](crate::TransactionMiddleware).
    ///
    /// Errors if the pipeline has no transaction middleware in front of the
    /// caller.
    pub fn transaction(&mut self) -> anyhow::Result<&mut TransactionHandle> {
        self.transaction
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no transaction is active in this pipeline"))
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn attach_transaction(&mut self, handle: TransactionHandle) {
        self.transaction = Some(handle);
    }

    pub fn detach_transaction(&mut self) -> Option<TransactionHandle> {
        self.transaction.take()
    }
}

/// The operation a pipeline wraps.
#[async_trait]
pub trait UseCase<C: Command>: Send + Sync {
    async fn execute(&self, command: C, ctx: &mut Context) -> anyhow::Result<Response>;
}

/// A cross-cutting step around the use case.
///
/// Call `next.run(command, ctx)` to continue inward, or return without
/// calling it to short-circuit.
#[async_trait]
pub trait Middleware<C: Command>: Send + Sync {
    async fn handle(
        &self,
        command: C,
        ctx: &mut Context,
        next: Next<'_, C>,
    ) -> anyhow::Result<Response>;
}

/// Continuation to the rest of the chain.
pub struct Next<'a, C: Command> {
    chain: &'a [Arc<dyn Middleware<C>>],
    use_case: &'a dyn UseCase<C>,
}

impl<'a, C: Command> Next<'a, C> {
    pub async fn run(self, command: C, ctx: &mut Context) -> anyhow::Result<Response> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    use_case: self.use_case,
                };
                head.handle(command, ctx, next).await
            }
            None => self.use_case.execute(command, ctx).await,
        }
    }
}

/// An ordered, immutable list of middleware.
///
/// [`pipe`](Pipeline::pipe) returns a new pipeline, so a base pipeline can be
/// shared and extended into several variants.
///
/// ```ignore
/// let base = Pipeline::new().pipe(TransactionMiddleware::new(tx_manager));
/// let uploads = Pipeline::new()
///     .pipe(IdempotencyMiddleware::new(coordinator, config))
///     .pipe(FileLifecycleMiddleware::new(store))
///     .pipe(TransactionMiddleware::new(tx_manager));
///
/// let response = uploads.execute(command, &CreateBook::new(repo)).await?;
/// ```
pub struct Pipeline<C: Command> {
    middleware: Vec<Arc<dyn Middleware<C>>>,
}

impl<C: Command> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            middleware: self.middleware.clone(),
        }
    }
}

impl<C: Command> Default for Pipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command> Pipeline<C> {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    /// A new pipeline with `middleware` appended innermost.
    #[must_use]
    pub fn pipe<M: Middleware<C> + 'static>(&self, middleware: M) -> Self {
        let mut chain = self.middleware.clone();
        chain.push(Arc::new(middleware));
        Self { middleware: chain }
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Run `command` through the middleware (first registered is outermost)
    /// and into `use_case`.
    pub async fn execute<U: UseCase<C>>(
        &self,
        command: C,
        use_case: &U,
    ) -> Result<Response, PipelineError> {
        let mut ctx = Context::new();
        let next = Next {
            chain: &self.middleware,
            use_case,
        };
        next.run(command, &mut ctx)
            .await
            .map_err(PipelineError::normalize)
    }
}
