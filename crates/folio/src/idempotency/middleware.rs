use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::coordinator::IdempotencyCoordinator;
use super::record::IdempotencyClaim;
use crate::command::Command;
use crate::config::IdempotencyConfig;
use crate::error::{DomainError, PipelineError};
use crate::pipeline::{Context, Middleware, Next};
use crate::response::{Response, ResponseBody};

/// Replays finished responses and runs each key's use case at most once.
///
/// Commands without an idempotency key pass straight through.
///
/// For a keyed command:
/// 1. a live Finished record is replayed without locking;
/// 2. otherwise the key's lock is taken (waiting up to the configured
///    timeout), the record is re-checked, and the key is claimed with
///    [`IdempotencyCoordinator::claim`];
/// 3. the rest of the chain runs; a response is saved and returned as a miss,
///    an error drops the claim so the client can retry.
///
/// A key that cannot be claimed and has no finished response is reported as
/// [`PipelineError::Contention`].
pub struct IdempotencyMiddleware {
    coordinator: IdempotencyCoordinator,
    config: IdempotencyConfig,
}

impl IdempotencyMiddleware {
    pub fn new(coordinator: IdempotencyCoordinator, config: IdempotencyConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    async fn cached(&self, key: &str) -> anyhow::Result<Option<Response>> {
        Ok(self
            .coordinator
            .get_record(key)
            .await?
            .and_then(|record| record.cached_response()))
    }

    async fn cached_or_contention(&self, key: &str) -> anyhow::Result<Response> {
        match self.cached(key).await? {
            Some(response) => {
                debug!(key, "idempotency hit");
                Ok(response)
            }
            None => Err(PipelineError::Contention {
                key: key.to_string(),
            }
            .into()),
        }
    }

    /// Steps run while holding the key's lock. `claimed` is filled in once
    /// the key is claimed so the caller can drop the claim after a panic.
    async fn execute_locked<C: Command>(
        &self,
        key: &str,
        command: C,
        ctx: &mut Context,
        next: Next<'_, C>,
        claimed: &mut Option<IdempotencyClaim>,
    ) -> anyhow::Result<Response> {
        if let Some(response) = self.cached(key).await? {
            debug!(key, "idempotency hit after lock");
            return Ok(response);
        }

        let ttl = self.config.record_ttl();
        let Some(claim) = self.coordinator.claim(key, ttl).await? else {
            return self.cached_or_contention(key).await;
        };
        let claim = claimed.insert(claim);

        let response = match next.run(command, ctx).await {
            Ok(response) => response,
            Err(error) => {
                if let Err(abandon_error) = self.coordinator.abandon(claim).await {
                    warn!(key, error = %format!("{abandon_error:#}"), "failed to release idempotency claim");
                }
                return Err(error);
            }
        };

        match &response.body {
            ResponseBody::Payload { body } => {
                self.coordinator
                    .finish(claim, response.status, body, None, ttl)
                    .await?
            }
            ResponseBody::Redirect { location } => {
                self.coordinator
                    .finish(claim, response.status, &Value::Null, Some(location), ttl)
                    .await?
            }
        }
        debug!(key, status = response.status, "idempotency miss, response saved");
        Ok(response)
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for IdempotencyMiddleware {
    async fn handle(
        &self,
        command: C,
        ctx: &mut Context,
        next: Next<'_, C>,
    ) -> anyhow::Result<Response> {
        let Some(key) = command.idempotency_key().map(str::to_string) else {
            return next.run(command, ctx).await;
        };
        if key.trim().is_empty() {
            return Err(DomainError::field(
                "idempotency_key",
                "idempotency_key.blank",
                "idempotency key must not be blank",
            )
            .into());
        }

        if let Some(response) = self.cached(&key).await? {
            debug!(key = key.as_str(), "idempotency hit");
            return Ok(response);
        }

        if !self
            .coordinator
            .acquire_lock(&key, self.config.lock_timeout())
            .await?
        {
            return self.cached_or_contention(&key).await;
        }

        // Release on every exit path, including a panic in the use case.
        let mut claimed = None;
        let outcome = AssertUnwindSafe(self.execute_locked(&key, command, ctx, next, &mut claimed))
            .catch_unwind()
            .await;

        if let (Err(_), Some(claim)) = (&outcome, &claimed) {
            if let Err(error) = self.coordinator.abandon(claim).await {
                warn!(key = key.as_str(), error = %format!("{error:#}"), "failed to release idempotency claim after panic");
            }
        }
        if let Err(error) = self.coordinator.release_lock(&key).await {
            warn!(key = key.as_str(), error = %format!("{error:#}"), "failed to release idempotency lock");
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
