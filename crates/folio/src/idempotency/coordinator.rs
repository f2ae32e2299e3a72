use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::record::{IdempotencyClaim, IdempotencyRecord, IdempotencyStatus};
use super::store::IdempotencyStore;
use crate::clock::{cutoff, deadline, Clock, SystemClock};
use crate::error::IdempotencyError;
use crate::lock::Lock;
use crate::response::ResponseBody;

/// Lock namespace for idempotency keys.
const LOCK_PREFIX: &str = "idempotency:";

/// At-most-once execution per idempotency key.
///
/// Two tiers: a short-lived advisory [`Lock`] serializes concurrent first
/// requests for a key, and the [`IdempotencyStore`] record is the durable
/// source of truth. Expiry is evaluated when records are read; expired rows
/// are physically removed only by [`delete_expired`](Self::delete_expired).
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    lock: Arc<dyn Lock>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn IdempotencyStore>, lock: Arc<dyn Lock>) -> Self {
        Self {
            store,
            lock,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The live record for `key`; `None` if absent or expired.
    pub async fn get_record(&self, key: &str) -> anyhow::Result<Option<IdempotencyRecord>> {
        let now = self.clock.now();
        Ok(self
            .store
            .find(key)
            .await?
            .filter(|record| !record.is_expired(now)))
    }

    /// Claim `key` with a Started record. `false` if a live record exists.
    pub async fn start_request(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        Ok(self.claim(key, ttl).await?.is_some())
    }

    /// Like [`start_request`](Self::start_request), returning the claim so
    /// the caller can later finish or abandon exactly this record.
    pub async fn claim(
        &self,
        key: &str,
        ttl: Duration,
    ) -> anyhow::Result<Option<IdempotencyClaim>> {
        let record = IdempotencyRecord::started(key, self.clock.now(), ttl);
        let claim = self.store.insert_started(&record).await?;
        debug!(key, started = claim.is_some(), "start idempotent request");
        Ok(claim)
    }

    /// Finish `key` with a response. `redirect` takes precedence over
    /// `payload`. The record stays visible for `ttl` from now.
    pub async fn save_response(
        &self,
        key: &str,
        status_code: u16,
        payload: &(dyn erased_serde::Serialize + Sync),
        redirect: Option<&str>,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let claim = self
            .current_claim(key)
            .await?
            .ok_or_else(|| IdempotencyError::NotStarted {
                key: key.to_string(),
            })?;
        self.finish(&claim, status_code, payload, redirect, ttl).await
    }

    /// Finish the claimed record. Fails with `NotStarted` if the claim has
    /// been abandoned, swept, or replaced after expiring.
    pub async fn finish(
        &self,
        claim: &IdempotencyClaim,
        status_code: u16,
        payload: &(dyn erased_serde::Serialize + Sync),
        redirect: Option<&str>,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let body = match redirect {
            Some(location) => ResponseBody::Redirect {
                location: location.to_string(),
            },
            None => ResponseBody::from_serializable(payload),
        };
        let expires_at = deadline(self.clock.now(), ttl);

        if !self
            .store
            .mark_finished(claim, status_code, &body, expires_at)
            .await?
        {
            return Err(IdempotencyError::NotStarted {
                key: claim.key.clone(),
            }
            .into());
        }
        debug!(key = claim.key.as_str(), status_code, "saved idempotent response");
        Ok(())
    }

    /// Drop an in-flight claim so a retry can run.
    pub async fn abandon_request(&self, key: &str) -> anyhow::Result<()> {
        match self.current_claim(key).await? {
            Some(claim) => self.abandon(&claim).await,
            None => Ok(()),
        }
    }

    /// Drop the claimed record if it is still in flight.
    pub async fn abandon(&self, claim: &IdempotencyClaim) -> anyhow::Result<()> {
        if self.store.remove_started(claim).await? {
            debug!(key = claim.key.as_str(), "abandoned idempotent request");
        }
        Ok(())
    }

    async fn current_claim(&self, key: &str) -> anyhow::Result<Option<IdempotencyClaim>> {
        Ok(self
            .store
            .find(key)
            .await?
            .filter(|record| record.status == IdempotencyStatus::Started)
            .map(|record| IdempotencyClaim::of(&record)))
    }

    pub async fn acquire_lock(&self, key: &str, timeout: Duration) -> anyhow::Result<bool> {
        self.lock.acquire(&lock_name(key), timeout).await
    }

    pub async fn release_lock(&self, key: &str) -> anyhow::Result<()> {
        self.lock.release(&lock_name(key)).await
    }

    /// Delete records created more than `max_age` ago, whatever their
    /// status. `max_age` must exceed the longest plausible request.
    pub async fn delete_expired(&self, max_age: Duration) -> anyhow::Result<u64> {
        let cutoff = cutoff(self.clock.now(), max_age);
        let deleted = self.store.delete_created_before(cutoff).await?;
        info!(deleted, %cutoff, "swept idempotency records");
        Ok(deleted)
    }
}

fn lock_name(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}
