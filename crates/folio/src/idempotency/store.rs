use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::record::{IdempotencyClaim, IdempotencyRecord, IdempotencyStatus};
use crate::response::ResponseBody;

/// Durable storage for idempotency records.
///
/// Implementations must enforce one record per key in the storage engine
/// itself (a primary key or unique index), not with read-then-write logic.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// The stored record, expired or not.
    async fn find(&self, key: &str) -> anyhow::Result<Option<IdempotencyRecord>>;

    /// Atomically insert a Started record.
    ///
    /// Returns `None` without writing if a record for the key exists and is
    /// still live at `record.created_at`. An expired record is replaced.
    async fn insert_started(
        &self,
        record: &IdempotencyRecord,
    ) -> anyhow::Result<Option<IdempotencyClaim>>;

    /// Move the claimed Started record to Finished. Returns `false` if the
    /// key has no Started record created at `claim.claimed_at`.
    async fn mark_finished(
        &self,
        claim: &IdempotencyClaim,
        status_code: u16,
        body: &ResponseBody,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Delete the claimed record if it is still Started.
    async fn remove_started(&self, claim: &IdempotencyClaim) -> anyhow::Result<bool>;

    /// Delete every record created before `cutoff`, whatever its status.
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Process-local store. Per-key atomicity comes from DashMap's shard locks.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn find(&self, key: &str) -> anyhow::Result<Option<IdempotencyRecord>> {
        Ok(self.records.get(key).map(|record| record.value().clone()))
    }

    async fn insert_started(
        &self,
        record: &IdempotencyRecord,
    ) -> anyhow::Result<Option<IdempotencyClaim>> {
        match self.records.entry(record.key.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_expired(record.created_at) {
                    return Ok(None);
                }
                existing.insert(record.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        Ok(Some(IdempotencyClaim::of(record)))
    }

    async fn mark_finished(
        &self,
        claim: &IdempotencyClaim,
        status_code: u16,
        body: &ResponseBody,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let Some(mut record) = self.records.get_mut(&claim.key) else {
            return Ok(false);
        };
        if !holds(&record, claim) {
            return Ok(false);
        }
        record.status = IdempotencyStatus::Finished;
        record.status_code = Some(status_code);
        record.response_body = Some(body.clone());
        record.expires_at = expires_at;
        Ok(true)
    }

    async fn remove_started(&self, claim: &IdempotencyClaim) -> anyhow::Result<bool> {
        Ok(self
            .records
            .remove_if(&claim.key, |_, record| holds(record, claim))
            .is_some())
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut deleted = 0;
        self.records.retain(|_, record| {
            let keep = record.created_at >= cutoff;
            if !keep {
                deleted += 1;
            }
            keep
        });
        Ok(deleted)
    }
}

fn holds(record: &IdempotencyRecord, claim: &IdempotencyClaim) -> bool {
    record.status == IdempotencyStatus::Started && record.created_at == claim.claimed_at
}
