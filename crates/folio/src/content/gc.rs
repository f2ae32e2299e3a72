use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use super::{ContentKey, ContentStore};
use crate::clock::{cutoff, Clock, SystemClock};

/// Produces the set of keys that live records still point at.
///
/// The content store has no back-references, so the collector asks the
/// owning aggregates (typically a `SELECT DISTINCT` over URL columns).
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn referenced_keys(&self) -> anyhow::Result<HashSet<ContentKey>>;
}

#[async_trait]
impl ReferenceSource for HashSet<ContentKey> {
    async fn referenced_keys(&self) -> anyhow::Result<HashSet<ContentKey>> {
        Ok(self.clone())
    }
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    /// Nothing was deleted; `deleted_*` describe what would have been.
    pub dry_run: bool,
    pub files_scanned: u64,
    /// Distinct listed keys that are still referenced.
    pub referenced_keys: u64,
    /// Unreferenced keys kept because a variant is younger than the TTL.
    pub young_keys: u64,
    pub deleted_keys: Vec<ContentKey>,
    pub files_deleted: u64,
    pub bytes_reclaimed: u64,
    /// Non-fatal failures; collection continues past them.
    pub errors: Vec<String>,
}

impl OrphanReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// All stored variants of one key.
#[derive(Default)]
struct Variants {
    newest: Option<DateTime<Utc>>,
    extensions: SmallVec<[Option<String>; 2]>,
    size: u64,
}

/// Deletes stored content that nothing references.
///
/// A key is deleted only if it is absent from the referenced set and the
/// newest modification time across its variants is older than the TTL. The
/// TTL covers uploads whose referencing row has not committed yet.
pub struct OrphanCollector {
    store: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
}

impl OrphanCollector {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn collect(
        &self,
        referenced: &HashSet<ContentKey>,
        ttl: Duration,
        dry_run: bool,
    ) -> OrphanReport {
        let mut report = OrphanReport {
            dry_run,
            ..OrphanReport::default()
        };
        let mut candidates: BTreeMap<ContentKey, Variants> = BTreeMap::new();
        let mut seen_referenced: HashSet<ContentKey> = HashSet::new();

        let mut listing = self.store.list_all_keys();
        while let Some(item) = listing.next().await {
            let object = match item {
                Ok(object) => object,
                Err(error) => {
                    warn!(%error, "content listing error");
                    report.errors.push(error.to_string());
                    continue;
                }
            };
            report.files_scanned += 1;

            if referenced.contains(&object.key) {
                seen_referenced.insert(object.key);
                continue;
            }
            let variants = candidates.entry(object.key).or_default();
            variants.newest = variants.newest.max(Some(object.modified));
            variants.extensions.push(object.extension);
            variants.size += object.size;
        }
        drop(listing);
        report.referenced_keys = seen_referenced.len() as u64;

        let threshold = cutoff(self.clock.now(), ttl);
        for (key, variants) in candidates {
            if variants.newest.is_some_and(|newest| newest >= threshold) {
                debug!(%key, "orphan younger than ttl, kept");
                report.young_keys += 1;
                continue;
            }

            if dry_run {
                report.files_deleted += variants.extensions.len() as u64;
                report.bytes_reclaimed += variants.size;
                report.deleted_keys.push(key);
                continue;
            }

            let mut removed_all = true;
            for extension in &variants.extensions {
                match self.store.delete(&key, extension.as_deref()).await {
                    Ok(()) => report.files_deleted += 1,
                    Err(error) => {
                        warn!(%key, %error, "failed to delete orphaned content");
                        report.errors.push(format!("{key}: {error}"));
                        removed_all = false;
                    }
                }
            }
            if removed_all {
                report.bytes_reclaimed += variants.size;
                report.deleted_keys.push(key);
            }
        }

        info!(
            dry_run,
            scanned = report.files_scanned,
            deleted = report.deleted_keys.len(),
            young = report.young_keys,
            errors = report.errors.len(),
            "orphaned content collected"
        );
        report
    }
}
