//! Periodic cleanup jobs.
//!
//! Both sweeps are safe to run concurrently with live traffic and are meant
//! to be driven by a scheduler (cron, a k8s CronJob, or `folio` from
//! `folio-cli`).

use std::time::Duration;

use anyhow::Context as _;
use tracing::info;

use crate::content::{OrphanCollector, OrphanReport, ReferenceSource};
use crate::idempotency::IdempotencyCoordinator;

const SECS_PER_HOUR: u64 = 3600;

/// Delete idempotency records created more than `max_age_hours` ago.
///
/// `max_age_hours` must be longer than any request can run, or a Started
/// record may be removed while its request is still in flight.
pub async fn sweep_idempotency_records(
    coordinator: &IdempotencyCoordinator,
    max_age_hours: u64,
) -> anyhow::Result<u64> {
    let max_age = hours(max_age_hours);
    let deleted = coordinator
        .delete_expired(max_age)
        .await
        .context("failed to sweep idempotency records")?;
    info!(max_age_hours, deleted, "idempotency sweep finished");
    Ok(deleted)
}

/// Delete stored content that no record references and that is older than
/// `ttl_hours`.
pub async fn sweep_orphaned_content(
    collector: &OrphanCollector,
    references: &dyn ReferenceSource,
    ttl_hours: u64,
    dry_run: bool,
) -> anyhow::Result<OrphanReport> {
    let referenced = references
        .referenced_keys()
        .await
        .context("failed to load referenced content keys")?;
    let report = collector
        .collect(&referenced, hours(ttl_hours), dry_run)
        .await;
    info!(
        ttl_hours,
        dry_run,
        referenced = referenced.len(),
        deleted = report.deleted_keys.len(),
        "content sweep finished"
    );
    Ok(report)
}

fn hours(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(SECS_PER_HOUR))
}
