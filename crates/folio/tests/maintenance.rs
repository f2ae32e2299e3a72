//! Content deduplication and the two maintenance sweeps.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use folio_core::content::{ByteStream, ContentKey, OrphanCollector};
use folio_core::maintenance::{sweep_idempotency_records, sweep_orphaned_content};
use folio_core::{ContentStore, IdempotencyCoordinator, LocalLock, MemoryIdempotencyStore};
use folio_testing::{temp_content_store, ManualClock};

fn bytes(data: Vec<u8>) -> ByteStream {
    Box::new(std::io::Cursor::new(data))
}

#[tokio::test]
async fn saving_identical_bytes_twice_is_a_no_op() {
    let content = temp_content_store().unwrap();
    let data: Vec<u8> = (0..100_000).map(|_| fastrand::u8(..)).collect();

    let first = content
        .store
        .save(bytes(data.clone()), Some("pdf"))
        .await
        .unwrap();
    let path = content.store.path_for(&first.key, Some("pdf"));
    let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = content.store.save(bytes(data.clone()), Some("pdf")).await.unwrap();

    assert_eq!(first.key, second.key);
    assert_eq!(first.key, ContentKey::of_bytes(&data));
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
    assert_eq!(first.size, 100_000);
}

#[tokio::test]
async fn idempotency_sweep_deletes_by_creation_time() {
    let clock = ManualClock::starting_now();
    let coordinator = IdempotencyCoordinator::new(
        Arc::new(MemoryIdempotencyStore::new()),
        Arc::new(LocalLock::new()),
    )
    .with_clock(clock.clone());
    let ttl = Duration::from_secs(7 * 24 * 3600);

    coordinator.start_request("old", ttl).await.unwrap();
    clock.advance(chrono::Duration::hours(2));
    coordinator.start_request("recent", ttl).await.unwrap();
    clock.advance(chrono::Duration::hours(23));

    // "old" is 25h old, "recent" 23h.
    assert_eq!(sweep_idempotency_records(&coordinator, 24).await.unwrap(), 1);
    assert!(coordinator.get_record("old").await.unwrap().is_none());
    assert!(coordinator.get_record("recent").await.unwrap().is_some());

    clock.advance(chrono::Duration::hours(2));
    assert_eq!(sweep_idempotency_records(&coordinator, 24).await.unwrap(), 1);
    assert!(coordinator.get_record("recent").await.unwrap().is_none());
}

#[tokio::test]
async fn orphan_sweep_respects_ttl_and_references() {
    let content = temp_content_store().unwrap();
    let store = content.store.clone();
    let kept = store.save(bytes(b"kept".to_vec()), Some("jpg")).await.unwrap();
    let orphan = store.save(bytes(b"orphan".to_vec()), Some("jpg")).await.unwrap();
    let references = HashSet::from([kept.key.clone()]);

    let clock = ManualClock::starting_now();
    let collector = OrphanCollector::new(store.clone()).with_clock(clock.clone());

    let young = sweep_orphaned_content(&collector, &references, 1, false)
        .await
        .unwrap();
    assert_eq!(young.young_keys, 1);
    assert!(store.exists(&orphan.key, Some("jpg")).await.unwrap());

    clock.advance(chrono::Duration::hours(2));
    let dry = sweep_orphaned_content(&collector, &references, 1, true)
        .await
        .unwrap();
    assert_eq!(dry.deleted_keys, vec![orphan.key.clone()]);
    assert!(store.exists(&orphan.key, Some("jpg")).await.unwrap());

    let swept = sweep_orphaned_content(&collector, &references, 1, false)
        .await
        .unwrap();
    assert_eq!(swept.deleted_keys, vec![orphan.key.clone()]);
    assert_eq!(swept.referenced_keys, 1);
    assert!(!swept.has_errors());
    assert!(!store.exists(&orphan.key, Some("jpg")).await.unwrap());
    assert!(store.exists(&kept.key, Some("jpg")).await.unwrap());
}
