//! Test doubles for Folio pipelines.
//!
//! Everything here is in-memory and deterministic: a clock that only moves
//! when told to, event sinks that record what they receive, and a
//! transaction manager whose "table" is a vector of committed rows.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use folio_core::{Clock, FsContentStore, Transaction, TransactionManager};
use folio_outbox::EventSink;
use tempfile::TempDir;

/// A clock that stands still until advanced.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// A clock frozen at the current wall-clock time.
    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self::new(Utc::now()))
    }

    pub fn advance(&self, by: Duration) {
        *self.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.lock() = to;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Records every published event, in delivery order.
pub struct RecordingSink<E> {
    events: Mutex<Vec<E>>,
}

impl<E> Default for RecordingSink<E> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> RecordingSink<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<E> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }
}

#[async_trait]
impl<E: Clone + Send + 'static> EventSink<E> for RecordingSink<E> {
    async fn publish(&self, event: E) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

/// Rejects every event and counts the attempts.
#[derive(Debug, Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E: Send + 'static> EventSink<E> for FailingSink {
    async fn publish(&self, _event: E) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("event sink unavailable")
    }
}

#[derive(Debug, Default)]
struct Ledger {
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    fail_commit: AtomicBool,
    rows: Mutex<Vec<String>>,
}

/// Hands out [`MemoryTransaction`]s that stage rows and apply them on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransactionManager {
    ledger: Arc<Ledger>,
}

impl MemoryTransactionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later commit fail before anything is applied.
    pub fn fail_commits(&self, fail: bool) {
        self.ledger.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn begun(&self) -> usize {
        self.ledger.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> usize {
        self.ledger.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.ledger.rolled_back.load(Ordering::SeqCst)
    }

    /// Rows applied by committed transactions.
    pub fn rows(&self) -> Vec<String> {
        self.ledger
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TransactionManager for MemoryTransactionManager {
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        self.ledger.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            ledger: self.ledger.clone(),
            staged: Vec::new(),
        }))
    }
}

/// A transaction over [`MemoryTransactionManager`]'s row list.
#[derive(Debug)]
pub struct MemoryTransaction {
    ledger: Arc<Ledger>,
    staged: Vec<String>,
}

impl MemoryTransaction {
    /// Stage a row; it becomes visible only if the transaction commits.
    pub fn insert(&mut self, row: impl Into<String>) {
        self.staged.push(row.into());
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let Self { ledger, staged } = *self;
        if ledger.fail_commit.load(Ordering::SeqCst) {
            anyhow::bail!("commit rejected by test ledger");
        }
        ledger
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(staged);
        ledger.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.ledger.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A filesystem content store rooted in a temporary directory.
///
/// The directory is removed when the value is dropped.
pub struct TempContentStore {
    pub dir: TempDir,
    pub store: Arc<FsContentStore>,
}

pub fn temp_content_store() -> std::io::Result<TempContentStore> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FsContentStore::new(dir.path(), "https://media.test/files"));
    Ok(TempContentStore { dir, store })
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::TransactionHandle;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::starting_now();
        let start = clock.now();

        clock.advance(Duration::minutes(5));

        assert_eq!(clock.now() - start, Duration::minutes(5));
    }

    #[tokio::test]
    async fn staged_rows_apply_on_commit_only() {
        let manager = MemoryTransactionManager::new();

        let mut handle = TransactionHandle::new(manager.begin().await.unwrap());
        handle
            .downcast_mut::<MemoryTransaction>()
            .unwrap()
            .insert("kept");
        handle.commit().await.unwrap();

        let mut handle = TransactionHandle::new(manager.begin().await.unwrap());
        handle
            .downcast_mut::<MemoryTransaction>()
            .unwrap()
            .insert("dropped");
        handle.rollback().await.unwrap();

        assert_eq!(manager.rows(), vec!["kept".to_string()]);
        assert_eq!((manager.begun(), manager.committed(), manager.rolled_back()), (2, 1, 1));
    }

    #[tokio::test]
    async fn failing_sink_counts_attempts() {
        let sink = FailingSink::new();

        assert!(EventSink::<u32>::publish(sink.as_ref(), 1).await.is_err());
        assert_eq!(sink.attempts(), 1);
    }
}
